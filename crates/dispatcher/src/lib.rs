//! 作业调度与执行引擎
//!
//! [`Engine`] 持有存储、处理器注册表与配置，后台循环负责调度、启动、执行、
//! 收尾和清理作业运行。多个引擎实例可以共享同一个存储。

mod cleanup_service;
pub mod engine;
pub mod handler;
mod lifecycle;
mod recovery_service;
pub mod registry;
mod scheduler;
pub mod storage;
mod task_runner;

pub use engine::{Engine, JobRunFinalizedHook, JobTaskExecutedHook};
pub use handler::{
    FinalTaskQuery, Handler, JobContext, JobResultsCollector, Payload, ResultsCollector,
    TaskEmitter, TaskOutcome,
};
pub use registry::HandlerRegistry;
pub use storage::{JobRunWithDef, JobTaskWithRun, Load, Storage};
