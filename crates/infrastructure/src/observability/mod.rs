//! 可观测性：结构化生命周期日志与引擎指标

pub mod metrics_collector;
pub mod structured_logger;

pub use metrics_collector::EngineMetrics;
pub use structured_logger::StructuredLogger;
