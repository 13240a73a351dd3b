//! 作业生命周期的结构化日志
//!
//! 字段命名固定为 `job_def`、`job_type`、`job_run`、`job_task`，
//! 方便按作业定义或处理器聚合检索。

use std::time::Duration;

use jobs_core::JobsError;
use jobs_domain::{JobRun, JobTask};
use tracing::{error, info, warn};

pub struct StructuredLogger;

impl StructuredLogger {
    /// 作业运行状态迁移
    pub fn log_job_run_transition(run: &JobRun, event: &'static str) {
        info!(
            event = event,
            job_def = %run.job_def_id,
            job_type = %run.handler_id,
            job_run = %run.id,
            state = %run.state,
            cancellation_reason = run.cancellation_reason.map(|r| r.as_str()),
            due_time = %run.due_time,
            auto_scheduled = run.auto_scheduled,
            "作业运行状态变更"
        );
    }

    /// 作业任务状态迁移
    pub fn log_task_transition(task: &JobTask, job_def_id: &str, event: &'static str) {
        info!(
            event = event,
            job_def = %job_def_id,
            job_type = %task.handler_id,
            job_run = %task.job_run_id,
            job_task = %task.id,
            state = %task.state,
            attempts = task.attempts.len(),
            error = task.latest_error(),
            "作业任务状态变更"
        );
    }

    pub fn log_task_executed(task: &JobTask, job_def_id: &str, duration: Duration) {
        info!(
            event = "job_task_executed",
            job_def = %job_def_id,
            job_type = %task.handler_id,
            job_run = %task.job_run_id,
            job_task = %task.id,
            state = %task.state,
            duration_ms = duration.as_millis() as u64,
            error = task.latest_error(),
            "作业任务执行结束"
        );
    }

    pub fn log_job_def_invalid(job_def_id: &str, err: &JobsError) {
        warn!(
            event = "job_def_invalid",
            job_def = %job_def_id,
            error = %err,
            "作业定义无效，已跳过"
        );
    }

    /// 记录后台操作的错误；版本冲突表示其他实例已处理，不记录
    pub fn log_err(operation: &str, err: &JobsError) {
        if !Self::should_log(err) {
            return;
        }
        error!(
            event = "engine_error",
            operation = operation,
            error = %err,
            "后台操作失败"
        );
    }

    pub fn log_loop_panic(loop_name: &str, message: &str) {
        error!(
            event = "engine_loop_panic",
            loop_name = loop_name,
            panic = message,
            "后台循环本轮发生panic，已恢复"
        );
    }

    pub fn should_log(err: &JobsError) -> bool {
        !err.is_version_conflict()
    }
}
