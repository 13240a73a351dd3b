//! 引擎指标
//!
//! 只通过 `metrics` 门面记录，是否导出以及导出到哪里由宿主程序安装的 recorder 决定。

use std::time::Duration;

use jobs_domain::{JobRun, JobTask, RunState};
use metrics::{counter, histogram, Histogram};
use tracing::debug;

pub struct EngineMetrics {
    task_duration: Histogram,
    job_prep_duration: Histogram,
    job_finalize_duration: Histogram,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            task_duration: histogram!("jobs_task_duration_seconds"),
            job_prep_duration: histogram!("jobs_run_prep_duration_seconds"),
            job_finalize_duration: histogram!("jobs_run_finalize_duration_seconds"),
        }
    }

    pub fn record_job_run_created(&self, run: &JobRun) {
        counter!(
            "jobs_runs_created_total",
            "job_type" => run.handler_id.clone(),
            "auto_scheduled" => run.auto_scheduled.to_string()
        )
        .increment(1);
    }

    pub fn record_job_run_started(&self, run: &JobRun, prep: Duration) {
        counter!("jobs_runs_started_total", "job_type" => run.handler_id.clone()).increment(1);
        self.job_prep_duration.record(prep.as_secs_f64());
    }

    pub fn record_job_run_finished(&self, run: &JobRun, finalize: Option<Duration>) {
        match run.state {
            RunState::Done => {
                counter!("jobs_runs_finalized_total", "job_type" => run.handler_id.clone())
                    .increment(1);
                if let Some(finalize) = finalize {
                    self.job_finalize_duration.record(finalize.as_secs_f64());
                }
            }
            RunState::Cancelled => {
                let reason = run
                    .cancellation_reason
                    .map(|r| r.as_str())
                    .unwrap_or("requested");
                counter!(
                    "jobs_runs_cancelled_total",
                    "job_type" => run.handler_id.clone(),
                    "reason" => reason
                )
                .increment(1);
            }
            state => debug!("作业运行 {} 尚未结束 ({state})，不记录", run.id),
        }
    }

    pub fn record_task_attempt(&self, task: &JobTask) {
        counter!("jobs_task_attempts_total", "job_type" => task.handler_id.clone()).increment(1);
    }

    /// 一次任务执行的结果：`retried` 表示重新回到待运行
    pub fn record_task_executed(&self, task: &JobTask, retried: bool, duration: Duration) {
        self.task_duration.record(duration.as_secs_f64());
        if retried {
            counter!("jobs_task_retries_total", "job_type" => task.handler_id.clone())
                .increment(1);
        } else if task.failed() {
            counter!("jobs_task_failures_total", "job_type" => task.handler_id.clone())
                .increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobs_domain::CancellationReason;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = EngineMetrics::new();
        let mut run = JobRun::new_pending("r1", "nightly", "report", Utc::now());
        metrics.record_job_run_created(&run);
        metrics.record_job_run_started(&run, Duration::from_millis(5));

        run.state = RunState::Cancelled;
        run.cancellation_reason = Some(CancellationReason::Duplicate);
        metrics.record_job_run_finished(&run, None);

        let mut task = JobTask::new_pending("r1", 1, "report", None);
        task.begin_attempt(Utc::now());
        metrics.record_task_attempt(&task);
        task.set_latest_error_if_none("boom");
        task.mark_for_retry_or_as_failed(Utc::now(), Some(0));
        metrics.record_task_executed(&task, false, Duration::from_millis(40));
    }
}
