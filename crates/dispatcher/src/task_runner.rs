//! 任务执行
//!
//! 先用带版本守卫的保存把任务置为 RUNNING 来占有它，保存失败说明别的实例已经拿到，
//! 直接放弃。执行结束后再做一次守卫保存。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use jobs_core::{go_items, EngineConfig, JobsError, JobsResult};
use jobs_domain::{
    JobDefFilter, JobRunFilter, JobTaskFilter, ListRequest, RunState, Sorting, TaskState,
};
use jobs_infrastructure::StructuredLogger;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{with_timeout, EngineInner};
use crate::handler::RawContext;
use crate::storage::{JobRunWithDef, JobTaskWithRun, Load};

/// 有任务可做时的下一轮间隔，给其他实例留出取任务的机会
const BUSY_INTERVAL: Duration = Duration::from_millis(123);

/// 执行期间登记在取消表中，结束时移除
struct CancelerGuard<'a> {
    inner: &'a EngineInner,
    task_id: String,
}

impl Drop for CancelerGuard<'_> {
    fn drop(&mut self) {
        // 已被取消清扫取走时为 None
        if let Some(token) = self.inner.set_task_canceler(&self.task_id, None) {
            token.cancel();
        }
    }
}

impl EngineInner {
    /// 取一批 PENDING 任务并执行，返回下一轮的等待时间
    pub(crate) async fn run_tasks(self: &Arc<Self>) -> Duration {
        let storage = self.storage();
        let req = ListRequest::with_page_size(self.config.fetch_tasks_to_run);
        let filter = JobTaskFilter::new().with_states([TaskState::Pending]);
        let pending = match with_timeout(
            self.config.timeout_short(),
            storage.list_job_tasks(&req, &filter, Load::BestEffort, Load::BestEffort),
        )
        .await
        {
            Ok(page) => page.items,
            Err(err) => {
                self.log_err("run_tasks", &err);
                return self.config.interval_run_tasks();
            }
        };

        let mut manual_runs_possible = false;
        let mut soonest_due = None;
        if pending.is_empty() {
            manual_runs_possible = self.manual_runs_possible().await;
            if !manual_runs_possible {
                match storage
                    .find_job_run(
                        &JobRunFilter::new().with_states([RunState::Pending]),
                        &[Sorting::asc("due_time")],
                        Load::Skip,
                    )
                    .await
                {
                    Ok(upcoming) => soonest_due = upcoming.map(|loaded| loaded.run.due_time),
                    Err(err) => self.log_err("run_tasks", &err),
                }
            }
        }

        let fetched = pending.len();
        let inner = Arc::clone(self);
        // 处理器调用自带超时，这里不再限时
        go_items(
            pending,
            self.config.max_concurrent_ops,
            None,
            move |loaded: JobTaskWithRun| {
                let inner = Arc::clone(&inner);
                async move {
                    if let Err(err) = inner.run_task(loaded).await {
                        inner.log_err("run_task", &err);
                    }
                }
            },
        )
        .await;

        next_run_tasks_interval(
            &self.config,
            fetched,
            soonest_due,
            manual_runs_possible,
            self.clock.now(),
        )
    }

    async fn manual_runs_possible(&self) -> bool {
        match self
            .storage()
            .find_job_def(&JobDefFilter::new().with_allow_manual_job_runs(true))
            .await
        {
            Ok(def) => def.is_some(),
            Err(err) => {
                self.log_err("manual_runs_possible", &err);
                true
            }
        }
    }

    pub(crate) async fn run_task(self: &Arc<Self>, loaded: JobTaskWithRun) -> JobsResult<()> {
        let started = Instant::now();
        let JobTaskWithRun { mut task, run } = loaded;
        let token = self.root_token().child_token();
        if let Some(previous) = self.set_task_canceler(&task.id, Some(token.clone())) {
            previous.cancel();
        }
        let _guard = CancelerGuard {
            inner: self,
            task_id: task.id.clone(),
        };

        let (run, def) = match run {
            Some(JobRunWithDef { run, def }) => (Some(run), def),
            None => (None, None),
        };
        let handler = def
            .as_ref()
            .and_then(|def| self.registry.create(&def.handler_id));
        let already_cancelled = match (&run, &def, &handler) {
            (Some(run), Some(def), Some(_)) => {
                run.is_cancelling_or_cancelled()
                    || def.disabled
                    || task.handler_id != def.handler_id
                    || run.handler_id != def.handler_id
            }
            _ => true,
        };
        let def_id = run
            .as_ref()
            .map(|run| run.job_def_id.clone())
            .unwrap_or_else(|| task.handler_id.clone());

        // 占有任务
        let now = self.clock.now();
        task.state = if already_cancelled {
            TaskState::Cancelled
        } else {
            TaskState::Running
        };
        task.finish_time = None;
        task.begin_attempt(now);
        if task.start_time.is_none() {
            task.start_time = Some(now);
        }
        if self.log_task_lifecycle(def.as_ref()) {
            let event = if already_cancelled {
                "job_task_cancelled"
            } else {
                "job_task_started"
            };
            StructuredLogger::log_task_transition(&task, &def_id, event);
        }
        self.storage().save_job_task(&mut task).await?;
        self.metrics.record_task_attempt(&task);

        let mut failure: Option<JobsError> = None;
        let mut timed_out = false;
        let mut cancelled = false;
        match (&run, &def, &handler) {
            (None, _, _) => failure = Some(JobsError::job_run_not_found(&task.job_run_id)),
            (Some(run), None, _) => failure = Some(JobsError::job_def_not_found(&run.job_def_id)),
            (Some(_), Some(def), None) => {
                failure = Some(JobsError::HandlerRemoved {
                    def_id: def.id.clone(),
                    handler_id: def.handler_id.clone(),
                })
            }
            (Some(run), Some(def), Some(handler)) if !already_cancelled => {
                let ctx = RawContext {
                    job_def: Arc::new(def.clone()),
                    job_run_id: run.id.clone(),
                    job_task_id: Some(task.id.clone()),
                    details: run.details.clone(),
                    cancel: token.clone(),
                };
                let call = handler.task_results(&ctx, task.details.as_ref());
                let execution = execute(&token, def.task_run_timeout(), call).await;
                match execution {
                    Execution::Finished(Ok(results)) => task.results = Some(results),
                    Execution::Finished(Err(err)) => failure = Some(err),
                    Execution::TimedOut => timed_out = true,
                    Execution::Cancelled => cancelled = true,
                }
            }
            _ => {}
        }

        // 记录结果
        let now = self.clock.now();
        task.state = if already_cancelled {
            TaskState::Cancelled
        } else {
            TaskState::Done
        };
        task.finish_time = Some(now);
        let mut retried = false;
        if cancelled {
            task.state = TaskState::Cancelled;
        } else if !already_cancelled {
            let retryable = timed_out
                || match (&failure, &handler) {
                    (Some(err), Some(handler)) => handler.is_task_err_retryable(err),
                    _ => false,
                };
            if retryable {
                retried = task.mark_for_retry_or_as_failed(now, def.as_ref().map(|def| def.task_retries));
            }
        }
        if failure.is_none() && timed_out {
            failure = Some(JobsError::Timeout(format!(
                "task '{}' deadline exceeded",
                task.id
            )));
        } else if failure.is_none() && cancelled {
            failure = Some(JobsError::Cancelled);
        }
        if let Some(err) = &failure {
            task.set_latest_error_if_none(err.to_string());
            self.log_err("task_results", err);
        }

        let elapsed = started.elapsed();
        if self.log_task_lifecycle(def.as_ref()) {
            StructuredLogger::log_task_executed(&task, &def_id, elapsed);
        }
        self.storage().save_job_task(&mut task).await?;
        self.metrics.record_task_executed(&task, retried, elapsed);
        if retried {
            debug!("任务 {} 将重试（已尝试 {} 次）", task.id, task.attempts.len());
        }

        if let Some(hook) = self.task_executed_hook() {
            hook(&task, elapsed);
        }
        Ok(())
    }
}

enum Execution<T> {
    Finished(JobsResult<T>),
    TimedOut,
    Cancelled,
}

/// 在超时和取消令牌下执行处理器调用
async fn execute<T>(
    token: &CancellationToken,
    timeout: Duration,
    call: impl std::future::Future<Output = JobsResult<T>>,
) -> Execution<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Execution::Cancelled,
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(result) => Execution::Finished(result),
            Err(_) => Execution::TimedOut,
        },
    }
}

/// 忙时快速轮询；空闲时放慢，有已知的最近计划时间则等到那时
fn next_run_tasks_interval(
    config: &EngineConfig,
    fetched: usize,
    soonest_due: Option<DateTime<Utc>>,
    manual_runs_possible: bool,
    now: DateTime<Utc>,
) -> Duration {
    if fetched > 0 {
        return BUSY_INTERVAL;
    }
    match soonest_due {
        Some(due) if !manual_runs_possible => match (due - now).to_std() {
            Ok(wait) if due > now => {
                wait.min(config.interval_ensure_job_schedules())
                    + config.interval_start_and_finalize_jobs()
            }
            _ => config.interval_run_tasks(),
        },
        _ => config.interval_run_tasks() * 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_busy_interval() {
        let config = EngineConfig::default();
        assert_eq!(next_run_tasks_interval(&config, 3, None, false, now()), BUSY_INTERVAL);
    }

    #[test]
    fn test_idle_interval_doubles() {
        let config = EngineConfig::default();
        assert_eq!(
            next_run_tasks_interval(&config, 0, None, false, now()),
            config.interval_run_tasks() * 2
        );
        // 可能有手动作业时忽略计划时间
        let due = now() + chrono::Duration::seconds(30);
        assert_eq!(
            next_run_tasks_interval(&config, 0, Some(due), true, now()),
            config.interval_run_tasks() * 2
        );
    }

    #[test]
    fn test_idle_interval_waits_for_soonest_due() {
        let config = EngineConfig::default();
        let due = now() + chrono::Duration::seconds(30);
        assert_eq!(
            next_run_tasks_interval(&config, 0, Some(due), false, now()),
            Duration::from_secs(30) + config.interval_start_and_finalize_jobs()
        );

        let far = now() + chrono::Duration::hours(3);
        assert_eq!(
            next_run_tasks_interval(&config, 0, Some(far), false, now()),
            config.interval_ensure_job_schedules() + config.interval_start_and_finalize_jobs()
        );

        let overdue = now() - chrono::Duration::seconds(5);
        assert_eq!(
            next_run_tasks_interval(&config, 0, Some(overdue), false, now()),
            config.interval_run_tasks()
        );
    }

    #[tokio::test]
    async fn test_execute_outcomes() {
        let token = CancellationToken::new();
        let done = execute(&token, Duration::from_secs(1), async { Ok::<_, JobsError>(7) }).await;
        assert!(matches!(done, Execution::Finished(Ok(7))));

        let slow = execute(&token, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, JobsError>(0)
        })
        .await;
        assert!(matches!(slow, Execution::TimedOut));

        token.cancel();
        let cancelled = execute(&token, Duration::from_secs(1), async { Ok::<_, JobsError>(1) }).await;
        assert!(matches!(cancelled, Execution::Cancelled));
    }
}
