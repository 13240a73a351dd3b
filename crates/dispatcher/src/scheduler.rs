//! 按调度规则为作业定义创建作业运行
//!
//! 同一前驱只能产生一个后继：`scheduled_next_after` 在存储中唯一，
//! 多个引擎实例并发调度时由存储裁决。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobs_core::{go_items, JobsError, JobsResult};
use jobs_domain::{
    default_job_run_sorting, CancellationReason, JobDef, JobDefFilter, JobRun, JobRunFilter,
    PayloadMap, RunState,
};
use jobs_infrastructure::StructuredLogger;
use tracing::info;

use crate::engine::{new_id, with_timeout, EngineInner};
use crate::storage::{JobRunWithDef, Load, Storage};

const AUTO_PREFIX: &str = "_none_";
const MANUAL_PREFIX: &str = "_manual_";

impl EngineInner {
    /// 确保每个启用的作业定义都有下一次作业运行
    pub(crate) async fn ensure_job_schedules(self: &Arc<Self>) {
        let filter = JobDefFilter::new()
            .with_disabled(false)
            .with_enabled_schedules();
        let defs = match with_timeout(
            self.config.timeout_short(),
            self.storage().list_job_defs(&filter),
        )
        .await
        {
            Ok(defs) => defs,
            Err(err) => {
                self.log_err("ensure_job_schedules", &err);
                return;
            }
        };

        let inner = Arc::clone(self);
        go_items(
            defs,
            self.config.max_concurrent_ops,
            Some(self.config.timeout_short()),
            move |def: JobDef| {
                let inner = Arc::clone(&inner);
                async move {
                    if let Err(err) = inner.ensure_job_def_scheduled(&def).await {
                        inner.log_err("ensure_job_def_scheduled", &err);
                    }
                }
            },
        )
        .await;
    }

    pub(crate) async fn ensure_job_def_scheduled(self: &Arc<Self>, def: &JobDef) -> JobsResult<()> {
        let storage = self.storage();
        let latest = storage
            .find_job_run(
                &JobRunFilter::new()
                    .with_job_defs([def.id.as_str()])
                    .with_auto_scheduled(true),
                &default_job_run_sorting(),
                Load::Skip,
            )
            .await?
            .map(|loaded| loaded.run);

        let mut latest = match latest {
            Some(run) if matches!(run.state, RunState::Running | RunState::Cancelling) => {
                return Ok(());
            }
            Some(run) if run.state == RunState::Pending => run,
            last => return self.schedule_job(storage, def, last.as_ref()).await,
        };

        // 未来的 PENDING 作业运行：调度规则可能在它创建之后变过
        let now = self.clock.now();
        if latest.due_time <= now {
            return Ok(());
        }
        let last_finished = storage
            .find_job_run(
                &JobRunFilter::new()
                    .with_job_defs([def.id.as_str()])
                    .with_states([RunState::Done, RunState::Cancelled]),
                &default_job_run_sorting(),
                Load::Skip,
            )
            .await?;
        let after = last_finished.map(|loaded| loaded.run.last_time());
        let Some(due_time) = def.find_closest_to_now_schedulable_time_since(now, after, true) else {
            let errors = self
                .cancel_runs(
                    Some(CancellationReason::DefChanged),
                    vec![JobRunWithDef {
                        run: latest,
                        def: Some(def.clone()),
                    }],
                )
                .await;
            return match errors.into_iter().next() {
                Some((_, err)) => Err(err),
                None => Ok(()),
            };
        };

        if !def.ok(&latest.due_time) || due_time != latest.due_time {
            if self.log_job_lifecycle(Some(def)) {
                info!(
                    event = "job_run_rescheduled",
                    job_def = %def.id,
                    job_run = %latest.id,
                    from = %latest.due_time,
                    to = %due_time,
                    "更新过期的作业运行计划时间"
                );
            }
            latest.due_time = due_time;
            storage.save_job_run(&mut latest).await?;
        }
        Ok(())
    }

    /// 以 `last` 为前驱安排下一次作业运行；定义已禁用、处理器缺失或没有启用的规则时什么都不做
    pub(crate) async fn schedule_job(
        &self,
        storage: Storage<'_>,
        def: &JobDef,
        last: Option<&JobRun>,
    ) -> JobsResult<()> {
        if def.disabled || !storage.has_handler(def) {
            return Ok(());
        }
        let after = last.map(JobRun::last_time);
        let Some(due_time) =
            def.find_closest_to_now_schedulable_time_since(self.clock.now(), after, true)
        else {
            return Ok(());
        };
        self.create_job_run_in(storage, def, due_time, None, last, true)
            .await
            .map(|_| ())
    }

    /// 创建 PENDING 作业运行；自动调度且已有同一前驱的后继时返回那个已有的作业运行
    pub(crate) async fn create_job_run_in(
        &self,
        storage: Storage<'_>,
        def: &JobDef,
        due_time: DateTime<Utc>,
        details: Option<PayloadMap>,
        last: Option<&JobRun>,
        auto_scheduled: bool,
    ) -> JobsResult<JobRun> {
        if def.disabled {
            return Err(JobsError::JobDefDisabled {
                def_id: def.id.clone(),
            });
        }
        if !auto_scheduled && !def.allow_manual_job_runs {
            return Err(JobsError::ManualRunsNotAllowed {
                def_id: def.id.clone(),
            });
        }

        let mut run = JobRun::new_pending(new_id(&def.id), &def.id, &def.handler_id, due_time);
        run.auto_scheduled = auto_scheduled;
        run.details = details;
        run.scheduled_next_after = format!(
            "{}{}",
            if auto_scheduled { AUTO_PREFIX } else { MANUAL_PREFIX },
            new_id(&def.id)
        );
        if let (true, Some(last)) = (auto_scheduled, last) {
            run.scheduled_next_after = last.id.clone();
            let existing = storage
                .find_job_run(
                    &JobRunFilter::new().with_scheduled_next_after(last.id.as_str()),
                    &[],
                    Load::Skip,
                )
                .await?;
            if let Some(existing) = existing {
                return Ok(existing.run);
            }
        }

        if self.log_job_lifecycle(Some(def)) {
            StructuredLogger::log_job_run_transition(&run, "job_run_created");
        }
        storage.insert_job_runs(vec![run.clone()]).await?;
        self.metrics.record_job_run_created(&run);
        Ok(run)
    }
}

