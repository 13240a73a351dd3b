//! 死任务恢复
//!
//! 执行者在任务开始后崩溃时，任务会一直停在 RUNNING。超过任务超时再加一分钟仍未结束的，
//! 按重试额度重新排队或直接以失败结束；定义已失效的作业运行下未结束的任务全部取消。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use jobs_core::{go_items, JobsResult};
use jobs_domain::{JobDef, JobRunFilter, JobTaskFilter, ListRequest, RunState, TaskState};
use jobs_infrastructure::StructuredLogger;

use crate::engine::{with_timeout, EngineInner};
use crate::storage::Load;

/// 超过任务超时后再等待的宽限分钟数
const DEAD_TASK_GRACE_MINUTES: i64 = 1;

struct RunningGroup {
    def_id: String,
    def: Option<JobDef>,
    job_run_ids: Vec<String>,
}

impl EngineInner {
    pub(crate) async fn expire_or_retry_dead_tasks(self: &Arc<Self>) {
        let filter = JobRunFilter::new().with_states([RunState::Running]);
        let running = match with_timeout(
            self.config.timeout_short(),
            self.storage().list_all_job_runs(&filter, Load::BestEffort),
        )
        .await
        {
            Ok(runs) => runs,
            Err(err) => {
                self.log_err("expire_or_retry_dead_tasks", &err);
                return;
            }
        };

        let mut groups: HashMap<String, RunningGroup> = HashMap::new();
        for loaded in running {
            let group = groups
                .entry(loaded.run.job_def_id.clone())
                .or_insert_with(|| RunningGroup {
                    def_id: loaded.run.job_def_id.clone(),
                    def: loaded.def.clone(),
                    job_run_ids: Vec::new(),
                });
            group.job_run_ids.push(loaded.run.id);
        }

        let inner = Arc::clone(self);
        go_items(
            groups.into_values().collect(),
            self.config.max_concurrent_ops,
            Some(self.config.timeout_short()),
            move |group: RunningGroup| {
                let inner = Arc::clone(&inner);
                async move {
                    if let Err(err) = inner.expire_or_retry_dead_tasks_for(group).await {
                        inner.log_err("expire_or_retry_dead_tasks", &err);
                    }
                }
            },
        )
        .await;
    }

    async fn expire_or_retry_dead_tasks_for(&self, group: RunningGroup) -> JobsResult<()> {
        let storage = self.storage();
        let now = self.clock.now();
        let live_def = group
            .def
            .as_ref()
            .filter(|def| !def.disabled && storage.has_handler(def));

        let filter = JobTaskFilter::new().with_job_runs(group.job_run_ids);
        let filter = match live_def {
            Some(def) => {
                let timeout = Duration::from_std(def.task_run_timeout()).unwrap_or(Duration::zero());
                filter
                    .with_states([TaskState::Running])
                    .with_started_before(now - (timeout + Duration::minutes(DEAD_TASK_GRACE_MINUTES)))
            }
            None => filter.with_states([TaskState::Running, TaskState::Pending]),
        };
        let dead = storage
            .list_job_tasks(&ListRequest::unpaged(), &filter, Load::Skip, Load::Skip)
            .await?
            .items;

        for loaded in dead {
            let mut task = loaded.task;
            let event = match live_def {
                Some(def) => {
                    task.mark_for_retry_or_as_failed(now, Some(def.task_retries));
                    task.set_latest_error_if_none("deadline exceeded");
                    "job_task_expired"
                }
                None => {
                    task.state = TaskState::Cancelled;
                    task.finish_time = Some(now);
                    task.set_latest_error_if_none("cancelled");
                    "job_task_cancelled"
                }
            };
            if self.log_task_lifecycle(group.def.as_ref()) {
                StructuredLogger::log_task_transition(&task, &group.def_id, event);
            }
            if let Err(err) = storage.save_job_task(&mut task).await {
                self.log_err("expire_dead_task", &err);
            }
        }
        Ok(())
    }
}
