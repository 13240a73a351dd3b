//! 删除超过保留期的作业运行

use std::sync::Arc;

use chrono::Duration;
use jobs_core::JobsResult;
use jobs_domain::{tx_fn, JobDef, JobDefFilter, JobRunFilter, JobTaskFilter, RunState};
use jobs_infrastructure::StructuredLogger;

use crate::engine::{with_timeout, EngineInner};
use crate::storage::Load;

impl EngineInner {
    pub(crate) async fn delete_storage_expired_jobs(self: &Arc<Self>) {
        let result = with_timeout(self.config.timeout_short(), async {
            let defs = self
                .storage()
                .list_job_defs(&JobDefFilter::new().with_storage_expiry(true))
                .await?;
            for def in &defs {
                if let Err(err) = self.delete_storage_expired_jobs_for(def).await {
                    self.log_err("delete_storage_expired_jobs", &err);
                }
            }
            Ok(())
        })
        .await;
        if let Err(err) = result {
            self.log_err("delete_storage_expired_jobs", &err);
        }
    }

    async fn delete_storage_expired_jobs_for(&self, def: &JobDef) -> JobsResult<()> {
        let expired_before = self.clock.now() - Duration::days(i64::from(def.delete_after_days));
        let filter = JobRunFilter::new()
            .with_states([RunState::Done, RunState::Cancelled])
            .with_job_defs([def.id.as_str()])
            .with_finished_before(expired_before);
        let runs = self.storage().list_all_job_runs(&filter, Load::Skip).await?;

        for loaded in runs {
            let run = loaded.run;
            if self.log_job_lifecycle(Some(def)) {
                StructuredLogger::log_job_run_transition(&run, "job_run_deleted");
            }
            let run_id = run.id.clone();
            let result = self
                .store
                .transacted(tx_fn(move |tx| {
                    Box::pin(async move {
                        tx.delete_job_tasks(&JobTaskFilter::new().with_job_runs([run_id.as_str()]))
                            .await?;
                        tx.delete_job_runs(&JobRunFilter::new().with_ids([run_id])).await?;
                        Ok(())
                    })
                }))
                .await;
            if let Err(err) = result {
                self.log_err("delete_job_run", &err);
            }
        }
        Ok(())
    }
}
