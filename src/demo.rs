//! 演示用处理器：先发一批 1 个任务，再发一批 2 个，随机失败，收尾时累加结果

use std::time::Duration;

use async_trait::async_trait;
use jobs_core::{JobsError, JobsResult};
use jobs_dispatcher::{
    FinalTaskQuery, Handler, JobContext, JobResultsCollector, ResultsCollector, TaskEmitter,
    TaskOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const HANDLER_ID: &str = "demo.sum";

/// 单次任务失败的概率
const FAILURE_RATE: f64 = 0.2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SumJobDetails {
    #[serde(default)]
    pub base: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SumTaskDetails {
    pub value: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SumTaskResults {
    pub value: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SumJobResults {
    pub sum: u64,
    pub tasks: u32,
    pub failed: u32,
}

#[derive(Default)]
pub struct SumHandler;

struct SumCollector(SumJobResults);

impl JobResultsCollector<SumTaskDetails, SumTaskResults, SumJobResults> for SumCollector {
    fn observe(&mut self, task: &TaskOutcome<SumTaskDetails, SumTaskResults>) {
        self.0.tasks += 1;
        if task.task.failed() {
            self.0.failed += 1;
        } else {
            self.0.sum += task.results.value;
        }
    }

    fn finish(self: Box<Self>) -> JobsResult<SumJobResults> {
        Ok(self.0)
    }
}

#[async_trait]
impl Handler for SumHandler {
    type JobDetails = SumJobDetails;
    type JobResults = SumJobResults;
    type TaskDetails = SumTaskDetails;
    type TaskResults = SumTaskResults;

    async fn task_details(
        &self,
        ctx: &JobContext<SumJobDetails>,
        emitter: &mut TaskEmitter<SumTaskDetails>,
    ) -> JobsResult<Option<FinalTaskQuery>> {
        let base = ctx.details.base;
        emitter.emit([SumTaskDetails { value: base + 1 }]);
        emitter.emit([
            SumTaskDetails { value: base + 2 },
            SumTaskDetails { value: base + 3 },
        ]);
        Ok(None)
    }

    async fn task_results(
        &self,
        ctx: &JobContext<SumJobDetails>,
        details: SumTaskDetails,
    ) -> JobsResult<SumTaskResults> {
        let task_id = ctx.job_task_id.clone().unwrap_or_default();
        let fail = rand::random_bool(FAILURE_RATE);
        tokio::time::sleep(Duration::from_millis(200)).await;
        if fail {
            return Err(JobsError::task_execution(format!(
                "task '{task_id}' failed at random"
            )));
        }
        debug!("任务 {task_id} 完成，值 {}", details.value);
        Ok(SumTaskResults {
            value: details.value,
        })
    }

    fn job_results(&self, ctx: &JobContext<SumJobDetails>) -> Option<ResultsCollector<Self>> {
        info!("汇总作业运行 {} 的结果", ctx.job_run_id);
        Some(Box::new(SumCollector(SumJobResults::default())))
    }

    fn is_task_err_retryable(&self, err: &JobsError) -> bool {
        matches!(err, JobsError::TaskExecution(_))
    }
}
