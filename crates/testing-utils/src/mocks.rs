//! Scripted handlers for engine tests
//!
//! A [`Script`] is shared between the test and every handler instance the
//! registry constructs, so tests can both steer task outcomes and inspect
//! what the engine asked the handler to do.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobs_core::{JobsError, JobsResult};
use jobs_dispatcher::{
    FinalTaskQuery, Handler, HandlerRegistry, JobContext, JobResultsCollector, ResultsCollector,
    TaskEmitter, TaskOutcome,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchDetails {
    /// Number of tasks to emit, 0 means the script's default
    #[serde(default)]
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemDetails {
    pub n: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemResults {
    pub doubled: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SumResults {
    pub total: u32,
    pub observed: u32,
}

/// Shared behaviour and call log of a [`ScriptedHandler`]
#[derive(Debug)]
pub struct Script {
    tasks_per_run: u32,
    fail_first: usize,
    always_fail: bool,
    retryable: bool,
    task_delay: Option<Duration>,
    task_calls: AtomicUsize,
    observed: Mutex<Vec<String>>,
}

impl Script {
    pub fn new(tasks_per_run: u32) -> Self {
        Self {
            tasks_per_run,
            fail_first: 0,
            always_fail: false,
            retryable: true,
            task_delay: None,
            task_calls: AtomicUsize::new(0),
            observed: Mutex::new(Vec::new()),
        }
    }

    /// The first `n` task executions fail
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn with_task_delay(mut self, delay: Duration) -> Self {
        self.task_delay = Some(delay);
        self
    }

    pub fn task_calls(&self) -> usize {
        self.task_calls.load(Ordering::SeqCst)
    }

    /// Ids of the tasks the results collector was offered, in order
    pub fn observed_tasks(&self) -> Vec<String> {
        self.observed
            .lock()
            .map(|observed| observed.clone())
            .unwrap_or_default()
    }

    /// Registers a [`ScriptedHandler`] under `id` and returns the shared script
    pub fn register(self, registry: &mut HandlerRegistry, id: &str) -> JobsResult<Arc<Self>> {
        let script = Arc::new(self);
        let shared = Arc::clone(&script);
        registry.register(Some(id), move || ScriptedHandler {
            script: Arc::clone(&shared),
        })?;
        Ok(script)
    }
}

pub struct ScriptedHandler {
    script: Arc<Script>,
}

impl ScriptedHandler {
    pub fn new(script: Arc<Script>) -> Self {
        Self { script }
    }
}

struct SumCollector {
    script: Arc<Script>,
    results: SumResults,
}

impl JobResultsCollector<ItemDetails, ItemResults, SumResults> for SumCollector {
    fn observe(&mut self, task: &TaskOutcome<ItemDetails, ItemResults>) {
        if let Ok(mut observed) = self.script.observed.lock() {
            observed.push(task.task.id.clone());
        }
        self.results.total += task.results.doubled;
        self.results.observed += 1;
    }

    fn finish(self: Box<Self>) -> JobsResult<SumResults> {
        Ok(self.results)
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    type JobDetails = BatchDetails;
    type JobResults = SumResults;
    type TaskDetails = ItemDetails;
    type TaskResults = ItemResults;

    async fn job_details(&self, ctx: &JobContext<BatchDetails>) -> JobsResult<BatchDetails> {
        let count = match ctx.details.count {
            0 => self.script.tasks_per_run,
            n => n,
        };
        Ok(BatchDetails { count })
    }

    async fn task_details(
        &self,
        ctx: &JobContext<BatchDetails>,
        emitter: &mut TaskEmitter<ItemDetails>,
    ) -> JobsResult<Option<FinalTaskQuery>> {
        emitter.emit((1..=ctx.details.count).map(|n| ItemDetails { n }));
        Ok(None)
    }

    async fn task_results(
        &self,
        _ctx: &JobContext<BatchDetails>,
        details: ItemDetails,
    ) -> JobsResult<ItemResults> {
        let call = self.script.task_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.script.task_delay {
            tokio::time::sleep(delay).await;
        }
        if self.script.always_fail || call < self.script.fail_first {
            return Err(JobsError::task_execution(format!(
                "scripted failure of call {}",
                call + 1
            )));
        }
        Ok(ItemResults {
            doubled: details.n * 2,
        })
    }

    fn job_results(&self, _ctx: &JobContext<BatchDetails>) -> Option<ResultsCollector<Self>> {
        Some(Box::new(SumCollector {
            script: Arc::clone(&self.script),
            results: SumResults::default(),
        }))
    }

    fn is_task_err_retryable(&self, err: &JobsError) -> bool {
        self.script.retryable && matches!(err, JobsError::TaskExecution(_))
    }
}
