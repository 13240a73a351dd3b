//! Test helper utilities and common testing patterns
//!
//! [`TestEngine`] wires an [`Engine`] to an [`InMemoryJobStore`] and a
//! [`ManualTimeProvider`], so tests drive the engine loop bodies one step at
//! a time instead of waiting on the background intervals.

use std::sync::Arc;
use std::time::Duration;

use jobs_core::{EngineConfig, ManualTimeProvider};
use jobs_dispatcher::{Engine, HandlerRegistry};
use jobs_domain::{
    JobDef, JobRun, JobRunFilter, JobStore, JobTask, JobTaskFilter, ListRequest, Sorting,
    TaskState,
};
use jobs_infrastructure::InMemoryJobStore;
use tokio::time::sleep;

use crate::builders::test_epoch;

/// Upper bound of run-tasks passes in [`TestEngine::run_all_tasks`]
const MAX_RUN_TASK_PASSES: usize = 200;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Set up logging for tests (call once per test binary)
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    }
}

/// An engine over an in-memory store with a manually advanced clock
pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<InMemoryJobStore>,
    pub clock: ManualTimeProvider,
}

impl TestEngine {
    pub fn new(registry: HandlerRegistry, defs: impl IntoIterator<Item = JobDef>) -> Self {
        Self::with_config(registry, defs, EngineConfig::default())
    }

    pub fn with_config(
        registry: HandlerRegistry,
        defs: impl IntoIterator<Item = JobDef>,
        config: EngineConfig,
    ) -> Self {
        let store = Arc::new(InMemoryJobStore::with_job_defs(defs));
        let clock = ManualTimeProvider::new(test_epoch());
        let engine = Engine::with_time_provider(
            Arc::clone(&store) as Arc<dyn JobStore>,
            registry,
            config,
            Arc::new(clock.clone()),
        );
        Self {
            engine,
            store,
            clock,
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }

    /// Runs task passes until no PENDING task is left
    pub async fn run_all_tasks(&self) {
        for _ in 0..MAX_RUN_TASK_PASSES {
            let pending = self
                .store
                .count_job_tasks(0, &JobTaskFilter::new().with_states([TaskState::Pending]))
                .await
                .unwrap_or(0);
            if pending == 0 {
                return;
            }
            self.engine.run_tasks().await;
        }
    }

    /// One full dispatch cycle: schedule, start due runs, execute their tasks, finalize
    pub async fn cycle(&self) {
        self.engine.ensure_job_schedules().await;
        self.engine.start_and_finalize_jobs().await;
        self.run_all_tasks().await;
        self.engine.start_and_finalize_jobs().await;
    }

    /// All runs of a job def, newest due time first
    pub async fn runs_of(&self, def_id: &str) -> Vec<JobRun> {
        self.store
            .list_job_runs(
                &ListRequest::unpaged().with_sort(jobs_domain::default_job_run_sorting()),
                &JobRunFilter::new().with_job_defs([def_id]),
            )
            .await
            .map(|page| page.items)
            .unwrap_or_default()
    }

    pub async fn run(&self, id: &str) -> Option<JobRun> {
        self.store.get_job_run(id).await.ok().flatten()
    }

    /// All tasks of a run, ordered by id
    pub async fn tasks_of(&self, job_run_id: &str) -> Vec<JobTask> {
        self.store
            .list_job_tasks(
                &ListRequest::unpaged().with_sort(vec![Sorting::asc("id")]),
                &JobTaskFilter::new().with_job_runs([job_run_id]),
            )
            .await
            .map(|page| page.items)
            .unwrap_or_default()
    }
}
