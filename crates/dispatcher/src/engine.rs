//! 作业引擎
//!
//! 后台循环各自独立调度，每一轮的错误与 panic 都被记录后吞掉，循环照常继续。
//! 多个引擎实例可以同时操作同一个存储，彼此之间只依赖带版本守卫的保存。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobs_core::{
    clamp, go_items, EngineConfig, JobsError, JobsResult, SystemTimeProvider, TimeProvider,
};
use jobs_domain::{
    tx_fn, CancellationReason, JobDef, JobRun, JobRunFilter, JobRunStats, JobStore, JobTask,
    JobTaskFilter, PayloadMap, RunState, TaskState,
};
use jobs_infrastructure::{EngineMetrics, StructuredLogger};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::registry::HandlerRegistry;
use crate::storage::{JobRunWithDef, Load, Storage};

pub type JobTaskExecutedHook = Arc<dyn Fn(&JobTask, Duration) + Send + Sync>;
pub type JobRunFinalizedHook = Arc<dyn Fn(&JobRun, Option<&JobRunStats>) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_job_task_executed: Option<JobTaskExecutedHook>,
    on_job_run_finalized: Option<JobRunFinalizedHook>,
}

pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn TimeProvider>,
    pub(crate) metrics: EngineMetrics,
    /// 本进程内正在执行的任务：任务ID -> 取消令牌
    cancelers: Mutex<HashMap<String, CancellationToken>>,
    hooks: RwLock<Hooks>,
    /// 后台循环与任务取消令牌的根
    root: RwLock<CancellationToken>,
    loops: Mutex<Option<Vec<JoinHandle<()>>>>,
}

/// 作业引擎，克隆开销很小，所有克隆共享同一个实例
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(store: Arc<dyn JobStore>, registry: HandlerRegistry, config: EngineConfig) -> Self {
        Self::with_time_provider(store, registry, config, Arc::new(SystemTimeProvider))
    }

    pub fn with_time_provider(
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        config: EngineConfig,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                registry: Arc::new(registry),
                config: config.sanitize(),
                clock,
                metrics: EngineMetrics::new(),
                cancelers: Mutex::new(HashMap::new()),
                hooks: RwLock::new(Hooks::default()),
                root: RwLock::new(CancellationToken::new()),
                loops: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    /// 启动全部后台循环，重复调用无副作用
    pub fn resume(&self) {
        self.inner.resume();
    }

    pub fn running(&self) -> bool {
        self.inner
            .loops
            .lock()
            .map(|loops| loops.is_some())
            .unwrap_or(false)
    }

    /// 停止后台循环，并取消本进程内正在执行的任务（任务记录为 CANCELLED）
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    /// 手动创建一次作业运行；`due_time` 缺省或早于当前时间时取当前时间
    pub async fn create_job_run(
        &self,
        job_def_id: &str,
        due_time: Option<DateTime<Utc>>,
        details: Option<PayloadMap>,
    ) -> JobsResult<JobRun> {
        let inner = &self.inner;
        let storage = inner.storage();
        let def = storage
            .get_job_def(job_def_id)
            .await?
            .ok_or_else(|| JobsError::job_def_not_found(job_def_id))?;
        let now = inner.clock.now();
        let due_time = due_time.filter(|due| *due > now).unwrap_or(now);
        inner
            .create_job_run_in(storage, &def, due_time, details, None, false)
            .await
    }

    /// 把指定的 PENDING 或 RUNNING 作业运行标记为 CANCELLING，返回逐个的错误
    pub async fn cancel_job_runs<I, S>(&self, job_run_ids: I) -> Vec<JobsError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = job_run_ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Vec::new();
        }
        let filter = JobRunFilter::new()
            .with_ids(ids)
            .with_states([RunState::Running, RunState::Pending]);
        let runs = match self.inner.storage().list_all_job_runs(&filter, Load::Skip).await {
            Ok(runs) => runs,
            Err(err) => return vec![err],
        };
        self.inner
            .cancel_runs(None, runs)
            .await
            .into_iter()
            .map(|(_, err)| err)
            .collect()
    }

    /// 删除 DONE 或 CANCELLED 的作业运行及其全部任务
    pub async fn delete_job_runs<I, S>(&self, job_run_ids: I) -> JobsResult<u64>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = job_run_ids.into_iter().map(Into::into).collect();
        let storage = self.inner.storage();
        for id in &ids {
            let run = storage.get_job_run(id, Load::Skip).await?.run;
            if !run.state.is_terminal() {
                return Err(JobsError::invalid_state(format!(
                    "job run '{}' was expected in a state of '{}' or '{}', not '{}'",
                    id,
                    RunState::Done,
                    RunState::Cancelled,
                    run.state
                )));
            }
        }
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = Arc::new(Mutex::new(0u64));
        let counter = Arc::clone(&deleted);
        self.inner
            .store
            .transacted(tx_fn(move |tx| {
                Box::pin(async move {
                    tx.delete_job_tasks(&JobTaskFilter::new().with_job_runs(ids.clone()))
                        .await?;
                    let n = tx.delete_job_runs(&JobRunFilter::new().with_ids(ids)).await?;
                    if let Ok(mut count) = counter.lock() {
                        *count = n;
                    }
                    Ok(())
                })
            }))
            .await?;
        let n = deleted.lock().map(|count| *count).unwrap_or(0);
        Ok(n)
    }

    /// 作业运行的任务进度统计
    pub async fn stats(&self, job_run_id: &str) -> JobsResult<JobRunStats> {
        self.inner.stats(job_run_id).await
    }

    /// 重新排队一个失败的任务，作业运行必要时回到 RUNNING
    pub async fn retry_job_task(&self, job_run_id: &str, job_task_id: &str) -> JobsResult<JobTask> {
        self.inner.retry_job_task(job_run_id, job_task_id).await
    }

    /// 每个任务尝试结束并保存后调用；只保留最后一次注册的回调
    pub fn on_job_task_executed<F>(&self, hook: F)
    where
        F: Fn(&JobTask, Duration) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.inner.hooks.write() {
            hooks.on_job_task_executed = Some(Arc::new(hook));
        }
    }

    /// 作业运行进入 DONE 并保存后调用；只保留最后一次注册的回调
    pub fn on_job_run_finalized<F>(&self, hook: F)
    where
        F: Fn(&JobRun, Option<&JobRunStats>) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.inner.hooks.write() {
            hooks.on_job_run_finalized = Some(Arc::new(hook));
        }
    }

    /// 规整并校验作业定义，返回全部问题（包括处理器未注册）
    pub fn validate_job_def(&self, def: &mut JobDef) -> Vec<JobsError> {
        let has_handler = self.inner.registry.contains(&def.handler_id);
        def.ensure_valid(has_handler)
    }

    /// 启动到期作业并收尾已结束与取消中的作业
    pub async fn start_and_finalize_jobs(&self) {
        self.inner.start_and_finalize_jobs().await;
    }

    /// 执行一批待运行任务，返回建议的下一轮等待时间
    pub async fn run_tasks(&self) -> Duration {
        self.inner.run_tasks().await
    }

    pub async fn ensure_job_schedules(&self) {
        self.inner.ensure_job_schedules().await;
    }

    pub async fn expire_or_retry_dead_tasks(&self) {
        self.inner.expire_or_retry_dead_tasks().await;
    }

    pub async fn delete_storage_expired_jobs(&self) {
        self.inner.delete_storage_expired_jobs().await;
    }
}

impl EngineInner {
    pub(crate) fn storage(&self) -> Storage<'_> {
        Storage::new(self.store.as_ref(), &self.registry)
    }

    pub(crate) fn root_token(&self) -> CancellationToken {
        match self.root.read() {
            Ok(root) => root.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 生命周期日志开关：定义中的设置优先，否则取引擎选项
    pub(crate) fn log_job_lifecycle(&self, def: Option<&JobDef>) -> bool {
        def.and_then(|def| def.log_job_lifecycle_events)
            .unwrap_or(self.config.log_job_lifecycle_events)
    }

    pub(crate) fn log_task_lifecycle(&self, def: Option<&JobDef>) -> bool {
        def.and_then(|def| def.log_task_lifecycle_events)
            .unwrap_or(self.config.log_task_lifecycle_events)
    }

    pub(crate) fn log_err(&self, operation: &str, err: &JobsError) {
        StructuredLogger::log_err(operation, err);
    }

    pub(crate) fn set_task_canceler(
        &self,
        task_id: &str,
        token: Option<CancellationToken>,
    ) -> Option<CancellationToken> {
        let mut cancelers = match self.cancelers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match token {
            Some(token) => cancelers.insert(task_id.to_string(), token),
            None => cancelers.remove(task_id),
        }
    }

    pub(crate) fn task_executed_hook(&self) -> Option<JobTaskExecutedHook> {
        self.hooks
            .read()
            .ok()
            .and_then(|hooks| hooks.on_job_task_executed.clone())
    }

    pub(crate) fn job_run_finalized_hook(&self) -> Option<JobRunFinalizedHook> {
        self.hooks
            .read()
            .ok()
            .and_then(|hooks| hooks.on_job_run_finalized.clone())
    }

    /// 把一批作业运行标记为 CANCELLING，返回保存失败的作业运行ID及错误
    pub(crate) async fn cancel_runs(
        self: &Arc<Self>,
        reason: Option<CancellationReason>,
        runs: Vec<JobRunWithDef>,
    ) -> Vec<(String, JobsError)> {
        if runs.is_empty() {
            return Vec::new();
        }
        let errors = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(self);
        let sink = Arc::clone(&errors);
        go_items(
            runs,
            self.config.max_concurrent_ops,
            Some(self.config.timeout_short()),
            move |loaded: JobRunWithDef| {
                let inner = Arc::clone(&inner);
                let sink = Arc::clone(&sink);
                async move {
                    let JobRunWithDef { mut run, def } = loaded;
                    let state = run.state;
                    run.state = RunState::Cancelling;
                    run.cancellation_reason = reason;
                    if inner.log_job_lifecycle(def.as_ref()) {
                        StructuredLogger::log_job_run_transition(&run, "job_run_cancelling");
                    }
                    if let Err(err) = inner.storage().save_job_run(&mut run).await {
                        run.state = state;
                        if let Ok(mut errors) = sink.lock() {
                            errors.push((run.id.clone(), err));
                        }
                    }
                }
            },
        )
        .await;

        let mut errors = match errors.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (id, err) in &errors {
            debug!("取消作业运行 {id} 失败: {err}");
        }
        errors.sort_by(|a, b| a.0.cmp(&b.0));
        errors
    }

    pub(crate) async fn stats(&self, job_run_id: &str) -> JobsResult<JobRunStats> {
        let storage = self.storage();
        let run = storage.get_job_run(job_run_id, Load::Skip).await?.run;

        let mut stats = JobRunStats::default();
        for state in TaskState::ALL {
            let count = storage
                .count_job_tasks(
                    0,
                    &JobTaskFilter::new()
                        .with_job_runs([run.id.as_str()])
                        .with_states([state]),
                )
                .await? as i64;
            stats.tasks_by_state.insert(state, count);
            stats.tasks_total += count;
        }
        stats.tasks_failed = storage
            .count_job_tasks(
                0,
                &JobTaskFilter::new()
                    .with_job_runs([run.id.as_str()])
                    .with_states([TaskState::Done])
                    .with_failed(),
            )
            .await? as i64;
        stats.tasks_succeeded = stats.count(TaskState::Done) - stats.tasks_failed;

        if let (Some(start), Some(finish)) = (run.start_time, run.finish_time) {
            stats.duration_total_mins = Some(minutes_between(start, finish));
        }
        stats.duration_prep_mins = run.duration_prep_minutes;
        stats.duration_finalize_mins = run.duration_finalize_minutes;
        Ok(stats)
    }

    pub(crate) async fn retry_job_task(
        self: &Arc<Self>,
        job_run_id: &str,
        job_task_id: &str,
    ) -> JobsResult<JobTask> {
        let storage = self.storage();
        let loaded = storage
            .get_job_task(job_task_id, Load::BestEffort, Load::BestEffort)
            .await?;
        let mut task = loaded.task;
        let (mut run, def) = match loaded.run {
            Some(JobRunWithDef { run, def }) if task.job_run_id == job_run_id => (run, def),
            _ => {
                return Err(JobsError::invalid_state(format!(
                    "job run '{job_run_id}' has no task '{job_task_id}'"
                )))
            }
        };
        if matches!(
            run.state,
            RunState::Cancelling | RunState::Cancelled | RunState::Pending
        ) {
            return Err(JobsError::invalid_state(format!(
                "'{}' job run '{}' is {}",
                run.job_def_id, run.id, run.state
            )));
        }
        if task.state != TaskState::Done || task.latest_error().is_none() {
            return Err(JobsError::invalid_state(format!(
                "job task '{}' must be in a state of {} (currently: {}) with the latest attempt \
                 (of {}) having an error set",
                task.id,
                TaskState::Done,
                task.state,
                task.attempts.len()
            )));
        }

        if run.state != RunState::Running && self.log_job_lifecycle(def.as_ref()) {
            info!(job_run = %run.id, "作业任务手动重试，作业运行回到 RUNNING");
        }
        let run_needs_reset = run.state != RunState::Running;
        if run_needs_reset {
            run.state = RunState::Running;
            run.finish_time = None;
            run.results = None;
        }
        task.state = TaskState::Pending;
        task.start_time = None;
        task.finish_time = None;
        task.results = None;
        if self.log_task_lifecycle(def.as_ref()) {
            StructuredLogger::log_task_transition(&task, &run.job_def_id, "job_task_retry_requested");
        }

        let inner = Arc::clone(self);
        let mut saved_task = task.clone();
        self.store
            .transacted(tx_fn(move |tx| {
                Box::pin(async move {
                    let storage = Storage::new(tx, &inner.registry);
                    if run_needs_reset {
                        storage.save_job_run(&mut run).await?;
                    }
                    storage.save_job_task(&mut saved_task).await
                })
            }))
            .await?;
        // 事务内的保存把版本号加一
        task.version += 1;
        Ok(task)
    }

    fn resume(self: &Arc<Self>) {
        let mut loops = match self.loops.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if loops.is_some() {
            return;
        }
        let root = {
            let mut root = match self.root.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if root.is_cancelled() {
                *root = CancellationToken::new();
            }
            root.clone()
        };

        let config = &self.config;
        let start_finalize = config.interval_start_and_finalize_jobs();
        let run_tasks = config.interval_run_tasks();
        let dead_tasks = config.interval_expire_or_retry_dead_tasks();
        let ensure = config.interval_ensure_job_schedules();
        let delete = config.interval_delete_storage_expired_jobs();

        info!("作业引擎启动后台循环");
        *loops = Some(vec![
            self.spawn_loop("start_and_finalize_jobs", start_finalize, start_finalize, &root, |inner| async move {
                inner.start_and_finalize_jobs().await;
                inner.config.interval_start_and_finalize_jobs()
            }),
            self.spawn_loop("run_tasks", run_tasks, run_tasks, &root, |inner| async move {
                inner.run_tasks().await
            }),
            self.spawn_loop("expire_or_retry_dead_tasks", dead_tasks, dead_tasks, &root, |inner| async move {
                inner.expire_or_retry_dead_tasks().await;
                inner.config.interval_expire_or_retry_dead_tasks()
            }),
            self.spawn_loop("delete_storage_expired_jobs", delete / 10, delete, &root, |inner| async move {
                inner.delete_storage_expired_jobs().await;
                inner.config.interval_delete_storage_expired_jobs()
            }),
            self.spawn_loop(
                "ensure_job_schedules",
                clamp(Duration::from_secs(22), Duration::from_secs(44), ensure),
                ensure,
                &root,
                |inner| async move {
                    inner.ensure_job_schedules().await;
                    inner.config.interval_ensure_job_schedules()
                },
            ),
        ]);
    }

    /// 每轮在独立的 tokio 任务中执行，panic 被捕获后按 `interval` 继续
    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        first_delay: Duration,
        interval: Duration,
        root: &CancellationToken,
        step: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<EngineInner>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Duration> + Send + 'static,
    {
        let inner = Arc::clone(self);
        let token = root.clone();
        tokio::spawn(async move {
            let mut delay = first_delay;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = match tokio::spawn(step(Arc::clone(&inner))).await {
                    Ok(next) => next,
                    Err(err) => {
                        StructuredLogger::log_loop_panic(name, &err.to_string());
                        interval
                    }
                };
            }
            debug!("后台循环 {name} 已退出");
        })
    }

    async fn shutdown(&self) {
        let handles = match self.loops.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        self.root_token().cancel();
        let tokens: Vec<CancellationToken> = match self.cancelers.lock() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        for token in tokens {
            token.cancel();
        }
        if let Some(handles) = handles {
            for handle in handles {
                let _ = handle.await;
            }
        }
        info!("作业引擎已停止");
    }
}

pub(crate) fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

pub(crate) fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

/// 简短存储操作加上超时
pub(crate) async fn with_timeout<T>(
    duration: Duration,
    fut: impl Future<Output = JobsResult<T>>,
) -> JobsResult<T> {
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| JobsError::Timeout(format!("存储操作超过 {}ms 未完成", duration.as_millis())))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_minutes_between() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = from + chrono::Duration::seconds(90);
        assert!((minutes_between(from, to) - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_new_id_prefix() {
        let id = new_id("nightly");
        assert!(id.starts_with("nightly_"));
        assert_ne!(id, new_id("nightly"));
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let err = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }
}
