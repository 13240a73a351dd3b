//! 作业类型处理器
//!
//! 业务方实现带关联类型的 [`Handler`]，注册时被包装成对象安全的 [`DynHandler`]，
//! 引擎只与后者打交道。载荷在存储边界上统一转换为 [`PayloadMap`]。

use std::sync::Arc;

use async_trait::async_trait;
use jobs_core::{JobsError, JobsResult};
use jobs_domain::{
    from_payload_map, to_payload_map, JobDef, JobTask, JobTaskFilter, ListRequest, PayloadMap,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// 处理器载荷：必须能序列化为 JSON 对象
pub trait Payload: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

/// 处理器调用上下文，`details` 为作业详情
#[derive(Debug, Clone)]
pub struct JobContext<D> {
    pub job_def: Arc<JobDef>,
    pub job_run_id: String,
    /// 仅在执行单个任务时有值
    pub job_task_id: Option<String>,
    pub details: D,
    pub cancel: CancellationToken,
}

impl<D> JobContext<D> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 收尾时筛选交给结果收集器的任务
#[derive(Debug, Clone, Default)]
pub struct FinalTaskQuery {
    pub filter: Option<JobTaskFilter>,
    pub list_request: Option<ListRequest>,
}

/// 任务生成阶段的输出通道，可以分批多次提交，也可以一个都不提交
#[derive(Debug)]
pub struct TaskEmitter<TD> {
    batches: Vec<Vec<TD>>,
}

impl<TD> Default for TaskEmitter<TD> {
    fn default() -> Self {
        Self {
            batches: Vec::new(),
        }
    }
}

impl<TD> TaskEmitter<TD> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, batch: impl IntoIterator<Item = TD>) {
        let batch: Vec<TD> = batch.into_iter().collect();
        if !batch.is_empty() {
            self.batches.push(batch);
        }
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn num_tasks(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn into_tasks(self) -> impl Iterator<Item = TD> {
        self.batches.into_iter().flatten()
    }
}

/// 收尾时逐个提供给收集器的任务（只读副本）
#[derive(Debug, Clone)]
pub struct TaskOutcome<TD, TR> {
    pub task: JobTask,
    pub details: TD,
    pub results: TR,
}

/// 作业结果收集器：先对每个任务调用 `observe`，最后由 `finish` 产出作业结果
pub trait JobResultsCollector<TD, TR, JR>: Send {
    fn observe(&mut self, _task: &TaskOutcome<TD, TR>) {}

    fn finish(self: Box<Self>) -> JobsResult<JR>;
}

pub type ResultsCollector<H> = Box<
    dyn JobResultsCollector<
        <H as Handler>::TaskDetails,
        <H as Handler>::TaskResults,
        <H as Handler>::JobResults,
    >,
>;

/// 一种作业类型的业务逻辑
///
/// 同一作业运行的任务可能在任意实例上以任意顺序并发执行，实现不应在任务之间保存状态。
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type JobDetails: Payload;
    type JobResults: Payload;
    type TaskDetails: Payload;
    type TaskResults: Payload;

    /// 作业开始前确定最终的作业详情，默认原样使用运行或定义中给出的详情
    async fn job_details(
        &self,
        ctx: &JobContext<Self::JobDetails>,
    ) -> JobsResult<Self::JobDetails> {
        Ok(ctx.details.clone())
    }

    /// 生成任务详情
    async fn task_details(
        &self,
        ctx: &JobContext<Self::JobDetails>,
        emitter: &mut TaskEmitter<Self::TaskDetails>,
    ) -> JobsResult<Option<FinalTaskQuery>>;

    /// 执行一个任务，每次尝试调用一次
    async fn task_results(
        &self,
        ctx: &JobContext<Self::JobDetails>,
        details: Self::TaskDetails,
    ) -> JobsResult<Self::TaskResults>;

    /// 全部任务结束后汇总作业结果；返回 `None` 表示不产出结果
    fn job_results(&self, _ctx: &JobContext<Self::JobDetails>) -> Option<ResultsCollector<Self>> {
        None
    }

    fn is_task_err_retryable(&self, _err: &JobsError) -> bool {
        false
    }
}

/// 类型擦除后的上下文
#[derive(Debug, Clone)]
pub struct RawContext {
    pub job_def: Arc<JobDef>,
    pub job_run_id: String,
    pub job_task_id: Option<String>,
    pub details: Option<PayloadMap>,
    pub cancel: CancellationToken,
}

impl RawContext {
    fn typed<D: Payload>(&self) -> JobsResult<JobContext<D>> {
        Ok(JobContext {
            job_def: Arc::clone(&self.job_def),
            job_run_id: self.job_run_id.clone(),
            job_task_id: self.job_task_id.clone(),
            details: from_payload_map(self.details.as_ref())?,
            cancel: self.cancel.clone(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskPlan {
    pub details: Vec<PayloadMap>,
    pub final_query: Option<FinalTaskQuery>,
}

pub trait DynCollector: Send {
    fn observe(&mut self, task: &JobTask) -> JobsResult<()>;
    fn finish(self: Box<Self>) -> JobsResult<PayloadMap>;
}

/// 对象安全的处理器
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn job_details(&self, ctx: &RawContext) -> JobsResult<PayloadMap>;
    async fn task_details(&self, ctx: &RawContext) -> JobsResult<TaskPlan>;
    async fn task_results(
        &self,
        ctx: &RawContext,
        details: Option<&PayloadMap>,
    ) -> JobsResult<PayloadMap>;
    fn job_results(&self, ctx: &RawContext) -> JobsResult<Option<Box<dyn DynCollector>>>;
    fn is_task_err_retryable(&self, err: &JobsError) -> bool;
}

pub struct TypedHandler<H> {
    handler: H,
}

impl<H: Handler> TypedHandler<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H: Handler> DynHandler for TypedHandler<H> {
    async fn job_details(&self, ctx: &RawContext) -> JobsResult<PayloadMap> {
        let ctx = ctx.typed::<H::JobDetails>()?;
        let details = self.handler.job_details(&ctx).await?;
        to_payload_map(&details)
    }

    async fn task_details(&self, ctx: &RawContext) -> JobsResult<TaskPlan> {
        let ctx = ctx.typed::<H::JobDetails>()?;
        let mut emitter = TaskEmitter::new();
        let final_query = self.handler.task_details(&ctx, &mut emitter).await?;
        let details = emitter
            .into_tasks()
            .map(|details| to_payload_map(&details))
            .collect::<JobsResult<Vec<_>>>()?;
        Ok(TaskPlan {
            details,
            final_query,
        })
    }

    async fn task_results(
        &self,
        ctx: &RawContext,
        details: Option<&PayloadMap>,
    ) -> JobsResult<PayloadMap> {
        let ctx = ctx.typed::<H::JobDetails>()?;
        let details: H::TaskDetails = from_payload_map(details)?;
        let results = self.handler.task_results(&ctx, details).await?;
        to_payload_map(&results)
    }

    fn job_results(&self, ctx: &RawContext) -> JobsResult<Option<Box<dyn DynCollector>>> {
        let ctx = ctx.typed::<H::JobDetails>()?;
        Ok(self.handler.job_results(&ctx).map(|inner| {
            Box::new(TypedCollector::<H> { inner }) as Box<dyn DynCollector>
        }))
    }

    fn is_task_err_retryable(&self, err: &JobsError) -> bool {
        self.handler.is_task_err_retryable(err)
    }
}

struct TypedCollector<H: Handler> {
    inner: ResultsCollector<H>,
}

impl<H: Handler> DynCollector for TypedCollector<H> {
    fn observe(&mut self, task: &JobTask) -> JobsResult<()> {
        let outcome = TaskOutcome {
            details: from_payload_map(task.details.as_ref())?,
            results: from_payload_map(task.results.as_ref())?,
            task: task.clone(),
        };
        self.inner.observe(&outcome);
        Ok(())
    }

    fn finish(self: Box<Self>) -> JobsResult<PayloadMap> {
        let results = self.inner.finish()?;
        to_payload_map(&results)
    }
}

/// 检查载荷类型的默认值能否序列化为 JSON 对象
pub(crate) fn check_payload_types<H: Handler>() -> JobsResult<()> {
    fn check<T: Payload>(name: &str) -> JobsResult<()> {
        to_payload_map(&T::default()).map(|_| ()).map_err(|_| {
            JobsError::InvalidHandlerPayload(format!(
                "{name} type '{}' must serialize to a JSON object",
                std::any::type_name::<T>()
            ))
        })
    }
    check::<H::JobDetails>("JobDetails")?;
    check::<H::JobResults>("JobResults")?;
    check::<H::TaskDetails>("TaskDetails")?;
    check::<H::TaskResults>("TaskResults")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct Range {
        from: u32,
        to: u32,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Chunk {
        n: u32,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Square {
        value: u64,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Total {
        sum: u64,
        seen: usize,
    }

    struct SquaresHandler;

    struct SumCollector(Total);

    impl JobResultsCollector<Chunk, Square, Total> for SumCollector {
        fn observe(&mut self, task: &TaskOutcome<Chunk, Square>) {
            self.0.sum += task.results.value;
            self.0.seen += 1;
        }

        fn finish(self: Box<Self>) -> JobsResult<Total> {
            Ok(self.0)
        }
    }

    #[async_trait]
    impl Handler for SquaresHandler {
        type JobDetails = Range;
        type JobResults = Total;
        type TaskDetails = Chunk;
        type TaskResults = Square;

        async fn task_details(
            &self,
            ctx: &JobContext<Range>,
            emitter: &mut TaskEmitter<Chunk>,
        ) -> JobsResult<Option<FinalTaskQuery>> {
            emitter.emit((ctx.details.from..=ctx.details.to).map(|n| Chunk { n }));
            emitter.emit(Vec::new());
            Ok(None)
        }

        async fn task_results(&self, _ctx: &JobContext<Range>, details: Chunk) -> JobsResult<Square> {
            Ok(Square {
                value: (details.n as u64).pow(2),
            })
        }

        fn job_results(&self, _ctx: &JobContext<Range>) -> Option<ResultsCollector<Self>> {
            Some(Box::new(SumCollector(Total::default())))
        }
    }

    fn raw_ctx(details: Option<PayloadMap>) -> RawContext {
        RawContext {
            job_def: Arc::new(JobDef::new("squares", "squares")),
            job_run_id: "run1".to_string(),
            job_task_id: None,
            details,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_typed_handler_round_trips_payloads() {
        let handler = TypedHandler::new(SquaresHandler);
        let ctx = raw_ctx(Some(to_payload_map(&Range { from: 2, to: 4 }).unwrap()));

        let details = handler.job_details(&ctx).await.unwrap();
        assert_eq!(details, to_payload_map(&Range { from: 2, to: 4 }).unwrap());

        let plan = handler.task_details(&ctx).await.unwrap();
        assert_eq!(plan.details.len(), 3);
        assert!(plan.final_query.is_none());

        let mut collector = handler.job_results(&ctx).unwrap().unwrap();
        for (n, details) in plan.details.iter().enumerate() {
            let results = handler.task_results(&ctx, Some(details)).await.unwrap();
            let mut task = JobTask::new_pending("run1", n + 1, "squares", Some(details.clone()));
            task.results = Some(results);
            collector.observe(&task).unwrap();
        }
        let total = collector.finish().unwrap();
        assert_eq!(total.get("sum"), Some(&serde_json::json!(4 + 9 + 16)));
        assert_eq!(total.get("seen"), Some(&serde_json::json!(3)));
    }

    #[tokio::test]
    async fn test_missing_details_use_default() {
        let handler = TypedHandler::new(SquaresHandler);
        let plan = handler.task_details(&raw_ctx(None)).await.unwrap();
        // 默认 0..=0
        assert_eq!(plan.details.len(), 1);
    }

    #[tokio::test]
    async fn test_mistyped_details_rejected() {
        let handler = TypedHandler::new(SquaresHandler);
        let mut bad = PayloadMap::new();
        bad.insert("from".to_string(), serde_json::json!("not a number"));
        let err = handler.task_details(&raw_ctx(Some(bad))).await.unwrap_err();
        assert!(matches!(err, JobsError::Serialization(_)));
    }

    #[test]
    fn test_emitter_skips_empty_batches() {
        let mut emitter = TaskEmitter::new();
        emitter.emit([1, 2]);
        emitter.emit(Vec::<i32>::new());
        emitter.emit([3]);
        assert_eq!(emitter.num_batches(), 2);
        assert_eq!(emitter.num_tasks(), 3);
        assert_eq!(emitter.into_tasks().collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
