//! 作业运行的启动与收尾
//!
//! PENDING -> RUNNING：生成任务并在同一事务中切换状态。
//! RUNNING -> DONE：全部任务结束后汇总结果，同一事务里安排后继。
//! CANCELLING -> CANCELLED：取消剩余任务后结束。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use jobs_core::{go_items, go_timed_items, JobsError, JobsResult};
use jobs_domain::{
    tx_fn, CancellationReason, JobDef, JobRun, JobRunFilter, JobTask, JobTaskFilter, ListRequest,
    PayloadMap, RunState, TaskState, TIMEOUT_LONG,
};
use jobs_infrastructure::StructuredLogger;
use tracing::debug;

use crate::engine::{with_timeout, EngineInner};
use crate::handler::RawContext;
use crate::storage::{JobRunWithDef, Load, Storage};

/// 取消中的作业运行每次取出的任务数
const CANCEL_PAGE_SIZE: usize = 444;

impl EngineInner {
    pub(crate) async fn start_and_finalize_jobs(self: &Arc<Self>) {
        futures::join!(
            self.start_due_jobs(),
            self.finalize_finished_jobs(),
            self.finalize_cancelling_jobs(),
        );
    }

    /// 运行中的作业运行因定义或处理器失效而应取消的原因
    fn invalidation_reason(&self, loaded: &JobRunWithDef) -> Option<CancellationReason> {
        let run = &loaded.run;
        match &loaded.def {
            None => Some(CancellationReason::DefInvalidOrGone),
            Some(def) if run.handler_id != def.handler_id || def.disabled => {
                Some(CancellationReason::DefChanged)
            }
            Some(def) if !self.storage().has_handler(def) => {
                Some(CancellationReason::JobTypeInvalidOrGone)
            }
            Some(_) => None,
        }
    }

    async fn cancel_grouped(
        self: &Arc<Self>,
        grouped: HashMap<CancellationReason, Vec<JobRunWithDef>>,
    ) {
        for (reason, runs) in grouped {
            for (id, err) in self.cancel_runs(Some(reason), runs).await {
                debug!("作业运行 {id} 取消失败");
                self.log_err("cancel_job_run", &err);
            }
        }
    }

    pub(crate) async fn start_due_jobs(self: &Arc<Self>) {
        let now = self.clock.now();
        let filter = JobRunFilter::new()
            .with_states([RunState::Pending])
            .with_due(now);
        let mut due = match with_timeout(
            self.config.timeout_short(),
            self.storage().list_all_job_runs(&filter, Load::BestEffort),
        )
        .await
        {
            Ok(runs) => runs,
            Err(err) => {
                self.log_err("start_due_jobs", &err);
                return;
            }
        };

        // 手动创建的排在前面，重复时保留它们
        due.sort_by_key(|loaded| loaded.run.auto_scheduled);
        let mut to_cancel: HashMap<CancellationReason, Vec<JobRunWithDef>> = HashMap::new();
        let mut to_start = Vec::with_capacity(due.len());
        for loaded in due {
            let duplicate = to_start.iter().any(|kept: &JobRunWithDef| {
                kept.run.job_def_id == loaded.run.job_def_id
                    && same_details(kept.run.details.as_ref(), loaded.run.details.as_ref())
            });
            let reason = if duplicate {
                Some(CancellationReason::Duplicate)
            } else {
                self.invalidation_reason(&loaded)
            };
            match reason {
                Some(reason) => to_cancel.entry(reason).or_default().push(loaded),
                None => to_start.push(loaded),
            }
        }
        self.cancel_grouped(to_cancel).await;

        let inner = Arc::clone(self);
        go_timed_items(
            to_start,
            self.config.max_concurrent_ops,
            None,
            move |loaded: JobRunWithDef| {
                let inner = Arc::clone(&inner);
                async move {
                    let run_id = loaded.run.id.clone();
                    if let Err(err) = inner.start_due_job(loaded).await {
                        debug!("作业运行 {run_id} 启动失败");
                        inner.log_err("start_due_job", &err);
                    }
                }
            },
        )
        .await;
    }

    async fn start_due_job(self: &Arc<Self>, loaded: JobRunWithDef) -> JobsResult<()> {
        let JobRunWithDef { mut run, def } = loaded;
        let def = def.ok_or_else(|| JobsError::job_def_not_found(&run.job_def_id))?;
        let handler = self
            .registry
            .create(&def.handler_id)
            .ok_or_else(|| JobsError::HandlerRemoved {
                def_id: def.id.clone(),
                handler_id: def.handler_id.clone(),
            })?;
        let started = Instant::now();

        let mut ctx = RawContext {
            job_def: Arc::new(def.clone()),
            job_run_id: run.id.clone(),
            job_task_id: None,
            details: run.details.clone().or_else(|| def.default_job_details.clone()),
            cancel: self.root_token().child_token(),
        };
        let details = handler.job_details(&ctx).await?;
        ctx.details = Some(details.clone());
        run.details = Some(details);

        let plan = handler.task_details(&ctx).await?;
        let tasks: Vec<JobTask> = plan
            .details
            .into_iter()
            .enumerate()
            .map(|(i, details)| JobTask::new_pending(&run.id, i + 1, &run.handler_id, Some(details)))
            .collect();
        let num_tasks = tasks.len();
        if let Some(query) = plan.final_query {
            run.final_task_filter = query.filter;
            run.final_task_list_request = query.list_request;
        }

        run.state = RunState::Running;
        run.start_time = Some(self.clock.now());
        run.finish_time = None;
        run.duration_prep_minutes = Some(started.elapsed().as_secs_f64() / 60.0);

        let inner = Arc::clone(self);
        let mut saved = run.clone();
        self.store
            .transacted(tx_fn(move |tx| {
                Box::pin(async move {
                    let storage = Storage::new(tx, &inner.registry);
                    if !tasks.is_empty() {
                        storage.insert_job_tasks(tasks).await?;
                    }
                    storage.save_job_run(&mut saved).await
                })
            }))
            .await?;
        run.version += 1;

        if self.log_job_lifecycle(Some(&def)) {
            StructuredLogger::log_job_run_transition(&run, "job_run_started");
            debug!("作业运行 {} 生成了 {} 个任务", run.id, num_tasks);
        }
        self.metrics.record_job_run_started(&run, started.elapsed());
        Ok(())
    }

    pub(crate) async fn finalize_finished_jobs(self: &Arc<Self>) {
        let filter = JobRunFilter::new().with_states([RunState::Running]);
        let running = match with_timeout(
            self.config.timeout_short(),
            self.storage().list_all_job_runs(&filter, Load::BestEffort),
        )
        .await
        {
            Ok(runs) => runs,
            Err(err) => {
                self.log_err("finalize_finished_jobs", &err);
                return;
            }
        };

        let mut to_cancel: HashMap<CancellationReason, Vec<JobRunWithDef>> = HashMap::new();
        let mut to_finalize = Vec::with_capacity(running.len());
        for loaded in running {
            match self.invalidation_reason(&loaded) {
                Some(reason) => to_cancel.entry(reason).or_default().push(loaded),
                None => to_finalize.push(loaded),
            }
        }
        self.cancel_grouped(to_cancel).await;

        let inner = Arc::clone(self);
        go_timed_items(
            to_finalize,
            self.config.max_concurrent_ops,
            None,
            move |loaded: JobRunWithDef| {
                let inner = Arc::clone(&inner);
                async move {
                    if let Err(err) = inner.finalize_finished_job(loaded).await {
                        inner.log_err("finalize_finished_job", &err);
                    }
                }
            },
        )
        .await;
    }

    async fn finalize_finished_job(self: &Arc<Self>, loaded: JobRunWithDef) -> JobsResult<()> {
        let JobRunWithDef { mut run, def } = loaded;
        let storage = self.storage();
        let still_busy = storage
            .find_job_task(
                &JobTaskFilter::new()
                    .with_job_runs([run.id.as_str()])
                    .with_states([TaskState::Pending, TaskState::Running]),
            )
            .await?;
        if still_busy.is_some() {
            return Ok(());
        }

        let def = def.ok_or_else(|| JobsError::job_def_not_found(&run.job_def_id))?;
        let handler = self
            .registry
            .create(&def.handler_id)
            .ok_or_else(|| JobsError::HandlerRemoved {
                def_id: def.id.clone(),
                handler_id: def.handler_id.clone(),
            })?;
        let started = Instant::now();

        let ctx = RawContext {
            job_def: Arc::new(def.clone()),
            job_run_id: run.id.clone(),
            job_task_id: None,
            details: run.details.clone(),
            cancel: self.root_token().child_token(),
        };
        if let Some(mut collector) = handler.job_results(&ctx)? {
            let filter = run
                .final_task_filter
                .clone()
                .unwrap_or_default()
                .with_job_runs([run.id.as_str()]);
            let mut req = run.final_task_list_request.clone().unwrap_or_default();
            req.page_token = None;
            loop {
                let page = storage
                    .list_job_tasks(&req, &filter, Load::Skip, Load::Skip)
                    .await?;
                for loaded in &page.items {
                    collector.observe(&loaded.task)?;
                }
                match page.next_page_token {
                    Some(token) if !page.items.is_empty() => req.page_token = Some(token),
                    _ => break,
                }
            }
            run.results = Some(collector.finish()?);
        }

        let finalize = started.elapsed();
        run.state = RunState::Done;
        run.finish_time = Some(self.clock.now());
        run.duration_finalize_minutes = Some(finalize.as_secs_f64() / 60.0);

        self.save_finished_run(&mut run, Some(def.clone())).await?;
        if self.log_job_lifecycle(Some(&def)) {
            StructuredLogger::log_job_run_transition(&run, "job_run_finalized");
        }
        self.metrics.record_job_run_finished(&run, Some(finalize));

        if let Some(hook) = self.job_run_finalized_hook() {
            let stats = self.stats(&run.id).await.ok();
            hook(&run, stats.as_ref());
        }
        Ok(())
    }

    /// 保存已结束的作业运行；自动调度的在同一事务中安排后继，避免并发重复调度
    async fn save_finished_run(
        self: &Arc<Self>,
        run: &mut JobRun,
        def: Option<JobDef>,
    ) -> JobsResult<()> {
        let inner = Arc::clone(self);
        let mut saved = run.clone();
        self.store
            .transacted(tx_fn(move |tx| {
                Box::pin(async move {
                    let storage = Storage::new(tx, &inner.registry);
                    storage.save_job_run(&mut saved).await?;
                    match def {
                        Some(def) if saved.auto_scheduled && !def.disabled => {
                            inner.schedule_job(storage, &def, Some(&saved)).await
                        }
                        _ => Ok(()),
                    }
                })
            }))
            .await?;
        run.version += 1;
        Ok(())
    }

    pub(crate) async fn finalize_cancelling_jobs(self: &Arc<Self>) {
        let filter = JobRunFilter::new().with_states([RunState::Cancelling]);
        let cancelling = match with_timeout(
            self.config.timeout_short(),
            self.storage().list_all_job_runs(&filter, Load::BestEffort),
        )
        .await
        {
            Ok(runs) => runs,
            Err(err) => {
                self.log_err("finalize_cancelling_jobs", &err);
                return;
            }
        };

        let inner = Arc::clone(self);
        go_items(
            cancelling,
            self.config.max_concurrent_ops,
            Some(TIMEOUT_LONG),
            move |loaded: JobRunWithDef| {
                let inner = Arc::clone(&inner);
                async move {
                    if let Err(err) = inner.finalize_cancelling_job(loaded).await {
                        inner.log_err("finalize_cancelling_job", &err);
                    }
                }
            },
        )
        .await;
    }

    async fn finalize_cancelling_job(self: &Arc<Self>, loaded: JobRunWithDef) -> JobsResult<()> {
        let JobRunWithDef { mut run, def } = loaded;
        let storage = self.storage();
        let filter = JobTaskFilter::new()
            .with_job_runs([run.id.as_str()])
            .with_states([TaskState::Pending, TaskState::Running]);
        let req = ListRequest::with_page_size(CANCEL_PAGE_SIZE);

        // 已取消的任务不再匹配过滤条件，所以总是取第一页
        loop {
            let page = storage.list_job_tasks(&req, &filter, Load::Skip, Load::Skip).await?;
            if page.items.is_empty() {
                break;
            }
            let mut failed = None;
            for loaded in page.items {
                let mut task = loaded.task;
                if let Some(canceler) = self.set_task_canceler(&task.id, None) {
                    canceler.cancel();
                }
                let state = task.state;
                task.state = TaskState::Cancelled;
                task.finish_time = Some(self.clock.now());
                if self.log_task_lifecycle(def.as_ref()) {
                    StructuredLogger::log_task_transition(&task, &run.job_def_id, "job_task_cancelled");
                }
                if let Err(err) = storage.save_job_task(&mut task).await {
                    debug!("任务 {} 从 {} 取消失败", task.id, state);
                    self.log_err("cancel_job_task", &err);
                    failed = Some(err);
                }
            }
            // 下一轮清扫再试
            if let Some(err) = failed {
                return if err.is_version_conflict() { Ok(()) } else { Err(err) };
            }
        }

        run.state = RunState::Cancelled;
        run.finish_time = Some(self.clock.now());
        self.save_finished_run(&mut run, def.clone()).await?;
        if self.log_job_lifecycle(def.as_ref()) {
            StructuredLogger::log_job_run_transition(&run, "job_run_cancelled");
        }
        self.metrics.record_job_run_finished(&run, None);
        Ok(())
    }
}

/// 作业详情相同：缺省与空对象视为相同
fn same_details(a: Option<&PayloadMap>, b: Option<&PayloadMap>) -> bool {
    let a = a.filter(|map| !map.is_empty());
    let b = b.filter(|map| !map.is_empty());
    a == b
}
