//! 引擎侧的存储封装
//!
//! 在 [`JobStore`] 之上补充：载入时校验作业定义、按需关联加载运行的定义与任务的运行、
//! 带版本守卫的保存自动递增版本号并在失败时恢复。

use std::collections::HashMap;
use std::time::Duration;

use jobs_core::{ItemTimeout, JobsError, JobsResult};
use jobs_domain::{
    JobDef, JobDefFilter, JobRun, JobRunFilter, JobStore, JobTask, JobTaskFilter, ListRequest,
    Page, Sorting, TIMEOUT_LONG,
};
use jobs_infrastructure::StructuredLogger;

use crate::registry::HandlerRegistry;

/// 关联对象的加载方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Load {
    Skip,
    /// 缺失或无效时留空
    BestEffort,
    /// 缺失或无效时报错
    Must,
}

#[derive(Debug, Clone)]
pub struct JobRunWithDef {
    pub run: JobRun,
    pub def: Option<JobDef>,
}

/// 作业准备与收尾按定义的超时执行
impl ItemTimeout for JobRunWithDef {
    fn item_timeout(&self) -> Option<Duration> {
        Some(
            self.def
                .as_ref()
                .map_or(TIMEOUT_LONG, JobDef::job_prep_and_finalize_timeout),
        )
    }
}

#[derive(Debug, Clone)]
pub struct JobTaskWithRun {
    pub task: JobTask,
    pub run: Option<JobRunWithDef>,
}

#[derive(Clone, Copy)]
pub struct Storage<'s> {
    store: &'s dyn JobStore,
    registry: &'s HandlerRegistry,
}

impl<'s> Storage<'s> {
    pub fn new(store: &'s dyn JobStore, registry: &'s HandlerRegistry) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &'s dyn JobStore {
        self.store
    }

    /// 处理器缺失不算载入失败，由调用方按 [`Storage::has_handler`] 区分取消原因
    fn validated(&self, mut def: JobDef) -> JobsResult<JobDef> {
        def.ensure_valid_or_error_if_enabled(true)?;
        Ok(def)
    }

    pub fn has_handler(&self, def: &JobDef) -> bool {
        self.registry.contains(&def.handler_id)
    }

    /// 无效的启用定义返回错误
    pub async fn get_job_def(&self, id: &str) -> JobsResult<Option<JobDef>> {
        match self.store.get_job_def(id).await? {
            Some(def) => self.validated(def).map(Some),
            None => Ok(None),
        }
    }

    /// 无效的启用定义被视为不存在
    pub async fn list_job_defs(&self, filter: &JobDefFilter) -> JobsResult<Vec<JobDef>> {
        let defs = self.store.list_job_defs(filter).await?;
        Ok(defs
            .into_iter()
            .filter_map(|def| {
                let id = def.id.clone();
                match self.validated(def) {
                    Ok(def) => Some(def),
                    Err(err) => {
                        StructuredLogger::log_job_def_invalid(&id, &err);
                        None
                    }
                }
            })
            .collect())
    }

    pub async fn find_job_def(&self, filter: &JobDefFilter) -> JobsResult<Option<JobDef>> {
        Ok(self.list_job_defs(filter).await?.into_iter().next())
    }

    async fn load_def(
        &self,
        def_id: &str,
        load: Load,
        cache: &mut HashMap<String, Option<JobDef>>,
    ) -> JobsResult<Option<JobDef>> {
        if load == Load::Skip {
            return Ok(None);
        }
        if let Some(cached) = cache.get(def_id) {
            return match (cached, load) {
                (None, Load::Must) => Err(JobsError::job_def_not_found(def_id)),
                (cached, _) => Ok(cached.clone()),
            };
        }
        let loaded = match self.get_job_def(def_id).await {
            Ok(def) => def,
            Err(err) if load == Load::Must => return Err(err),
            Err(err) => {
                StructuredLogger::log_job_def_invalid(def_id, &err);
                None
            }
        };
        cache.insert(def_id.to_string(), loaded.clone());
        match loaded {
            None if load == Load::Must => Err(JobsError::job_def_not_found(def_id)),
            loaded => Ok(loaded),
        }
    }

    async fn with_defs(&self, runs: Vec<JobRun>, load: Load) -> JobsResult<Vec<JobRunWithDef>> {
        let mut cache = HashMap::new();
        let mut loaded = Vec::with_capacity(runs.len());
        for run in runs {
            let def = self.load_def(&run.job_def_id, load, &mut cache).await?;
            loaded.push(JobRunWithDef { run, def });
        }
        Ok(loaded)
    }

    /// 作业运行不存在时返回 `JobRunNotFound`
    pub async fn get_job_run(&self, id: &str, load_def: Load) -> JobsResult<JobRunWithDef> {
        let run = self
            .store
            .get_job_run(id)
            .await?
            .ok_or_else(|| JobsError::job_run_not_found(id))?;
        let def = self.load_def(&run.job_def_id, load_def, &mut HashMap::new()).await?;
        Ok(JobRunWithDef { run, def })
    }

    pub async fn find_job_run(
        &self,
        filter: &JobRunFilter,
        sort: &[Sorting],
        load_def: Load,
    ) -> JobsResult<Option<JobRunWithDef>> {
        match self.store.find_job_run(filter, sort).await? {
            Some(run) => Ok(self.with_defs(vec![run], load_def).await?.pop()),
            None => Ok(None),
        }
    }

    pub async fn list_job_runs(
        &self,
        req: &ListRequest,
        filter: &JobRunFilter,
        load_def: Load,
    ) -> JobsResult<Page<JobRunWithDef>> {
        let page = self.store.list_job_runs(req, filter).await?;
        Ok(Page {
            items: self.with_defs(page.items, load_def).await?,
            next_page_token: page.next_page_token,
        })
    }

    /// 不分页列出全部匹配的作业运行，按默认排序
    pub async fn list_all_job_runs(
        &self,
        filter: &JobRunFilter,
        load_def: Load,
    ) -> JobsResult<Vec<JobRunWithDef>> {
        let req = ListRequest::unpaged().with_sort(jobs_domain::default_job_run_sorting());
        Ok(self.list_job_runs(&req, filter, load_def).await?.items)
    }

    pub async fn count_job_runs(&self, limit: u64, filter: &JobRunFilter) -> JobsResult<u64> {
        self.store.count_job_runs(limit, filter).await
    }

    pub async fn insert_job_runs(&self, runs: Vec<JobRun>) -> JobsResult<()> {
        self.store.insert_job_runs(runs).await
    }

    pub async fn delete_job_runs(&self, filter: &JobRunFilter) -> JobsResult<u64> {
        self.store.delete_job_runs(filter).await
    }

    async fn with_runs(
        &self,
        tasks: Vec<JobTask>,
        load_run: Load,
        load_def: Load,
    ) -> JobsResult<Vec<JobTaskWithRun>> {
        if load_run == Load::Skip {
            return Ok(tasks
                .into_iter()
                .map(|task| JobTaskWithRun { task, run: None })
                .collect());
        }
        let mut defs = HashMap::new();
        let mut runs: HashMap<String, Option<JobRun>> = HashMap::new();
        let mut loaded = Vec::with_capacity(tasks.len());
        for task in tasks {
            if !runs.contains_key(&task.job_run_id) {
                let run = self.store.get_job_run(&task.job_run_id).await?;
                runs.insert(task.job_run_id.clone(), run);
            }
            let run = match runs.get(&task.job_run_id).cloned().flatten() {
                Some(run) => {
                    let def = self.load_def(&run.job_def_id, load_def, &mut defs).await?;
                    Some(JobRunWithDef { run, def })
                }
                None if load_run == Load::Must => {
                    return Err(JobsError::job_run_not_found(&task.job_run_id))
                }
                None => None,
            };
            loaded.push(JobTaskWithRun { task, run });
        }
        Ok(loaded)
    }

    pub async fn get_job_task(
        &self,
        id: &str,
        load_run: Load,
        load_def: Load,
    ) -> JobsResult<JobTaskWithRun> {
        let task = self
            .store
            .get_job_task(id)
            .await?
            .ok_or_else(|| JobsError::JobTaskNotFound { id: id.to_string() })?;
        let mut loaded = self.with_runs(vec![task], load_run, load_def).await?;
        loaded
            .pop()
            .ok_or_else(|| JobsError::JobTaskNotFound { id: id.to_string() })
    }

    pub async fn find_job_task(&self, filter: &JobTaskFilter) -> JobsResult<Option<JobTask>> {
        self.store.find_job_task(filter, &[]).await
    }

    pub async fn list_job_tasks(
        &self,
        req: &ListRequest,
        filter: &JobTaskFilter,
        load_run: Load,
        load_def: Load,
    ) -> JobsResult<Page<JobTaskWithRun>> {
        let page = self.store.list_job_tasks(req, filter).await?;
        Ok(Page {
            items: self.with_runs(page.items, load_run, load_def).await?,
            next_page_token: page.next_page_token,
        })
    }

    pub async fn count_job_tasks(&self, limit: u64, filter: &JobTaskFilter) -> JobsResult<u64> {
        self.store.count_job_tasks(limit, filter).await
    }

    pub async fn insert_job_tasks(&self, tasks: Vec<JobTask>) -> JobsResult<()> {
        self.store.insert_job_tasks(tasks).await
    }

    pub async fn delete_job_tasks(&self, filter: &JobTaskFilter) -> JobsResult<u64> {
        self.store.delete_job_tasks(filter).await
    }

    /// 以当前版本为守卫保存并递增版本号，失败时恢复原版本
    pub async fn save_job_run(&self, run: &mut JobRun) -> JobsResult<()> {
        let expected = run.version;
        run.version += 1;
        let result = self.store.save_job_run_guarded(run, expected).await;
        if result.is_err() {
            run.version = expected;
        }
        result
    }

    pub async fn save_job_task(&self, task: &mut JobTask) -> JobsResult<()> {
        let expected = task.version;
        task.version += 1;
        let result = self.store.save_job_task_guarded(task, expected).await;
        if result.is_err() {
            task.version = expected;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobs_domain::{RunState, Schedule};
    use jobs_infrastructure::InMemoryJobStore;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
    }

    #[tokio::test]
    async fn test_invalid_enabled_defs_are_dropped_from_lists() {
        let mut broken = JobDef::new("broken", "missing-handler");
        broken.schedules = vec![Schedule::new("not a crontab")];
        let mut disabled = JobDef::new("disabled", "missing-handler");
        disabled.disabled = true;
        disabled.schedules = vec![Schedule::new("not a crontab either")];
        let orphan = JobDef::new("orphan", "missing-handler");
        let store = InMemoryJobStore::with_job_defs([broken, disabled, orphan]);
        let registry = registry();
        let storage = Storage::new(&store, &registry);

        let defs = storage.list_job_defs(&JobDefFilter::new()).await.unwrap();
        let ids: Vec<&str> = defs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["disabled", "orphan"]);
        assert!(!storage.has_handler(&defs[1]));

        assert!(storage.get_job_def("broken").await.is_err());
        assert_eq!(storage.get_job_def("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_loading_modes() {
        let store = InMemoryJobStore::new();
        store
            .insert_job_runs(vec![JobRun::new_pending("r1", "gone", "h", Utc::now())])
            .await
            .unwrap();
        let registry = registry();
        let storage = Storage::new(&store, &registry);

        let loaded = storage.get_job_run("r1", Load::BestEffort).await.unwrap();
        assert!(loaded.def.is_none());
        let err = storage.get_job_run("r1", Load::Must).await.unwrap_err();
        assert_eq!(err, JobsError::job_def_not_found("gone"));
        let err = storage.get_job_run("r2", Load::Skip).await.unwrap_err();
        assert_eq!(err, JobsError::job_run_not_found("r2"));
    }

    #[tokio::test]
    async fn test_task_loading_modes() {
        let store = InMemoryJobStore::new();
        store
            .insert_job_tasks(vec![JobTask::new_pending("orphan", 1, "h", None)])
            .await
            .unwrap();
        let registry = registry();
        let storage = Storage::new(&store, &registry);

        let loaded = storage
            .get_job_task("orphan_1", Load::BestEffort, Load::BestEffort)
            .await
            .unwrap();
        assert!(loaded.run.is_none());
        let err = storage
            .get_job_task("orphan_1", Load::Must, Load::Skip)
            .await
            .unwrap_err();
        assert_eq!(err, JobsError::job_run_not_found("orphan"));
    }

    #[tokio::test]
    async fn test_save_bumps_version_and_restores_on_conflict() {
        let store = InMemoryJobStore::new();
        let run = JobRun::new_pending("r1", "def", "h", Utc::now());
        store.insert_job_runs(vec![run.clone()]).await.unwrap();
        let registry = registry();
        let storage = Storage::new(&store, &registry);

        let mut first = run.clone();
        first.state = RunState::Running;
        storage.save_job_run(&mut first).await.unwrap();
        assert_eq!(first.version, 2);

        let mut stale = run;
        let err = storage.save_job_run(&mut stale).await.unwrap_err();
        assert!(err.is_version_conflict());
        assert_eq!(stale.version, 1);
        assert_eq!(
            store.get_job_run("r1").await.unwrap().unwrap().state,
            RunState::Running
        );
    }
}
