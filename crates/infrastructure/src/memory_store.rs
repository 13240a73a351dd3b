//! 内存存储后端
//!
//! 适用于测试与嵌入式演示。事务通过撤销日志实现：事务内的写操作直接落到数据上，
//! 同时记录被覆盖的旧值和本事务写入的版本，失败或被中途丢弃时按逆序恢复。
//! 回滚只恢复仍停留在本事务写入版本上的记录，事务外已提交的后续写入保持不变。

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use jobs_core::{JobsError, JobsResult};
use jobs_domain::{
    compare_job_runs, compare_job_tasks, Filter, JobDef, JobDefFilter, JobRun, JobRunFilter,
    JobStore, JobTask, JobTaskFilter, ListRequest, Page, Sorting, TxFn,
};
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryData {
    defs: BTreeMap<String, JobDef>,
    runs: BTreeMap<String, JobRun>,
    tasks: BTreeMap<String, JobTask>,
}

/// 一次写入的撤销记录
///
/// `prev` 为被覆盖前的旧值，`None` 表示写入前不存在；
/// `written` 为本事务留下的版本，`None` 表示本事务删除了该记录。
#[derive(Debug)]
enum UndoEntry {
    Run {
        id: String,
        prev: Option<JobRun>,
        written: Option<i64>,
    },
    Task {
        id: String,
        prev: Option<JobTask>,
        written: Option<i64>,
    },
}

/// 当前记录是否仍是本事务写入的那一版
fn still_written<T>(
    current: Option<&T>,
    written: Option<i64>,
    version: impl Fn(&T) -> i64,
) -> bool {
    match (current, written) {
        (Some(current), Some(v)) => version(current) == v,
        (None, None) => true,
        _ => false,
    }
}

type Journal = Mutex<Vec<UndoEntry>>;

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    data: RwLock<MemoryData>,
    /// 事务之间串行执行
    tx_lock: tokio::sync::Mutex<()>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_defs(defs: impl IntoIterator<Item = JobDef>) -> Self {
        let store = Self::new();
        for def in defs {
            store.upsert_job_def(def);
        }
        store
    }

    /// 作业定义由外部配置维护，这里只提供直接写入
    pub fn upsert_job_def(&self, def: JobDef) {
        let mut data = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        data.defs.insert(def.id.clone(), def);
    }

    pub fn remove_job_def(&self, id: &str) -> Option<JobDef> {
        let mut data = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        data.defs.remove(id)
    }

    fn read(&self) -> JobsResult<RwLockReadGuard<'_, MemoryData>> {
        self.data
            .read()
            .map_err(|_| JobsError::storage("内存存储锁已中毒"))
    }

    fn write(&self) -> JobsResult<RwLockWriteGuard<'_, MemoryData>> {
        self.data
            .write()
            .map_err(|_| JobsError::storage("内存存储锁已中毒"))
    }

    fn runs_matching(&self, filter: &JobRunFilter, sort: &[Sorting]) -> JobsResult<Vec<JobRun>> {
        let data = self.read()?;
        let mut runs: Vec<JobRun> = data
            .runs
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        if !sort.is_empty() {
            runs.sort_by(|a, b| compare_job_runs(a, b, sort));
        }
        Ok(runs)
    }

    fn tasks_matching(&self, filter: &JobTaskFilter, sort: &[Sorting]) -> JobsResult<Vec<JobTask>> {
        let data = self.read()?;
        let mut tasks: Vec<JobTask> = data
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        if !sort.is_empty() {
            tasks.sort_by(|a, b| compare_job_tasks(a, b, sort));
        }
        Ok(tasks)
    }

    fn insert_runs(&self, runs: Vec<JobRun>) -> JobsResult<Vec<UndoEntry>> {
        let mut data = self.write()?;
        let mut ids = HashSet::new();
        let mut prevs = HashSet::new();
        for run in &runs {
            if data.runs.contains_key(&run.id) || !ids.insert(run.id.as_str()) {
                return Err(JobsError::storage(format!(
                    "duplicate job run id '{}'",
                    run.id
                )));
            }
            if !run.scheduled_next_after.is_empty() {
                let taken = !prevs.insert(run.scheduled_next_after.as_str())
                    || data
                        .runs
                        .values()
                        .any(|existing| existing.scheduled_next_after == run.scheduled_next_after);
                if taken {
                    return Err(JobsError::storage(format!(
                        "duplicate scheduled_next_after '{}' for job run '{}'",
                        run.scheduled_next_after, run.id
                    )));
                }
            }
        }
        let mut undo = Vec::with_capacity(runs.len());
        for run in runs {
            undo.push(UndoEntry::Run {
                id: run.id.clone(),
                prev: None,
                written: Some(run.version),
            });
            data.runs.insert(run.id.clone(), run);
        }
        Ok(undo)
    }

    fn insert_tasks(&self, tasks: Vec<JobTask>) -> JobsResult<Vec<UndoEntry>> {
        let mut data = self.write()?;
        let mut ids = HashSet::new();
        for task in &tasks {
            if data.tasks.contains_key(&task.id) || !ids.insert(task.id.as_str()) {
                return Err(JobsError::storage(format!(
                    "duplicate job task id '{}'",
                    task.id
                )));
            }
        }
        let mut undo = Vec::with_capacity(tasks.len());
        for task in tasks {
            undo.push(UndoEntry::Task {
                id: task.id.clone(),
                prev: None,
                written: Some(task.version),
            });
            data.tasks.insert(task.id.clone(), task);
        }
        Ok(undo)
    }

    /// 删除作业运行时一并删除其任务
    fn delete_runs(&self, filter: &JobRunFilter) -> JobsResult<(u64, Vec<UndoEntry>)> {
        let mut data = self.write()?;
        let ids: Vec<String> = data
            .runs
            .values()
            .filter(|run| filter.matches(run))
            .map(|run| run.id.clone())
            .collect();
        let mut undo = Vec::new();
        for id in &ids {
            let task_ids: Vec<String> = data
                .tasks
                .values()
                .filter(|task| task.job_run_id == *id)
                .map(|task| task.id.clone())
                .collect();
            for task_id in task_ids {
                let prev = data.tasks.remove(&task_id);
                undo.push(UndoEntry::Task {
                    id: task_id,
                    prev,
                    written: None,
                });
            }
            let prev = data.runs.remove(id);
            undo.push(UndoEntry::Run {
                id: id.clone(),
                prev,
                written: None,
            });
        }
        Ok((ids.len() as u64, undo))
    }

    fn delete_tasks(&self, filter: &JobTaskFilter) -> JobsResult<(u64, Vec<UndoEntry>)> {
        let mut data = self.write()?;
        let ids: Vec<String> = data
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .map(|task| task.id.clone())
            .collect();
        let mut undo = Vec::with_capacity(ids.len());
        for id in ids {
            let prev = data.tasks.remove(&id);
            undo.push(UndoEntry::Task {
                id,
                prev,
                written: None,
            });
        }
        Ok((undo.len() as u64, undo))
    }

    fn save_run(&self, run: &JobRun, expected_version: i64) -> JobsResult<Vec<UndoEntry>> {
        let mut data = self.write()?;
        match data.runs.get(&run.id) {
            Some(stored) if stored.version == expected_version => {
                let prev = data.runs.insert(run.id.clone(), run.clone());
                Ok(vec![UndoEntry::Run {
                    id: run.id.clone(),
                    prev,
                    written: Some(run.version),
                }])
            }
            _ => Err(JobsError::VersionConflict {
                kind: "job_run",
                id: run.id.clone(),
                expected: expected_version,
            }),
        }
    }

    fn save_task(&self, task: &JobTask, expected_version: i64) -> JobsResult<Vec<UndoEntry>> {
        let mut data = self.write()?;
        match data.tasks.get(&task.id) {
            Some(stored) if stored.version == expected_version => {
                let prev = data.tasks.insert(task.id.clone(), task.clone());
                Ok(vec![UndoEntry::Task {
                    id: task.id.clone(),
                    prev,
                    written: Some(task.version),
                }])
            }
            _ => Err(JobsError::VersionConflict {
                kind: "job_task",
                id: task.id.clone(),
                expected: expected_version,
            }),
        }
    }

    fn rollback(&self, undo: Vec<UndoEntry>) {
        let mut data = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug!(entries = undo.len(), "回滚内存事务");
        for entry in undo.into_iter().rev() {
            match entry {
                UndoEntry::Run { id, prev, written } => {
                    if !still_written(data.runs.get(&id), written, |run| run.version) {
                        debug!(job_run = %id, "作业运行已被事务外写入，跳过回滚");
                        continue;
                    }
                    match prev {
                        Some(prev) => data.runs.insert(id, prev),
                        None => data.runs.remove(&id),
                    };
                }
                UndoEntry::Task { id, prev, written } => {
                    if !still_written(data.tasks.get(&id), written, |task| task.version) {
                        debug!(job_task = %id, "作业任务已被事务外写入，跳过回滚");
                        continue;
                    }
                    match prev {
                        Some(prev) => data.tasks.insert(id, prev),
                        None => data.tasks.remove(&id),
                    };
                }
            }
        }
    }
}

fn paginate<T>(items: Vec<T>, req: &ListRequest) -> JobsResult<Page<T>> {
    let offset = match req.page_token.as_deref() {
        None | Some("") => 0,
        Some(token) => token
            .parse::<usize>()
            .map_err(|_| JobsError::storage(format!("invalid page token '{token}'")))?,
    };
    let total = items.len();
    let mut items: Vec<T> = items.into_iter().skip(offset).collect();
    let mut next_page_token = None;
    if req.page_size > 0 && items.len() > req.page_size {
        items.truncate(req.page_size);
        next_page_token = Some((offset + req.page_size).to_string());
    }
    debug_assert!(offset <= total || items.is_empty());
    Ok(Page {
        items,
        next_page_token,
    })
}

fn limited(count: usize, limit: u64) -> u64 {
    let count = count as u64;
    if limit > 0 {
        count.min(limit)
    } else {
        count
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get_job_def(&self, id: &str) -> JobsResult<Option<JobDef>> {
        Ok(self.read()?.defs.get(id).cloned())
    }

    async fn find_job_def(&self, filter: &JobDefFilter) -> JobsResult<Option<JobDef>> {
        Ok(self
            .read()?
            .defs
            .values()
            .find(|def| filter.matches(def))
            .cloned())
    }

    async fn list_job_defs(&self, filter: &JobDefFilter) -> JobsResult<Vec<JobDef>> {
        Ok(self
            .read()?
            .defs
            .values()
            .filter(|def| filter.matches(def))
            .cloned()
            .collect())
    }

    async fn get_job_run(&self, id: &str) -> JobsResult<Option<JobRun>> {
        Ok(self.read()?.runs.get(id).cloned())
    }

    async fn find_job_run(
        &self,
        filter: &JobRunFilter,
        sort: &[Sorting],
    ) -> JobsResult<Option<JobRun>> {
        Ok(self.runs_matching(filter, sort)?.into_iter().next())
    }

    async fn list_job_runs(
        &self,
        req: &ListRequest,
        filter: &JobRunFilter,
    ) -> JobsResult<Page<JobRun>> {
        paginate(self.runs_matching(filter, &req.sort)?, req)
    }

    async fn count_job_runs(&self, limit: u64, filter: &JobRunFilter) -> JobsResult<u64> {
        let data = self.read()?;
        let count = data.runs.values().filter(|run| filter.matches(run)).count();
        Ok(limited(count, limit))
    }

    async fn insert_job_runs(&self, runs: Vec<JobRun>) -> JobsResult<()> {
        self.insert_runs(runs).map(|_| ())
    }

    async fn delete_job_runs(&self, filter: &JobRunFilter) -> JobsResult<u64> {
        self.delete_runs(filter).map(|(n, _)| n)
    }

    async fn get_job_task(&self, id: &str) -> JobsResult<Option<JobTask>> {
        Ok(self.read()?.tasks.get(id).cloned())
    }

    async fn find_job_task(
        &self,
        filter: &JobTaskFilter,
        sort: &[Sorting],
    ) -> JobsResult<Option<JobTask>> {
        Ok(self.tasks_matching(filter, sort)?.into_iter().next())
    }

    async fn list_job_tasks(
        &self,
        req: &ListRequest,
        filter: &JobTaskFilter,
    ) -> JobsResult<Page<JobTask>> {
        paginate(self.tasks_matching(filter, &req.sort)?, req)
    }

    async fn count_job_tasks(&self, limit: u64, filter: &JobTaskFilter) -> JobsResult<u64> {
        let data = self.read()?;
        let count = data.tasks.values().filter(|task| filter.matches(task)).count();
        Ok(limited(count, limit))
    }

    async fn insert_job_tasks(&self, tasks: Vec<JobTask>) -> JobsResult<()> {
        self.insert_tasks(tasks).map(|_| ())
    }

    async fn delete_job_tasks(&self, filter: &JobTaskFilter) -> JobsResult<u64> {
        self.delete_tasks(filter).map(|(n, _)| n)
    }

    async fn save_job_run_guarded(&self, run: &JobRun, expected_version: i64) -> JobsResult<()> {
        self.save_run(run, expected_version).map(|_| ())
    }

    async fn save_job_task_guarded(
        &self,
        task: &JobTask,
        expected_version: i64,
    ) -> JobsResult<()> {
        self.save_task(task, expected_version).map(|_| ())
    }

    async fn transacted(&self, tx: TxFn) -> JobsResult<()> {
        let _serial = self.tx_lock.lock().await;
        let mut guard = RollbackGuard {
            store: self,
            journal: Mutex::new(Vec::new()),
            committed: false,
        };
        let result = {
            let view = TxStore {
                store: self,
                journal: &guard.journal,
            };
            tx(&view).await
        };
        if result.is_ok() {
            guard.committed = true;
        }
        result
    }
}

/// 未提交即被丢弃时回滚
struct RollbackGuard<'a> {
    store: &'a InMemoryJobStore,
    journal: Journal,
    committed: bool,
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let undo = match self.journal.get_mut() {
            Ok(undo) => std::mem::take(undo),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        if !undo.is_empty() {
            self.store.rollback(undo);
        }
    }
}

/// 事务内的存储视图：读直通，写记入撤销日志
struct TxStore<'a> {
    store: &'a InMemoryJobStore,
    journal: &'a Journal,
}

impl TxStore<'_> {
    fn record(&self, undo: Vec<UndoEntry>) -> JobsResult<()> {
        self.journal
            .lock()
            .map_err(|_| JobsError::storage("事务日志锁已中毒"))?
            .extend(undo);
        Ok(())
    }
}

#[async_trait]
impl JobStore for TxStore<'_> {
    async fn get_job_def(&self, id: &str) -> JobsResult<Option<JobDef>> {
        self.store.get_job_def(id).await
    }

    async fn find_job_def(&self, filter: &JobDefFilter) -> JobsResult<Option<JobDef>> {
        self.store.find_job_def(filter).await
    }

    async fn list_job_defs(&self, filter: &JobDefFilter) -> JobsResult<Vec<JobDef>> {
        self.store.list_job_defs(filter).await
    }

    async fn get_job_run(&self, id: &str) -> JobsResult<Option<JobRun>> {
        self.store.get_job_run(id).await
    }

    async fn find_job_run(
        &self,
        filter: &JobRunFilter,
        sort: &[Sorting],
    ) -> JobsResult<Option<JobRun>> {
        self.store.find_job_run(filter, sort).await
    }

    async fn list_job_runs(
        &self,
        req: &ListRequest,
        filter: &JobRunFilter,
    ) -> JobsResult<Page<JobRun>> {
        self.store.list_job_runs(req, filter).await
    }

    async fn count_job_runs(&self, limit: u64, filter: &JobRunFilter) -> JobsResult<u64> {
        self.store.count_job_runs(limit, filter).await
    }

    async fn insert_job_runs(&self, runs: Vec<JobRun>) -> JobsResult<()> {
        let undo = self.store.insert_runs(runs)?;
        self.record(undo)
    }

    async fn delete_job_runs(&self, filter: &JobRunFilter) -> JobsResult<u64> {
        let (n, undo) = self.store.delete_runs(filter)?;
        self.record(undo)?;
        Ok(n)
    }

    async fn get_job_task(&self, id: &str) -> JobsResult<Option<JobTask>> {
        self.store.get_job_task(id).await
    }

    async fn find_job_task(
        &self,
        filter: &JobTaskFilter,
        sort: &[Sorting],
    ) -> JobsResult<Option<JobTask>> {
        self.store.find_job_task(filter, sort).await
    }

    async fn list_job_tasks(
        &self,
        req: &ListRequest,
        filter: &JobTaskFilter,
    ) -> JobsResult<Page<JobTask>> {
        self.store.list_job_tasks(req, filter).await
    }

    async fn count_job_tasks(&self, limit: u64, filter: &JobTaskFilter) -> JobsResult<u64> {
        self.store.count_job_tasks(limit, filter).await
    }

    async fn insert_job_tasks(&self, tasks: Vec<JobTask>) -> JobsResult<()> {
        let undo = self.store.insert_tasks(tasks)?;
        self.record(undo)
    }

    async fn delete_job_tasks(&self, filter: &JobTaskFilter) -> JobsResult<u64> {
        let (n, undo) = self.store.delete_tasks(filter)?;
        self.record(undo)?;
        Ok(n)
    }

    async fn save_job_run_guarded(&self, run: &JobRun, expected_version: i64) -> JobsResult<()> {
        let undo = self.store.save_run(run, expected_version)?;
        self.record(undo)
    }

    async fn save_job_task_guarded(
        &self,
        task: &JobTask,
        expected_version: i64,
    ) -> JobsResult<()> {
        let undo = self.store.save_task(task, expected_version)?;
        self.record(undo)
    }

    /// 嵌套事务并入外层事务
    async fn transacted(&self, tx: TxFn) -> JobsResult<()> {
        tx(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use jobs_domain::{tx_fn, RunState, TaskState};

    fn run(id: &str, prev: &str) -> JobRun {
        let mut run = JobRun::new_pending(
            id,
            "def",
            "handler",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        run.scheduled_next_after = prev.to_string();
        run
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let store = InMemoryJobStore::new();
        store.insert_job_runs(vec![run("r1", "_none_a")]).await.unwrap();

        let err = store
            .insert_job_runs(vec![run("r1", "_none_b")])
            .await
            .unwrap_err();
        assert!(matches!(err, JobsError::Storage(_)));

        let err = store
            .insert_job_runs(vec![run("r2", "_none_a")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("scheduled_next_after"));

        // 批量插入要么全部成功要么全部失败
        let err = store
            .insert_job_runs(vec![run("r3", "x"), run("r4", "x")])
            .await;
        assert!(err.is_err());
        assert_eq!(store.get_job_run("r3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_guarded_save() {
        let store = InMemoryJobStore::new();
        store.insert_job_runs(vec![run("r1", "p")]).await.unwrap();

        let mut updated = run("r1", "p");
        updated.state = RunState::Running;
        updated.version = 2;
        store.save_job_run_guarded(&updated, 1).await.unwrap();

        let err = store.save_job_run_guarded(&updated, 1).await.unwrap_err();
        assert!(err.is_version_conflict());
        let stored = store.get_job_run("r1").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.state, RunState::Running);

        let missing = store.save_job_run_guarded(&run("zz", "q"), 1).await;
        assert!(missing.unwrap_err().is_version_conflict());
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let store = InMemoryJobStore::new();
        store.insert_job_runs(vec![run("r1", "p")]).await.unwrap();

        let result = store
            .transacted(tx_fn(|tx| {
                Box::pin(async move {
                    tx.insert_job_tasks(vec![JobTask::new_pending("r1", 1, "handler", None)])
                        .await?;
                    let mut r = tx.get_job_run("r1").await?.unwrap();
                    r.state = RunState::Running;
                    r.version = 2;
                    tx.save_job_run_guarded(&r, 1).await?;
                    Err(JobsError::storage("boom"))
                })
            }))
            .await;
        assert!(result.is_err());
        assert_eq!(store.get_job_task("r1_1").await.unwrap(), None);
        let stored = store.get_job_run("r1").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.state, RunState::Pending);
    }

    #[tokio::test]
    async fn test_transaction_commits() {
        let store = InMemoryJobStore::new();
        store
            .transacted(tx_fn(|tx| {
                Box::pin(async move {
                    tx.insert_job_runs(vec![run("r1", "p")]).await?;
                    tx.insert_job_tasks(vec![
                        JobTask::new_pending("r1", 1, "handler", None),
                        JobTask::new_pending("r1", 2, "handler", None),
                    ])
                    .await
                })
            }))
            .await
            .unwrap();
        assert_eq!(
            store
                .count_job_tasks(0, &JobTaskFilter::new().with_job_runs(["r1"]))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = std::sync::Arc::new(InMemoryJobStore::new());
        let (inserted_tx, inserted_rx) = tokio::sync::oneshot::channel::<()>();
        let inner = store.clone();
        let handle = tokio::spawn(async move {
            inner
                .transacted(tx_fn(move |tx| {
                    Box::pin(async move {
                        tx.insert_job_runs(vec![run("r1", "p")]).await?;
                        let _ = inserted_tx.send(());
                        futures::future::pending::<()>().await;
                        Ok(())
                    })
                }))
                .await
        });
        inserted_rx.await.unwrap();
        assert!(store.get_job_run("r1").await.unwrap().is_some());
        handle.abort();
        let _ = handle.await;
        assert_eq!(store.get_job_run("r1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_runs_cascades_to_tasks() {
        let store = InMemoryJobStore::new();
        store
            .insert_job_runs(vec![run("r1", "a"), run("r2", "b")])
            .await
            .unwrap();
        store
            .insert_job_tasks(vec![
                JobTask::new_pending("r1", 1, "handler", None),
                JobTask::new_pending("r2", 1, "handler", None),
            ])
            .await
            .unwrap();
        let n = store
            .delete_job_runs(&JobRunFilter::new().with_ids(["r1"]))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.get_job_task("r1_1").await.unwrap(), None);
        assert!(store.get_job_task("r2_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_paging_and_count_limit() {
        let store = InMemoryJobStore::new();
        let tasks = (1..=5)
            .map(|n| JobTask::new_pending("r", n, "handler", None))
            .collect();
        store.insert_job_tasks(tasks).await.unwrap();

        let mut req = ListRequest::with_page_size(2);
        let mut seen = Vec::new();
        loop {
            let page = store
                .list_job_tasks(&req, &JobTaskFilter::new().with_states([TaskState::Pending]))
                .await
                .unwrap();
            seen.extend(page.items.into_iter().map(|t| t.id));
            match page.next_page_token {
                Some(token) => req.page_token = Some(token),
                None => break,
            }
        }
        assert_eq!(seen, vec!["r_1", "r_2", "r_3", "r_4", "r_5"]);
        assert_eq!(
            store.count_job_tasks(3, &JobTaskFilter::new()).await.unwrap(),
            3
        );
    }
}
