//! 存储后端契约
//!
//! 引擎只依赖这里的最小读写接口：增删查、带版本守卫的保存与事务。
//! 具体持久化方式由实现方决定。

use std::cmp::Ordering;

use async_trait::async_trait;
use futures::future::BoxFuture;
use jobs_core::JobsResult;
use serde::{Deserialize, Serialize};

use crate::entities::{JobDef, JobRun, JobTask};
use crate::filters::{JobDefFilter, JobRunFilter, JobTaskFilter};

/// 排序项，`key` 取实体字段名（`due_time`、`finish_time`、`start_time`、`id` 等）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sorting {
    pub key: String,
    #[serde(default)]
    pub descending: bool,
}

impl Sorting {
    pub fn asc(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            descending: false,
        }
    }

    pub fn desc(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            descending: true,
        }
    }
}

/// 分页请求；`page_size` 为0表示不分页
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub page_size: usize,
    #[serde(skip)]
    pub page_token: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<Sorting>,
}

impl ListRequest {
    pub fn unpaged() -> Self {
        Self::default()
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            ..Default::default()
        }
    }

    pub fn with_sort(mut self, sort: Vec<Sorting>) -> Self {
        self.sort = sort;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    pub fn single(items: Vec<T>) -> Self {
        Self {
            items,
            next_page_token: None,
        }
    }
}

/// 作业运行的默认排序：计划时间、结束时间、开始时间、标识，全部倒序
pub fn default_job_run_sorting() -> Vec<Sorting> {
    vec![
        Sorting::desc("due_time"),
        Sorting::desc("finish_time"),
        Sorting::desc("start_time"),
        Sorting::desc("id"),
    ]
}

/// 按排序项比较两个作业运行，未知字段忽略
pub fn compare_job_runs(a: &JobRun, b: &JobRun, sort: &[Sorting]) -> Ordering {
    compare_by(sort, |key| match key {
        "due_time" => Some(a.due_time.cmp(&b.due_time)),
        "finish_time" => Some(a.finish_time.cmp(&b.finish_time)),
        "start_time" => Some(a.start_time.cmp(&b.start_time)),
        "id" => Some(a.id.cmp(&b.id)),
        "job_def_id" => Some(a.job_def_id.cmp(&b.job_def_id)),
        "version" => Some(a.version.cmp(&b.version)),
        _ => None,
    })
}

/// 按排序项比较两个作业任务，未知字段忽略
pub fn compare_job_tasks(a: &JobTask, b: &JobTask, sort: &[Sorting]) -> Ordering {
    compare_by(sort, |key| match key {
        "id" => Some(a.id.cmp(&b.id)),
        "start_time" => Some(a.start_time.cmp(&b.start_time)),
        "finish_time" => Some(a.finish_time.cmp(&b.finish_time)),
        "state" => Some(a.state.cmp(&b.state)),
        "job_run_id" => Some(a.job_run_id.cmp(&b.job_run_id)),
        _ => None,
    })
}

fn compare_by(sort: &[Sorting], cmp_key: impl Fn(&str) -> Option<Ordering>) -> Ordering {
    for sorting in sort {
        if let Some(ord) = cmp_key(&sorting.key) {
            let ord = if sorting.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
    }
    Ordering::Equal
}

pub type TxFuture<'a> = BoxFuture<'a, JobsResult<()>>;

/// 事务体：拿到事务内的存储视图，全部成功才提交
pub type TxFn = Box<dyn for<'a> FnOnce(&'a dyn JobStore) -> TxFuture<'a> + Send>;

/// 把闭包装箱为 [`TxFn`]，写法为 `tx_fn(move |store| Box::pin(async move { ... }))`
pub fn tx_fn<F>(f: F) -> TxFn
where
    F: for<'a> FnOnce(&'a dyn JobStore) -> TxFuture<'a> + Send + 'static,
{
    Box::new(f)
}

/// 作业存储后端
///
/// 带版本守卫的保存是唯一的并发控制手段：存储中的版本不等于
/// `expected_version` 时必须返回 `JobsError::VersionConflict` 且不做任何修改。
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job_def(&self, id: &str) -> JobsResult<Option<JobDef>>;
    async fn find_job_def(&self, filter: &JobDefFilter) -> JobsResult<Option<JobDef>>;
    async fn list_job_defs(&self, filter: &JobDefFilter) -> JobsResult<Vec<JobDef>>;

    async fn get_job_run(&self, id: &str) -> JobsResult<Option<JobRun>>;
    async fn find_job_run(
        &self,
        filter: &JobRunFilter,
        sort: &[Sorting],
    ) -> JobsResult<Option<JobRun>>;
    async fn list_job_runs(
        &self,
        req: &ListRequest,
        filter: &JobRunFilter,
    ) -> JobsResult<Page<JobRun>>;
    /// `limit` 为0表示不设上限
    async fn count_job_runs(&self, limit: u64, filter: &JobRunFilter) -> JobsResult<u64>;
    async fn insert_job_runs(&self, runs: Vec<JobRun>) -> JobsResult<()>;
    async fn delete_job_runs(&self, filter: &JobRunFilter) -> JobsResult<u64>;

    async fn get_job_task(&self, id: &str) -> JobsResult<Option<JobTask>>;
    async fn find_job_task(
        &self,
        filter: &JobTaskFilter,
        sort: &[Sorting],
    ) -> JobsResult<Option<JobTask>>;
    async fn list_job_tasks(
        &self,
        req: &ListRequest,
        filter: &JobTaskFilter,
    ) -> JobsResult<Page<JobTask>>;
    async fn count_job_tasks(&self, limit: u64, filter: &JobTaskFilter) -> JobsResult<u64>;
    async fn insert_job_tasks(&self, tasks: Vec<JobTask>) -> JobsResult<()>;
    async fn delete_job_tasks(&self, filter: &JobTaskFilter) -> JobsResult<u64>;

    async fn save_job_run_guarded(&self, run: &JobRun, expected_version: i64) -> JobsResult<()>;
    async fn save_job_task_guarded(&self, task: &JobTask, expected_version: i64)
        -> JobsResult<()>;

    /// 在单个原子事务中执行 `tx`，出错时回滚
    async fn transacted(&self, tx: TxFn) -> JobsResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_default_run_sorting_is_newest_first() {
        let t = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
        let early = JobRun::new_pending("b", "def", "h", t(1));
        let late = JobRun::new_pending("a", "def", "h", t(2));
        let mut late_twin = late.clone();
        late_twin.id = "c".to_string();

        let sort = default_job_run_sorting();
        let mut runs = vec![early.clone(), late.clone(), late_twin.clone()];
        runs.sort_by(|a, b| compare_job_runs(a, b, &sort));
        let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_unknown_sort_keys_ignored() {
        let a = JobTask::new_pending("r", 1, "h", None);
        let b = JobTask::new_pending("r", 2, "h", None);
        assert_eq!(
            compare_job_tasks(&a, &b, &[Sorting::asc("nonsense")]),
            Ordering::Equal
        );
        assert_eq!(
            compare_job_tasks(&a, &b, &[Sorting::desc("id")]),
            Ordering::Greater
        );
    }

    #[test]
    fn test_list_request_skips_page_token() {
        let mut req = ListRequest::with_page_size(10).with_sort(vec![Sorting::asc("id")]);
        req.page_token = Some("20".to_string());
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "page_size": 10, "sort": [{ "key": "id", "descending": false }] })
        );
        let back: ListRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.page_token, None);
    }
}
