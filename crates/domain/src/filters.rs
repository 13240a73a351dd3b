//! 作业定义、作业运行、作业任务的筛选条件
//!
//! 每个字段设置后才参与筛选，未设置的字段不关心。筛选逻辑是纯函数，
//! 存储后端可以直接在内存中调用 `matches`，也可以翻译成自己的查询。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{JobDef, JobRun, JobTask, RunState, TaskState};

pub trait Filter<T> {
    fn matches(&self, item: &T) -> bool;
}

/// 没有筛选条件时匹配一切
impl<T, F: Filter<T>> Filter<T> for Option<F> {
    fn matches(&self, item: &T) -> bool {
        self.as_ref().map_or(true, |filter| filter.matches(item))
    }
}

fn dedup(mut ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
    ids
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_expiry: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_manual_job_runs: Option<bool>,
    #[serde(default)]
    pub enabled_schedules: bool,
    #[serde(default)]
    pub disabled_schedules: bool,
}

impl JobDefFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = dedup(ids.into_iter().map(Into::into).collect());
        self
    }

    /// 按显示名称做不区分大小写的包含匹配
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = Some(disabled);
        self
    }

    /// 是否配置了存储过期（保留天数大于0）
    pub fn with_storage_expiry(mut self, storage_expiry: bool) -> Self {
        self.storage_expiry = Some(storage_expiry);
        self
    }

    pub fn with_allow_manual_job_runs(mut self, allow: bool) -> Self {
        self.allow_manual_job_runs = Some(allow);
        self
    }

    /// 至少有一条启用的调度规则
    pub fn with_enabled_schedules(mut self) -> Self {
        self.enabled_schedules = true;
        self.disabled_schedules = false;
        self
    }

    /// 没有任何启用的调度规则
    pub fn with_disabled_schedules(mut self) -> Self {
        self.disabled_schedules = true;
        self.enabled_schedules = false;
        self
    }
}

impl Filter<JobDef> for JobDefFilter {
    fn matches(&self, def: &JobDef) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&def.id) {
            return false;
        }
        if let Some(name) = &self.display_name {
            let display_name = def.display_name.as_deref().unwrap_or_default();
            if !display_name.to_lowercase().contains(&name.to_lowercase()) {
                return false;
            }
        }
        if self.disabled.is_some_and(|disabled| disabled != def.disabled) {
            return false;
        }
        if self
            .storage_expiry
            .is_some_and(|expiry| expiry != (def.delete_after_days > 0))
        {
            return false;
        }
        if self
            .allow_manual_job_runs
            .is_some_and(|allow| allow != def.allow_manual_job_runs)
        {
            return false;
        }
        if self.enabled_schedules && !def.has_any_schedules_enabled() {
            return false;
        }
        if self.disabled_schedules && def.has_any_schedules_enabled() {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub job_defs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handler_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<RunState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_scheduled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_next_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// 计划时间不晚于该时刻的才算到期
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_by: Option<DateTime<Utc>>,
}

impl JobRunFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_job_defs<I, S>(mut self, job_defs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job_defs = job_defs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_handler_ids<I, S>(mut self, handler_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handler_ids = handler_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_states(mut self, states: impl IntoIterator<Item = RunState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    pub fn with_auto_scheduled(mut self, auto_scheduled: bool) -> Self {
        self.auto_scheduled = Some(auto_scheduled);
        self
    }

    pub fn with_finished_before(mut self, finished_before: DateTime<Utc>) -> Self {
        self.finished_before = Some(finished_before);
        self
    }

    pub fn with_scheduled_next_after(mut self, scheduled_next_after: impl Into<String>) -> Self {
        self.scheduled_next_after = Some(scheduled_next_after.into());
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// 只要在 `now` 之前（含）到期的
    pub fn with_due(mut self, now: DateTime<Utc>) -> Self {
        self.due_by = Some(now);
        self
    }
}

impl Filter<JobRun> for JobRunFilter {
    fn matches(&self, run: &JobRun) -> bool {
        (self.ids.is_empty() || self.ids.contains(&run.id))
            && (self.job_defs.is_empty() || self.job_defs.contains(&run.job_def_id))
            && (self.handler_ids.is_empty() || self.handler_ids.contains(&run.handler_id))
            && (self.states.is_empty() || self.states.contains(&run.state))
            && self
                .auto_scheduled
                .map_or(true, |auto| auto == run.auto_scheduled)
            && self.finished_before.map_or(true, |before| {
                run.finish_time.is_some_and(|finished| finished < before)
            })
            && self
                .scheduled_next_after
                .as_ref()
                .map_or(true, |prev| *prev == run.scheduled_next_after)
            && self.version.map_or(true, |version| version == run.version)
            && self.due_by.map_or(true, |now| run.due_time <= now)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTaskFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub job_runs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handler_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_before: Option<DateTime<Utc>>,
    /// `Some(true)` 只要失败的，`Some(false)` 只要成功的
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl JobTaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// 空串和 `*` 会被忽略
    pub fn with_job_runs<I, S>(mut self, job_runs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job_runs = job_runs
            .into_iter()
            .map(Into::into)
            .filter(|id: &String| !id.is_empty() && id != "*")
            .collect();
        self
    }

    pub fn with_handler_ids<I, S>(mut self, handler_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handler_ids = handler_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_states(mut self, states: impl IntoIterator<Item = TaskState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    pub fn with_started_before(mut self, started_before: DateTime<Utc>) -> Self {
        self.started_before = Some(started_before);
        self
    }

    pub fn with_failed(mut self) -> Self {
        self.failed = Some(true);
        self
    }

    pub fn with_succeeded(mut self) -> Self {
        self.failed = Some(false);
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }
}

impl Filter<JobTask> for JobTaskFilter {
    fn matches(&self, task: &JobTask) -> bool {
        (self.ids.is_empty() || self.ids.contains(&task.id))
            && (self.job_runs.is_empty() || self.job_runs.contains(&task.job_run_id))
            && (self.handler_ids.is_empty() || self.handler_ids.contains(&task.handler_id))
            && (self.states.is_empty() || self.states.contains(&task.state))
            && self.started_before.map_or(true, |before| {
                task.start_time.is_some_and(|started| started < before)
            })
            && self.failed.map_or(true, |failed| {
                if failed {
                    task.failed()
                } else {
                    task.succeeded()
                }
            })
            && self.version.map_or(true, |version| version == task.version)
    }
}
