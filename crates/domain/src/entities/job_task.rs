use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::PayloadMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 4] = [
        TaskState::Pending,
        TaskState::Running,
        TaskState::Done,
        TaskState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Done => "DONE",
            TaskState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次执行尝试的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 作业任务：作业运行中的一个执行单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTask {
    pub id: String,
    pub version: i64,
    pub handler_id: String,
    pub job_run_id: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    /// 新的在前
    #[serde(default)]
    pub attempts: Vec<TaskAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<PayloadMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<PayloadMap>,
}

impl JobTask {
    /// 作业运行内第 `n` 个任务（从1开始）的标识
    pub fn id_for(job_run_id: &str, n: usize) -> String {
        format!("{job_run_id}_{n}")
    }

    pub fn new_pending(
        job_run_id: impl Into<String>,
        n: usize,
        handler_id: impl Into<String>,
        details: Option<PayloadMap>,
    ) -> Self {
        let job_run_id = job_run_id.into();
        Self {
            id: Self::id_for(&job_run_id, n),
            version: 1,
            handler_id: handler_id.into(),
            job_run_id,
            state: TaskState::Pending,
            start_time: None,
            finish_time: None,
            attempts: Vec::new(),
            details,
            results: None,
        }
    }

    pub fn latest_attempt(&self) -> Option<&TaskAttempt> {
        self.attempts.first()
    }

    pub fn latest_error(&self) -> Option<&str> {
        self.latest_attempt().and_then(|a| a.error.as_deref())
    }

    pub fn failed(&self) -> bool {
        self.state == TaskState::Done && self.latest_error().is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.state == TaskState::Done
            && self.latest_attempt().is_some()
            && self.latest_error().is_none()
    }

    /// 记录新一次尝试，放在最前
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.attempts.insert(
            0,
            TaskAttempt {
                time: now,
                error: None,
            },
        );
    }

    /// 为最新一次尝试补上错误信息（已有错误时保留原值）
    pub fn set_latest_error_if_none(&mut self, error: impl Into<String>) {
        if let Some(attempt) = self.attempts.first_mut() {
            if attempt.error.is_none() {
                attempt.error = Some(error.into());
            }
        }
    }

    /// 仍有重试额度时回到 PENDING，否则以 DONE 结束；返回是否会重试。
    ///
    /// `task_retries` 为 `None` 表示作业定义已不可用，直接结束。
    pub fn mark_for_retry_or_as_failed(
        &mut self,
        now: DateTime<Utc>,
        task_retries: Option<u32>,
    ) -> bool {
        match task_retries {
            Some(retries) if self.attempts.len() <= retries as usize => {
                self.state = TaskState::Pending;
                self.start_time = None;
                self.finish_time = None;
                true
            }
            _ => {
                self.state = TaskState::Done;
                self.finish_time = Some(now);
                false
            }
        }
    }
}
