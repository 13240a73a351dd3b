use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filters::JobTaskFilter;
use crate::payload::PayloadMap;
use crate::repositories::ListRequest;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "CANCELLING")]
    Cancelling,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Running => "RUNNING",
            RunState::Done => "DONE",
            RunState::Cancelling => "CANCELLING",
            RunState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 作业被取消的原因，记录后不再重新推导
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CancellationReason {
    #[serde(rename = "JobDuplicate")]
    Duplicate,
    #[serde(rename = "JobdefInvalidOrGone")]
    DefInvalidOrGone,
    #[serde(rename = "JobdefChanged")]
    DefChanged,
    #[serde(rename = "JobtypeInvalidOrGone")]
    JobTypeInvalidOrGone,
}

impl CancellationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationReason::Duplicate => "JobDuplicate",
            CancellationReason::DefInvalidOrGone => "JobdefInvalidOrGone",
            CancellationReason::DefChanged => "JobdefChanged",
            CancellationReason::JobTypeInvalidOrGone => "JobtypeInvalidOrGone",
        }
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 作业运行：某个作业定义的一次计划或手动执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub version: i64,
    pub handler_id: String,
    pub job_def_id: String,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<CancellationReason>,
    pub due_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    pub auto_scheduled: bool,
    /// 全局唯一：防止多个实例为同一前驱重复调度后继
    pub scheduled_next_after: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_prep_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_finalize_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<PayloadMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<PayloadMap>,
    /// 由处理器的任务生成阶段给出，收尾时用于筛选交给结果收集器的任务
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_task_filter: Option<JobTaskFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_task_list_request: Option<ListRequest>,
}

impl JobRun {
    pub fn new_pending(
        id: impl Into<String>,
        job_def_id: impl Into<String>,
        handler_id: impl Into<String>,
        due_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            version: 1,
            handler_id: handler_id.into(),
            job_def_id: job_def_id.into(),
            state: RunState::Pending,
            cancellation_reason: None,
            due_time,
            start_time: None,
            finish_time: None,
            auto_scheduled: false,
            scheduled_next_after: String::new(),
            duration_prep_minutes: None,
            duration_finalize_minutes: None,
            details: None,
            results: None,
            final_task_filter: None,
            final_task_list_request: None,
        }
    }

    pub fn is_cancelling_or_cancelled(&self) -> bool {
        matches!(self.state, RunState::Cancelling | RunState::Cancelled)
    }

    /// 最近一次有意义的时间点：结束时间、开始时间、计划时间依次取第一个存在的
    pub fn last_time(&self) -> DateTime<Utc> {
        self.finish_time.or(self.start_time).unwrap_or(self.due_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_state_and_reason_wire_names() {
        assert_eq!(
            serde_json::to_value(RunState::Cancelling).unwrap(),
            serde_json::json!("CANCELLING")
        );
        assert_eq!(
            serde_json::to_value(CancellationReason::DefInvalidOrGone).unwrap(),
            serde_json::json!("JobdefInvalidOrGone")
        );
        assert_eq!(CancellationReason::Duplicate.to_string(), "JobDuplicate");
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::Cancelling.is_terminal());
    }

    #[test]
    fn test_last_time_fallbacks() {
        let due = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut run = JobRun::new_pending("r1", "def", "handler", due);
        assert_eq!(run.version, 1);
        assert_eq!(run.last_time(), due);

        let started = due + chrono::Duration::minutes(1);
        run.start_time = Some(started);
        assert_eq!(run.last_time(), started);

        let finished = due + chrono::Duration::minutes(5);
        run.finish_time = Some(finished);
        assert_eq!(run.last_time(), finished);
    }
}
