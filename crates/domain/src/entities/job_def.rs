use std::borrow::Cow;
use std::time::Duration;

use chrono::{DateTime, Months, Utc};
use jobs_core::{clamp, JobsError, JobsResult};
use serde::{Deserialize, Serialize};

use crate::crontab::{self, CrontabExpr};
use crate::payload::PayloadMap;

/// 未配置任务超时或准备/收尾超时的作业定义所用的默认值
pub const TIMEOUT_LONG: Duration = Duration::from_secs(2 * 60);

const TASK_RUN_TIMEOUT_SECS: (u64, u64) = (11, 22 * 60 * 60);
const PREP_AND_FINALIZE_TIMEOUT_SECS: (u64, u64) = (22, 11 * 60 * 60);
const MAX_TASK_RETRIES: u32 = 1234;
const MAX_SEARCH_YEARS: u32 = 123;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub disabled: bool,
    #[serde(rename = "rule")]
    pub crontab: String,
    #[serde(skip)]
    parsed: Option<CrontabExpr>,
}

impl Schedule {
    pub fn new(crontab: impl Into<String>) -> Self {
        Self {
            disabled: false,
            crontab: crontab.into(),
            parsed: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// 已解析的表达式；未经 `ensure_valid` 时现场解析
    pub fn expr(&self) -> Option<Cow<'_, CrontabExpr>> {
        match &self.parsed {
            Some(expr) => Some(Cow::Borrowed(expr)),
            None => crontab::parse(&self.crontab).ok().map(Cow::Owned),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimeouts {
    #[serde(default)]
    pub task_run_secs: u64,
    #[serde(default)]
    pub job_prep_and_finalize_secs: u64,
}

/// 作业定义：调度规则与执行策略，由外部配置维护，引擎只读
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDef {
    pub id: String,
    pub handler_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    #[serde(default)]
    pub allow_manual_job_runs: bool,
    #[serde(default)]
    pub timeouts: JobTimeouts,
    #[serde(default)]
    pub task_retries: u32,
    #[serde(default)]
    pub delete_after_days: u32,
    #[serde(default)]
    pub log_job_lifecycle_events: Option<bool>,
    #[serde(default)]
    pub log_task_lifecycle_events: Option<bool>,
    #[serde(default)]
    pub default_job_details: Option<PayloadMap>,
}

impl JobDef {
    pub fn new(id: impl Into<String>, handler_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handler_id: handler_id.into(),
            ..Default::default()
        }
    }

    /// 规整超时与重试次数并解析全部调度规则，返回发现的所有问题。
    ///
    /// `has_handler` 表示 `handler_id` 能否在注册表中找到。
    pub fn ensure_valid(&mut self, has_handler: bool) -> Vec<JobsError> {
        let mut errs = Vec::new();
        if !has_handler && !self.disabled {
            errs.push(JobsError::HandlerRemoved {
                def_id: self.id.clone(),
                handler_id: self.handler_id.clone(),
            });
        }

        self.timeouts.task_run_secs = clamp_timeout(self.timeouts.task_run_secs, TASK_RUN_TIMEOUT_SECS);
        self.timeouts.job_prep_and_finalize_secs = clamp_timeout(
            self.timeouts.job_prep_and_finalize_secs,
            PREP_AND_FINALIZE_TIMEOUT_SECS,
        );
        self.task_retries = clamp(0, MAX_TASK_RETRIES, self.task_retries);

        let num_schedules = self.schedules.len();
        for (idx, schedule) in self.schedules.iter_mut().enumerate() {
            schedule.crontab = schedule.crontab.trim().to_string();
            if schedule.crontab.is_empty() {
                errs.push(JobsError::InvalidJobDef(format!(
                    "job def '{}' schedule {}/{} requires a `rule`",
                    self.id,
                    idx + 1,
                    num_schedules
                )));
                continue;
            }
            if schedule.parsed.is_none() {
                match crontab::parse(&schedule.crontab) {
                    Ok(expr) => schedule.parsed = Some(expr),
                    Err(err) => errs.push(JobsError::InvalidJobDef(format!(
                        "job def '{}' schedule {}/{} syntax error in '{}': {}",
                        self.id,
                        idx + 1,
                        num_schedules,
                        schedule.crontab,
                        err
                    ))),
                }
            }
        }
        errs
    }

    /// 启用的定义遇到第一个问题即失败；禁用的定义始终通过
    pub fn ensure_valid_or_error_if_enabled(&mut self, has_handler: bool) -> JobsResult<()> {
        let errs = self.ensure_valid(has_handler);
        match errs.into_iter().next() {
            Some(err) if !self.disabled => Err(err),
            _ => Ok(()),
        }
    }

    pub fn has_any_schedules_enabled(&self) -> bool {
        self.schedules.iter().any(|s| !s.disabled)
    }

    pub fn task_run_timeout(&self) -> Duration {
        match self.timeouts.task_run_secs {
            0 => TIMEOUT_LONG,
            secs => Duration::from_secs(secs),
        }
    }

    pub fn job_prep_and_finalize_timeout(&self) -> Duration {
        match self.timeouts.job_prep_and_finalize_secs {
            0 => TIMEOUT_LONG,
            secs => Duration::from_secs(secs),
        }
    }

    /// 在所有启用的调度规则中寻找离 `now` 最近的可调度时刻。
    ///
    /// 过去的候选严格晚于 `after`。若错过的过去时刻比下一次未来时刻更近则优先补跑，
    /// `always_prefer_overdue` 且给出了 `after` 时只要存在过去候选就选它。
    pub fn find_closest_to_now_schedulable_time_since(
        &self,
        now: DateTime<Utc>,
        after: Option<DateTime<Utc>>,
        always_prefer_overdue: bool,
    ) -> Option<DateTime<Utc>> {
        if self.disabled {
            return None;
        }
        let max_search_date = now.checked_add_months(Months::new(MAX_SEARCH_YEARS * 12))?;

        let mut past: Option<DateTime<Utc>> = None;
        let mut future: Option<DateTime<Utc>> = None;
        for schedule in self.schedules.iter().filter(|s| !s.disabled) {
            let Some(expr) = schedule.expr() else {
                continue;
            };
            let (p, f) = expr.soonest_to(&now, after.as_ref(), Some(&max_search_date));
            if let Some(p) = p {
                if past.map_or(true, |past| p > past) {
                    past = Some(p);
                }
            }
            if let Some(f) = f {
                if future.map_or(true, |future| f < future) {
                    future = Some(f);
                }
            }
        }

        match (past, future) {
            (None, future) => future,
            (Some(past), None) => Some(past),
            (Some(past), Some(_)) if always_prefer_overdue && after.is_some() => Some(past),
            (Some(past), Some(future)) => {
                if now - past < future - now {
                    Some(past)
                } else {
                    Some(future)
                }
            }
        }
    }

    /// 给定时刻是否满足任一启用的调度规则
    pub fn ok(&self, t: &DateTime<Utc>) -> bool {
        !self.disabled
            && self
                .schedules
                .iter()
                .filter(|s| !s.disabled)
                .filter_map(|s| s.expr())
                .any(|expr| expr.date_and_time_ok(t))
    }
}

/// 0 视为 TIMEOUT_LONG（120 秒），再限制到 `[min, max]`
fn clamp_timeout(secs: u64, (min, max): (u64, u64)) -> u64 {
    let secs = if secs == 0 { TIMEOUT_LONG.as_secs() } else { secs };
    clamp(min, max, secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn def_with(schedules: &[&str]) -> JobDef {
        let mut def = JobDef::new("reports", "report_handler");
        def.schedules = schedules.iter().map(|s| Schedule::new(*s)).collect();
        def
    }

    #[test]
    fn test_ensure_valid_clamps_and_defaults() {
        let mut def = def_with(&["*/5 * * * *"]);
        def.timeouts.task_run_secs = 3;
        def.timeouts.job_prep_and_finalize_secs = 0;
        def.task_retries = 5000;
        assert!(def.ensure_valid(true).is_empty());
        assert_eq!(def.timeouts.task_run_secs, 11);
        assert_eq!(def.timeouts.job_prep_and_finalize_secs, 120);
        assert_eq!(def.task_retries, MAX_TASK_RETRIES);

        def.timeouts.task_run_secs = 100 * 60 * 60;
        def.timeouts.job_prep_and_finalize_secs = 100 * 60 * 60;
        def.ensure_valid(true);
        assert_eq!(def.task_run_timeout(), Duration::from_secs(22 * 60 * 60));
        assert_eq!(
            def.job_prep_and_finalize_timeout(),
            Duration::from_secs(11 * 60 * 60)
        );
    }

    #[test]
    fn test_ensure_valid_reports_every_problem() {
        let mut def = def_with(&["  ", "61 * * * *", " 0 0 * * * "]);
        let errs = def.ensure_valid(false);
        assert_eq!(errs.len(), 3);
        assert!(matches!(errs[0], JobsError::HandlerRemoved { .. }));
        assert!(errs[1].to_string().contains("schedule 1/3 requires a `rule`"));
        assert!(errs[2].to_string().contains("schedule 2/3 syntax error"));
        assert_eq!(def.schedules[2].crontab, "0 0 * * *");
    }

    #[test]
    fn test_disabled_def_tolerates_errors() {
        let mut def = def_with(&["bogus"]);
        assert!(def.ensure_valid_or_error_if_enabled(false).is_err());
        def.disabled = true;
        assert!(def.ensure_valid_or_error_if_enabled(false).is_ok());
    }

    #[test]
    fn test_closest_prefers_nearer_past_occurrence() {
        let def = def_with(&["0 * * * *"]);
        // 10:10：过去的10:00比未来的11:00更近
        let now = utc(2024, 5, 5, 10, 10);
        assert_eq!(
            def.find_closest_to_now_schedulable_time_since(now, None, false),
            Some(utc(2024, 5, 5, 10, 0))
        );
        // 10:50：未来的11:00更近
        let now = utc(2024, 5, 5, 10, 50);
        assert_eq!(
            def.find_closest_to_now_schedulable_time_since(now, None, false),
            Some(utc(2024, 5, 5, 11, 0))
        );
    }

    #[test]
    fn test_closest_prefers_overdue_after_last_run() {
        let def = def_with(&["0 * * * *"]);
        let now = utc(2024, 5, 5, 10, 50);
        let after = Some(utc(2024, 5, 5, 9, 30));
        assert_eq!(
            def.find_closest_to_now_schedulable_time_since(now, after, true),
            Some(utc(2024, 5, 5, 10, 0))
        );
        // 上次运行已覆盖10:00：只剩未来
        let after = Some(utc(2024, 5, 5, 10, 0));
        assert_eq!(
            def.find_closest_to_now_schedulable_time_since(now, after, true),
            Some(utc(2024, 5, 5, 11, 0))
        );
    }

    #[test]
    fn test_closest_across_schedules_and_disabled() {
        let mut def = def_with(&["0 12 * * *", "30 10 * * *"]);
        let now = utc(2024, 5, 5, 10, 20);
        assert_eq!(
            def.find_closest_to_now_schedulable_time_since(now, None, false),
            Some(utc(2024, 5, 5, 10, 30))
        );
        def.schedules[1].disabled = true;
        assert!(!def.ok(&utc(2024, 5, 5, 10, 30)));
        assert!(def.ok(&utc(2024, 5, 6, 12, 0)));

        def.schedules[0].disabled = true;
        assert_eq!(
            def.find_closest_to_now_schedulable_time_since(now, None, false),
            None
        );
        def.disabled = true;
        assert!(!def.ok(&utc(2024, 5, 6, 12, 0)));
    }

    #[test]
    fn test_deserializes_rule_field() {
        let def: JobDef = serde_json::from_value(serde_json::json!({
            "id": "cleanup",
            "handler_id": "cleanup_handler",
            "schedules": [{ "rule": "@daily" }, { "rule": "@hourly", "disabled": true }],
            "task_retries": 2
        }))
        .unwrap();
        assert_eq!(def.schedules.len(), 2);
        assert!(def.schedules[1].disabled);
        assert!(def.has_any_schedules_enabled());
        assert_eq!(def.task_retries, 2);
        assert_eq!(def.task_run_timeout(), TIMEOUT_LONG);
    }
}
