use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// 计数类选项的合法范围
pub const COUNT_OPTION_RANGE: (usize, usize) = (2, 128);
/// 时长类选项（秒）的合法范围: 2秒 ~ 22小时
pub const DURATION_OPTION_RANGE_SECS: (u64, u64) = (2, 22 * 60 * 60);

/// 引擎运行参数
///
/// 各 interval 不是"每隔 n 执行一次"，而是"本轮结束后等待 n 再执行下一轮"。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 记录所有作业运行的状态迁移（info级别）
    pub log_job_lifecycle_events: bool,
    /// 记录所有作业任务的状态迁移（info级别）
    pub log_task_lifecycle_events: bool,
    /// 启动到期作业、收尾已完成/取消中作业的间隔，应小于半分钟
    pub interval_start_and_finalize_jobs_secs: u64,
    /// 拉取并执行待运行任务的间隔，应小于半分钟
    pub interval_run_tasks_secs: u64,
    /// 过期或重试失联任务的间隔，建议几分钟
    pub interval_expire_or_retry_dead_tasks_secs: u64,
    /// 补齐作业调度的间隔；正常情况下作业收尾时就会调度下一次
    pub interval_ensure_job_schedules_secs: u64,
    /// 删除存储过期作业的间隔，可以是小时级
    pub interval_delete_storage_expired_jobs_secs: u64,
    /// 简短存储操作的超时
    pub timeout_short_secs: u64,
    /// 并发处理多个资源时的并发上限
    pub max_concurrent_ops: usize,
    /// 每轮最多拉取的待运行任务数
    pub fetch_tasks_to_run: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_job_lifecycle_events: false,
            log_task_lifecycle_events: false,
            interval_start_and_finalize_jobs_secs: 22,
            interval_run_tasks_secs: 11,
            interval_expire_or_retry_dead_tasks_secs: 3 * 60,
            interval_ensure_job_schedules_secs: 2 * 60,
            interval_delete_storage_expired_jobs_secs: 5 * 60 * 60,
            timeout_short_secs: 22,
            max_concurrent_ops: 6,
            fetch_tasks_to_run: 3,
        }
    }
}

impl EngineConfig {
    pub fn interval_start_and_finalize_jobs(&self) -> Duration {
        Duration::from_secs(self.interval_start_and_finalize_jobs_secs)
    }
    pub fn interval_run_tasks(&self) -> Duration {
        Duration::from_secs(self.interval_run_tasks_secs)
    }
    pub fn interval_expire_or_retry_dead_tasks(&self) -> Duration {
        Duration::from_secs(self.interval_expire_or_retry_dead_tasks_secs)
    }
    pub fn interval_ensure_job_schedules(&self) -> Duration {
        Duration::from_secs(self.interval_ensure_job_schedules_secs)
    }
    pub fn interval_delete_storage_expired_jobs(&self) -> Duration {
        Duration::from_secs(self.interval_delete_storage_expired_jobs_secs)
    }
    pub fn timeout_short(&self) -> Duration {
        Duration::from_secs(self.timeout_short_secs)
    }

    /// 超出范围的选项重置为默认值
    pub fn sanitize(mut self) -> Self {
        let defaults = Self::default();
        let (min, max) = COUNT_OPTION_RANGE;
        for (name, value, default) in [
            ("max_concurrent_ops", &mut self.max_concurrent_ops, defaults.max_concurrent_ops),
            ("fetch_tasks_to_run", &mut self.fetch_tasks_to_run, defaults.fetch_tasks_to_run),
        ] {
            if *value < min || *value > max {
                warn!("引擎选项 {name}={value} 超出范围 {min}-{max}，改用默认值 {default}");
                *value = default;
            }
        }

        let (min, max) = DURATION_OPTION_RANGE_SECS;
        for (name, value, default) in [
            ("timeout_short_secs", &mut self.timeout_short_secs, defaults.timeout_short_secs),
            (
                "interval_start_and_finalize_jobs_secs",
                &mut self.interval_start_and_finalize_jobs_secs,
                defaults.interval_start_and_finalize_jobs_secs,
            ),
            (
                "interval_run_tasks_secs",
                &mut self.interval_run_tasks_secs,
                defaults.interval_run_tasks_secs,
            ),
            (
                "interval_expire_or_retry_dead_tasks_secs",
                &mut self.interval_expire_or_retry_dead_tasks_secs,
                defaults.interval_expire_or_retry_dead_tasks_secs,
            ),
            (
                "interval_ensure_job_schedules_secs",
                &mut self.interval_ensure_job_schedules_secs,
                defaults.interval_ensure_job_schedules_secs,
            ),
            (
                "interval_delete_storage_expired_jobs_secs",
                &mut self.interval_delete_storage_expired_jobs_secs,
                defaults.interval_delete_storage_expired_jobs_secs,
            ),
        ] {
            if *value < min || *value > max {
                warn!("引擎选项 {name}={value}s 超出范围 {min}s-{max}s，改用默认值 {default}s");
                *value = default;
            }
        }
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let (min, max) = COUNT_OPTION_RANGE;
        if !(min..=max).contains(&self.max_concurrent_ops) {
            return Err(anyhow::anyhow!(
                "最大并发操作数必须在 {min}-{max} 之间，当前: {}",
                self.max_concurrent_ops
            ));
        }
        if !(min..=max).contains(&self.fetch_tasks_to_run) {
            return Err(anyhow::anyhow!(
                "每轮拉取任务数必须在 {min}-{max} 之间，当前: {}",
                self.fetch_tasks_to_run
            ));
        }

        let (min, max) = DURATION_OPTION_RANGE_SECS;
        for (name, value) in [
            ("timeout_short_secs", self.timeout_short_secs),
            ("interval_start_and_finalize_jobs_secs", self.interval_start_and_finalize_jobs_secs),
            ("interval_run_tasks_secs", self.interval_run_tasks_secs),
            (
                "interval_expire_or_retry_dead_tasks_secs",
                self.interval_expire_or_retry_dead_tasks_secs,
            ),
            ("interval_ensure_job_schedules_secs", self.interval_ensure_job_schedules_secs),
            (
                "interval_delete_storage_expired_jobs_secs",
                self.interval_delete_storage_expired_jobs_secs,
            ),
        ] {
            if !(min..=max).contains(&value) {
                return Err(anyhow::anyhow!("{name} 必须在 {min}-{max} 秒之间，当前: {value}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.interval_run_tasks(), Duration::from_secs(11));
        assert_eq!(config.max_concurrent_ops, 6);
    }

    #[test]
    fn test_sanitize_resets_out_of_range_values() {
        let config = EngineConfig {
            max_concurrent_ops: 1,
            fetch_tasks_to_run: 500,
            interval_run_tasks_secs: 0,
            timeout_short_secs: 30 * 60 * 60,
            interval_ensure_job_schedules_secs: 60,
            ..Default::default()
        }
        .sanitize();

        assert_eq!(config.max_concurrent_ops, 6);
        assert_eq!(config.fetch_tasks_to_run, 3);
        assert_eq!(config.interval_run_tasks_secs, 11);
        assert_eq!(config.timeout_short_secs, 22);
        assert_eq!(config.interval_ensure_job_schedules_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = EngineConfig {
            max_concurrent_ops: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            interval_delete_storage_expired_jobs_secs: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
