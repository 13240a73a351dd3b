pub mod engine_config;

pub use engine_config::*;

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// 环境变量前缀，例如 `JOBS_ENGINE__MAX_CONCURRENT_OPS=8`
pub const ENV_PREFIX: &str = "JOBS";

const DEFAULT_CONFIG_PATHS: [&str; 3] = ["config/jobs.toml", "jobs.toml", "/etc/jobs/config.toml"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub engine: EngineConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// "json" 或 "pretty"
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level,
                valid_levels
            ));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志格式: {}，支持的格式: {:?}",
                self.log_format,
                valid_formats
            ));
        }
        Ok(())
    }
}

impl JobsConfig {
    /// 加载配置：指定文件（必须存在）或默认路径中的第一个，然后叠加环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: JobsConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: JobsConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_jobs_config_from_toml_partial() {
        let config = JobsConfig::from_toml(
            r#"
[engine]
max_concurrent_ops = 12
log_task_lifecycle_events = true

[observability]
log_format = "json"
"#,
        )
        .unwrap();

        assert_eq!(config.engine.max_concurrent_ops, 12);
        assert!(config.engine.log_task_lifecycle_events);
        assert_eq!(config.engine.interval_run_tasks_secs, 11);
        assert_eq!(config.observability.log_format, "json");
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_jobs_config_rejects_invalid_values() {
        assert!(JobsConfig::from_toml("[engine]\nfetch_tasks_to_run = 1\n").is_err());
        assert!(JobsConfig::from_toml("[observability]\nlog_level = \"loud\"\n").is_err());
    }

    #[test]
    fn test_jobs_config_toml_round_trip() {
        let config = JobsConfig::default();
        let toml_str = config.to_toml().unwrap();
        let parsed = JobsConfig::from_toml(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_jobs_config_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[engine]\ninterval_run_tasks_secs = 5").unwrap();

        let config = JobsConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.engine.interval_run_tasks_secs, 5);
    }

    #[test]
    fn test_jobs_config_load_missing_file() {
        assert!(JobsConfig::load(Some("/definitely/not/here.toml")).is_err());
    }
}
