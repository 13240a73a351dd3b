use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use jobs_core::JobsConfig;
use jobs_dispatcher::{Engine, HandlerRegistry};
use jobs_domain::{JobDef, JobStore, Schedule};
use jobs_infrastructure::InMemoryJobStore;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod demo;

const DEMO_DEF_ID: &str = "demo";

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("jobs")
        .version("1.0.0")
        .about("定时作业调度与执行引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时依次查找默认位置"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("demo-def-crontab")
                .long("demo-def-crontab")
                .value_name("CRONTAB")
                .help("演示作业定义的调度规则")
                .default_value("*/2 * * * *"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = JobsConfig::load(config_path.map(String::as_str))
        .with_context(|| format!("加载配置失败: {config_path:?}"))?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }

    // 初始化日志系统
    init_logging(&config.observability.log_level, &config.observability.log_format)?;

    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    info!("在 {host} 上启动作业引擎");

    let mut registry = HandlerRegistry::new();
    registry
        .register(Some(demo::HANDLER_ID), demo::SumHandler::default)
        .context("注册演示处理器失败")?;

    let store = Arc::new(InMemoryJobStore::new());
    let engine = Engine::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        registry,
        config.engine.clone(),
    );

    let crontab = matches
        .get_one::<String>("demo-def-crontab")
        .cloned()
        .unwrap_or_default();
    let mut def = demo_job_def(&crontab);
    let errs = engine.validate_job_def(&mut def);
    if let Some(err) = errs.first() {
        return Err(anyhow::anyhow!("演示作业定义无效: {err}"));
    }
    store.upsert_job_def(def);

    engine.on_job_run_finalized(|run, stats| {
        info!(
            job_run = %run.id,
            results = ?run.results,
            percent_success = ?stats.and_then(|stats| stats.percent_success()),
            "作业运行已结束"
        );
    });

    engine.resume();
    match engine.create_job_run(DEMO_DEF_ID, None, None).await {
        Ok(run) => info!("已创建手动作业运行 {}", run.id),
        Err(e) => warn!("创建手动作业运行失败: {e}"),
    }

    // 等待关闭信号
    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");

    match tokio::time::timeout(Duration::from_secs(30), engine.shutdown()).await {
        Ok(()) => info!("作业引擎已优雅关闭"),
        Err(_) => warn!("作业引擎关闭超时，强制退出"),
    }
    Ok(())
}

fn demo_job_def(crontab: &str) -> JobDef {
    let mut def = JobDef::new(DEMO_DEF_ID, demo::HANDLER_ID);
    def.schedules.push(Schedule::new(crontab));
    def.allow_manual_job_runs = true;
    def.task_retries = 2;
    def.delete_after_days = 1;
    def
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
