use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use processor_scheduler::app::{AppMode, Application};
use processor_scheduler::shutdown::ShutdownManager;
use scheduler_core::config::AppConfig;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("processor-scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("数据处理任务调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时查找 config/scheduler.toml"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["dispatcher", "worker", "api", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("node-name")
                .long("node-name")
                .value_name("NAME")
                .help("处理节点名称，覆盖配置中的 worker.node_name"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置中的 observability.log_level")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置中的 observability.log_format")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mode_str = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");

    let mut config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("默认位置")))?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    if let Some(name) = matches.get_one::<String>("node-name") {
        config.worker.node_name = name.clone();
    }

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    info!("启动数据处理任务调度系统");
    info!("运行模式: {mode_str}");

    let mode = AppMode::parse(mode_str)?;
    let app = Application::new(config, mode).await?;

    let shutdown_manager = ShutdownManager::new();
    let app_handle = {
        let manager = shutdown_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = app.run(manager.subscribe()).await {
                error!("应用运行失败: {e:#}");
            }
            // 应用自行退出时同样结束主循环
            manager.shutdown();
        })
    };

    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            info!("收到关闭信号，开始优雅关闭...");
        }
        _ = shutdown_manager.wait_for_shutdown() => {}
    }
    shutdown_manager.shutdown();

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("数据处理任务调度系统已退出");
    Ok(())
}

fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        _ => return Err(anyhow::anyhow!("不支持的日志格式: {log_format}")),
    }

    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("安装SIGTERM信号处理器失败")?;
    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result.context("安装Ctrl+C信号处理器失败")?;
            info!("收到Ctrl+C信号");
        }
        _ = terminate => {
            info!("收到SIGTERM信号");
        }
    }
    Ok(())
}
