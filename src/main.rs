use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use dataflow_core::{init_tracing, AppConfig, LogConfig, LogLevel, OutputFormat};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tracing::{error, info, warn};

mod app;

use app::{DemoApplication, DemoOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("dataflow-runtime")
        .version(env!("CARGO_PKG_VERSION"))
        .about("数据流任务运行时")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时查找 config/runtime.toml"),
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
                .value_parser(["json", "text", "pretty"]),
        )
        .arg(
            Arg::new("master")
                .long("master")
                .value_name("NAME")
                .help("主节点名称，取值 hostname 时使用本机主机名"),
        )
        .arg(
            Arg::new("tasks")
                .short('n')
                .long("tasks")
                .value_name("N")
                .help("链式与扇出阶段各提交的任务数")
                .value_parser(clap::value_parser!(usize))
                .default_value("4"),
        )
        .arg(
            Arg::new("failure-rate")
                .long("failure-rate")
                .value_name("RATE")
                .help("模拟作业失败概率 [0, 1]")
                .value_parser(clap::value_parser!(f64))
                .default_value("0.0"),
        )
        .arg(
            Arg::new("latency-ms")
                .long("latency-ms")
                .value_name("MS")
                .help("模拟作业执行时间（毫秒）")
                .value_parser(clap::value_parser!(u64))
                .default_value("50"),
        )
        .arg(
            Arg::new("print-metrics")
                .long("print-metrics")
                .help("结束时以Prometheus文本格式输出指标")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("以JSON输出统计报告")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载默认配置失败".to_string(),
    })?;

    init_logging(
        &config,
        matches.get_one::<String>("log-level"),
        matches.get_one::<String>("log-format"),
    )?;

    match matches.get_one::<String>("master").map(String::as_str) {
        Some("hostname") => {
            config.runtime.master_name = hostname::get()
                .context("获取主机名失败")?
                .to_string_lossy()
                .into_owned();
        }
        Some(name) => config.runtime.master_name = name.to_string(),
        None => {}
    }
    app::fill_defaults(&mut config);
    info!(
        "启动数据流运行时: 主节点 {}，{} 个Worker，调度策略 {:?}",
        config.runtime.master_name,
        config.workers.len(),
        config.scheduler.policy
    );

    let options = DemoOptions {
        tasks: matches.get_one::<usize>("tasks").copied().unwrap_or(4),
        failure_rate: matches
            .get_one::<f64>("failure-rate")
            .copied()
            .unwrap_or(0.0)
            .clamp(0.0, 1.0),
        latency: Duration::from_millis(
            matches.get_one::<u64>("latency-ms").copied().unwrap_or(50),
        ),
    };
    let print_json = matches.get_flag("json");
    let metrics = if config.observability.metrics_enabled {
        Some(init_metrics()?)
    } else {
        None
    };

    let app = DemoApplication::start(config, options)?;

    let outcome = tokio::select! {
        result = app.run() => Some(result),
        _ = wait_for_shutdown_signal() => {
            warn!("收到关闭信号，中止应用");
            None
        }
    };

    let report = app.report().await;
    if let Err(e) = app.shutdown().await {
        error!("关闭运行时失败: {e}");
    }

    if print_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    if matches.get_flag("print-metrics") {
        match &metrics {
            Some(handle) => print!("{}", handle.render()),
            None => warn!("指标采集未启用"),
        }
    }

    match outcome {
        Some(Ok(())) => {
            info!("应用执行完成");
            Ok(())
        }
        Some(Err(e)) => Err(e).context("应用执行失败"),
        None => Ok(()),
    }
}

/// 命令行参数优先于配置文件
fn init_logging(
    config: &AppConfig,
    level: Option<&String>,
    format: Option<&String>,
) -> Result<()> {
    let mut log_config: LogConfig = config.observability.log_config()?;
    if let Some(level) = level {
        log_config.level = level.parse::<LogLevel>()?;
    }
    if let Some(format) = format {
        log_config.format = format.parse::<OutputFormat>()?;
    }
    init_tracing(&log_config)?;
    Ok(())
}

/// 安装进程级Prometheus记录器，指标在结束时按需输出
fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("安装指标记录器失败: {e}"))?;
    info!("指标采集已启用");
    Ok(handle)
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("监听Ctrl+C信号失败: {e}");
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
                error!("监听SIGTERM信号失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
