use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flowjob_core::config::AppConfig;

mod app;
mod shutdown;

use app::{AppMode, Application};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("flowjob")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式任务调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .default_value("config/flowjob.toml"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["supervisor", "worker", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别（未设置 RUST_LOG 时生效）")
                .default_value("info"),
        )
        .get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config/flowjob.toml");
    let config = AppConfig::load(config_path).context("加载配置失败")?;

    let mode = match matches.get_one::<String>("mode").map(String::as_str) {
        Some("supervisor") => AppMode::Supervisor,
        Some("worker") => AppMode::Worker,
        _ => AppMode::All,
    };
    info!("flowjob 启动: mode={:?} config={}", mode, config_path);

    Application::new(config, mode).run().await
}
