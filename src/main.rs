//! Terminal Bridge 入口点
//!
//! 独立运行的 HTTP/WebSocket 服务，主要功能：
//! - 容器和 SSH 主机内的交互式终端会话
//! - 一次性命令执行
//! - 会话列表和存活检查

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use terminal_bridge::config::{default_config_path, Config};

/// 容器终端桥接服务
#[derive(Debug, Parser)]
#[command(name = "terminal-bridge", version, about)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 监听地址，覆盖配置文件
    #[arg(short, long)]
    listen: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&path)?;
    config.apply_env_overrides();

    if let Some(listen) = &cli.listen {
        config.server.listen = listen.clone();
    }
    if let Some(level) = &cli.log_level {
        config.server.log_level = level.clone();
    }

    config.validate().context("配置校验失败")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    // 日志输出到 stderr，RUST_LOG 优先于配置文件
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    tracing::info!("Terminal Bridge 启动");

    terminal_bridge::transport::serve(config).await
}
