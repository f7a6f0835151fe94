use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use openworld_vpn::config::{load_config, ServiceConfig};
use openworld_vpn::ipc::{IpcClient, IpcServer};
use openworld_vpn::tunnel::TunnelService;

#[derive(Parser)]
#[command(name = "openworld-vpn", version, about = "VPN tunnel control service")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 运行后台服务（隧道 + IPC）
    Serve,
    /// 启动隧道
    Start {
        #[arg(default_value = "")]
        category: String,
        #[arg(default_value = "")]
        tag: String,
    },
    /// 关闭隧道
    Close,
    /// 以相同选择重建隧道
    Restart,
    Status,
    /// 切换分类或选中成员
    Select {
        category: String,
        #[arg(default_value = "")]
        tag: String,
    },
    Groups,
    Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();

    match cli.command {
        Command::Serve => serve(config).await,
        command => client(&config, command).await,
    }
}

async fn serve(config: ServiceConfig) -> Result<()> {
    info!(data_dir = %config.data_dir.display(), "openworld-vpn starting");
    std::fs::create_dir_all(&config.data_dir)?;

    let service = Arc::new(TunnelService::from_config(&config));
    let shutdown = CancellationToken::new();

    let server = IpcServer::from_config(&config);
    let ipc = tokio::spawn(server.serve(service.clone(), shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();

    if let Err(e) = service.close().await {
        error!(error = %e, "tunnel close failed during shutdown");
    }
    ipc.await??;
    Ok(())
}

async fn client(config: &ServiceConfig, command: Command) -> Result<()> {
    let client = IpcClient::from_config(config);
    match command {
        Command::Start { category, tag } => client.start(&category, &tag).await?,
        Command::Close => client.close().await?,
        Command::Restart => client.restart().await?,
        Command::Status => println!("{}", client.status().await?),
        Command::Select { category, tag } => client.select(&category, &tag).await?,
        Command::Groups => {
            for group in client.groups().await? {
                println!(
                    "{} [{}] selected={} members={}",
                    group.tag,
                    group.group_type,
                    group.selected,
                    group.members.join(",")
                );
            }
        }
        Command::Metrics => {
            println!("{}", serde_json::to_string_pretty(&client.metrics().await?)?);
        }
        Command::Serve => anyhow::bail!("serve is not a client command"),
    }
    Ok(())
}
