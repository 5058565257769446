use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use raypool_cli::{parse_partition, print_servers, resolve, sorted};
use raypool_core::{init_logger, Config, LatencyProber, Registry, Subscriber, SystemPinger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 不启动内核，直接管理本地保存的服务器列表
#[derive(Debug, Parser)]
#[command(name = "raypool-cli", version, about = "RayPool offline management")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// 显示所有服务器
    List,
    /// 添加代理链接
    Import { url: String },
    /// 移到用户分区
    Promote { server: String },
    /// 移到订阅分区
    Demote { server: String },
    /// 更新订阅
    Subscribe,
    /// 延迟测试
    Ping,
    /// 清空分区（user/sub）
    Clear { partition: String },
    /// 移除连通性连续失败的服务器
    ClearFailed { threshold: Option<u32> },
    /// 输出代理环境变量
    Env,
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

async fn resolve_id(registry: &Registry, target: &str) -> Result<String> {
    let servers = sorted(registry.snapshot().await);
    match resolve(target, &servers) {
        Some(server) => Ok(server.id.clone()),
        None => bail!("找不到服务器: {}", target),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_init(&cli.config)
        .with_context(|| format!("加载配置 {} 失败", cli.config.display()))?;
    init_logger(&config.log_level);

    std::fs::create_dir_all(&config.data_dir)?;
    let registry = Registry::open(config.state_file())?;
    info!("已加载 {} 个服务器", registry.len().await);

    match cli.command {
        Action::List => {
            let selected = registry.selected().await;
            print_servers(&sorted(registry.snapshot().await), selected.as_deref());
        }
        Action::Import { url } => {
            let server = registry.add_user_link(&url).await?;
            println!("{} [{}] {}", "已添加".green().bold(), server.name, server.host.cyan());
        }
        Action::Promote { server } => {
            let id = resolve_id(&registry, &server).await?;
            if registry.move_to_user(&id).await? {
                println!("{}", "已移到用户分区".green());
            } else {
                println!("{}", "已在用户分区".yellow());
            }
        }
        Action::Demote { server } => {
            let id = resolve_id(&registry, &server).await?;
            if registry.move_to_subscription(&id).await? {
                println!("{}", "已移到订阅分区".green());
            } else {
                println!("{}", "已在订阅分区".yellow());
            }
        }
        Action::Subscribe => {
            let subscriber = Subscriber::new(registry.clone(), &config.subscription)?;
            let pb = spinner("更新订阅");
            let report = subscriber.refresh().await?;
            pb.finish_and_clear();
            if let Some(report) = report {
                println!(
                    "{} {}/{} 个订阅成功, 新增 {} 个服务器",
                    "订阅更新完成:".green().bold(),
                    report.feeds - report.failed_feeds,
                    report.feeds,
                    report.added
                );
            }
        }
        Action::Ping => {
            let pinger = SystemPinger::new(Duration::from_secs(config.latency.timeout));
            let prober = LatencyProber::new(registry.clone(), Arc::new(pinger), config.latency.clone());
            let pb = spinner("延迟测试");
            let report = prober.probe_all().await?;
            pb.finish_and_clear();
            if let Some(report) = report {
                println!(
                    "{} {}/{} 可达, 移除 {} 个",
                    "延迟测试完成:".green().bold(),
                    report.reachable,
                    report.tested,
                    report.evicted
                );
            }
            let selected = registry.selected().await;
            print_servers(&sorted(registry.snapshot().await), selected.as_deref());
        }
        Action::Clear { partition } => {
            let partition = parse_partition(&partition).map_err(anyhow::Error::msg)?;
            let removed = registry.clear(partition).await?;
            println!("{} {} 个", "已清除".green(), removed);
        }
        Action::ClearFailed { threshold } => {
            let threshold = threshold.unwrap_or(config.connectivity.evict_threshold);
            let removed = registry.remove_failed(threshold).await?;
            println!("{} {} 个", "已移除失效服务器".green(), removed);
        }
        Action::Env => {
            println!("{}", config.proxy_env_line());
        }
    }
    Ok(())
}
