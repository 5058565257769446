use anyhow::Result;
use colored::*;
use raypool::ui::{print_banner, print_error, print_info, print_success, print_warning, track};
use raypool::{init_logger, App, Command, Config, Provenance};
use raypool_cli::{print_servers, resolve, sorted, HELP};
use raypool_core::LiveApi;
use std::io::Write;
use std::path::Path;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info};

const VERSION: &str = "v0.1.0";

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// 把序号或ID解析成服务器ID
async fn target_id(app: &App, target: &str) -> Option<String> {
    let servers = sorted(app.registry.snapshot().await);
    resolve(target, &servers).map(|s| s.id.clone())
}

async fn move_server(app: &App, target: &str, to: Provenance) -> raypool::Result<()> {
    let Some(id) = target_id(app, target).await else {
        print_error(&format!("找不到服务器: {}", target));
        return Ok(());
    };
    let label = match to {
        Provenance::User => "用户",
        Provenance::Subscription => "订阅",
    };
    if app.registry.move_to(&id, to).await? {
        print_success(&format!("已移到{}分区", label));
    } else {
        print_warning(&format!("已在{}分区", label));
    }
    Ok(())
}

/// 执行一条交互命令，返回 `false` 表示退出
async fn handle(app: &App, command: Command) -> raypool::Result<bool> {
    match command {
        Command::List => {
            let selected = app.registry.selected().await;
            print_servers(&sorted(app.registry.snapshot().await), selected.as_deref());
        }
        Command::Select(target) => match target_id(app, &target).await {
            Some(id) => {
                let server = app.selection.select(&id).await?;
                print_success(&format!("已切换到 [{}] {}", server.name, server.host));
            }
            None => print_error(&format!("找不到服务器: {}", target)),
        },
        Command::Import(url) => {
            let server = app.registry.add_user_link(&url).await?;
            print_success(&format!("已添加 [{}] {}", server.name, server.host));
        }
        Command::Subscribe => match track("更新订阅", app.subscriber.refresh()).await? {
            Some(report) => print_success(&format!(
                "{}/{} 个订阅成功, 新增 {} 个服务器",
                report.feeds - report.failed_feeds,
                report.feeds,
                report.added
            )),
            None => print_warning("订阅更新正在进行中"),
        },
        Command::Ping => match track("延迟测试", app.latency.probe_all()).await? {
            Some(report) => print_success(&format!(
                "{}/{} 可达, 移除 {} 个",
                report.reachable, report.tested, report.evicted
            )),
            None => print_warning("延迟测试正在进行中"),
        },
        Command::Check => match track("连通性测试", app.connectivity.check_connectivity()).await? {
            Some(report) => print_success(&format!(
                "{} 成功, {} 失败, 移除 {} 个",
                report.succeeded, report.failed, report.evicted
            )),
            None => print_warning("连通性测试正在进行中"),
        },
        Command::Promote(target) => move_server(app, &target, Provenance::User).await?,
        Command::Demote(target) => move_server(app, &target, Provenance::Subscription).await?,
        Command::Clear(partition) => {
            let removed = app.registry.clear(partition).await?;
            print_success(&format!("已清除 {} 个服务器", removed));
        }
        Command::ClearFailed(threshold) => {
            let threshold = threshold.unwrap_or(app.config.connectivity.evict_threshold);
            let removed = app.registry.remove_failed(threshold).await?;
            print_success(&format!("已移除 {} 个失效服务器", removed));
        }
        Command::Stats => {
            let stats = app.orchestrator.main.stats().await?;
            println!("{}", stats.trim());
        }
        Command::Status => {
            print_info(&app.selection.running_status().await);
            print_info(&format!("主实例: {}", app.orchestrator.main.lifecycle().describe()));
            print_info(&format!("测试实例: {}", app.orchestrator.test.lifecycle().describe()));
            print_info(&format!("共 {} 个服务器", app.registry.len().await));
        }
        Command::Env => println!("{}", app.config.proxy_env_line()),
        Command::Help => println!("{}", HELP),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

/// 读取标准输入直到 `quit` 或输入结束
async fn console(app: &App) {
    println!("\n{}\n", HELP);
    prompt();

    let mut lines = BufReader::new(io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            match line.parse::<Command>() {
                Ok(command) => match handle(app, command).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => print_error(&e.to_string()),
                },
                Err(e) => print_error(&e),
            }
        }
        prompt();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner(VERSION);

    // 加载配置
    let config_path = Path::new("config.toml");
    let config = match Config::load_or_init(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{} {}", "加载配置文件失败:".red().bold(), e);
            return Ok(());
        }
    };
    init_logger(&config.log_level);
    info!("RayPool starting, 配置文件 {}", config_path.display());

    let app = App::new(config)?;
    // 启动期间收到 Ctrl+C 也要先停掉已拉起的内核
    let started = tokio::select! {
        result = app.start() => result,
        _ = signal::ctrl_c() => {
            println!("\n{}", "启动期间接收到终止信号，正在关闭...".yellow().bold());
            app.shutdown().await?;
            return Ok(());
        }
    };
    if let Err(e) = started {
        eprintln!("{} {}", "启动内核失败:".red().bold(), e);
        app.shutdown().await?;
        return Ok(());
    }
    print_success(&format!("已加载 {} 个服务器", app.registry.len().await));
    print_info(&app.selection.running_status().await);
    print_info(&app.config.proxy_env_line());

    // 等待Ctrl+C信号或用户输入quit
    tokio::select! {
        _ = signal::ctrl_c() => {
            println!("\n{}", "接收到终止信号，正在关闭...".yellow().bold());
        }
        _ = console(&app) => {
            println!("{}", "用户请求退出，正在关闭...".yellow().bold());
        }
    }

    if let Err(e) = app.shutdown().await {
        error!("关闭内核失败: {}", e);
    }
    println!("{}", "已关闭".green().bold());
    Ok(())
}
