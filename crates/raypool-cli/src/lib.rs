//! RayPool CLI - Command Line Interface for RayPool
//!
//! 交互式命令解析和服务器列表的终端展示，守护进程和离线命令行共用。

use chrono::Local;
use colored::*;
use raypool_core::server::compare_servers;
use raypool_core::{Provenance, ServerRecord};
use std::str::FromStr;

/// 交互命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 显示所有服务器
    List,
    /// 切换服务器（序号或ID）
    Select(String),
    /// 手动添加链接
    Import(String),
    /// 更新订阅
    Subscribe,
    /// 延迟测试
    Ping,
    /// 连通性测试
    Check,
    /// 移到用户分区
    Promote(String),
    /// 移到订阅分区
    Demote(String),
    /// 清空分区
    Clear(Provenance),
    /// 移除连通性连续失败的服务器，不给阈值时用配置值
    ClearFailed(Option<u32>),
    /// 主实例运行统计
    Stats,
    /// 当前状态
    Status,
    /// 代理环境变量
    Env,
    Help,
    Quit,
}

pub const HELP: &str = "\
可用命令:
  list              - 显示所有服务器
  select <n|id>     - 切换到指定服务器
  import <url>      - 添加代理链接
  sub               - 更新订阅
  ping              - 延迟测试
  check             - 连通性测试
  promote <n|id>    - 移到用户分区
  demote <n|id>     - 移到订阅分区
  clear <user|sub>  - 清空分区
  clear-failed [n]  - 移除连续失败的服务器
  stats             - 主实例运行统计
  status            - 当前状态
  env               - 代理环境变量
  quit              - 退出程序";

fn required(arg: Option<&str>, usage: &str) -> Result<String, String> {
    arg.map(str::to_string).ok_or_else(|| format!("用法: {}", usage))
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let name = parts.next().ok_or_else(|| "空命令".to_string())?;
        let arg = parts.next();
        let command = match name.to_ascii_lowercase().as_str() {
            "list" | "ls" => Command::List,
            "select" | "use" => Command::Select(required(arg, "select <n|id>")?),
            "import" | "add" => Command::Import(required(arg, "import <url>")?),
            "sub" | "subscribe" => Command::Subscribe,
            "ping" => Command::Ping,
            "check" => Command::Check,
            "promote" => Command::Promote(required(arg, "promote <n|id>")?),
            "demote" => Command::Demote(required(arg, "demote <n|id>")?),
            "clear" => Command::Clear(parse_partition(&required(arg, "clear <user|sub>")?)?),
            "clear-failed" => Command::ClearFailed(match arg {
                Some(n) => Some(n.parse().map_err(|_| format!("无效的阈值: {}", n))?),
                None => None,
            }),
            "stats" => Command::Stats,
            "status" | "show" => Command::Status,
            "env" => Command::Env,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("未知命令: {}", other)),
        };
        Ok(command)
    }
}

pub fn parse_partition(name: &str) -> Result<Provenance, String> {
    match name.to_ascii_lowercase().as_str() {
        "user" | "u" => Ok(Provenance::User),
        "sub" | "subscription" | "s" => Ok(Provenance::Subscription),
        other => Err(format!("未知分区: {}", other)),
    }
}

/// 按展示顺序排序
pub fn sorted(mut servers: Vec<ServerRecord>) -> Vec<ServerRecord> {
    servers.sort_by(compare_servers);
    servers
}

/// 按列表序号（从1开始）或ID查找服务器
pub fn resolve<'a>(target: &str, servers: &'a [ServerRecord]) -> Option<&'a ServerRecord> {
    if let Ok(index) = target.parse::<usize>() {
        if index >= 1 && index <= servers.len() {
            return servers.get(index - 1);
        }
    }
    servers.iter().find(|s| s.id == target)
}

fn colored_latency(ms: i64) -> ColoredString {
    match ms {
        i64::MIN..=-1 => "-".red(),
        0..=200 => format!("{}ms", ms).green(),
        201..=500 => format!("{}ms", ms).yellow(),
        _ => format!("{}ms", ms).red(),
    }
}

/// 单行展示一个服务器，`selected` 为当前选中的ID
pub fn format_server(index: usize, server: &ServerRecord, selected: Option<&str>) -> String {
    let marker = if selected == Some(server.id.as_str()) { "*".green().bold() } else { " ".normal() };
    let checked = server
        .conn_checked_at
        .map(|t| t.with_timezone(&Local).format("%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}{:3}. [{}] {:<8} {:<28} ping {:>7} conn {:>7} ({}) {}",
        marker,
        index.to_string().blue().bold(),
        server.provenance,
        server.scheme(),
        server.host.cyan(),
        colored_latency(server.latency_ms),
        colored_latency(server.conn_latency_ms),
        checked,
        server.name
    )
}

/// 列表末尾的统计行
pub fn summary(servers: &[ServerRecord]) -> String {
    let connectable = servers.iter().filter(|s| s.is_connectable()).count();
    format!("共 {} 个服务器, 可连通 {} 个", servers.len(), connectable)
}

/// 打印服务器列表
pub fn print_servers(servers: &[ServerRecord], selected: Option<&str>) {
    if servers.is_empty() {
        println!("{}", "没有服务器".yellow());
        return;
    }
    for (i, server) in servers.iter().enumerate() {
        println!("{}", format_server(i + 1, server, selected));
    }
    println!("{}", summary(servers).dimmed());
}
