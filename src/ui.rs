//! 终端输出
//!
//! 彩色提示和耗时操作的进度提示

use colored::*;
use std::future::Future;

const LOGO: &str = r#"
╦═╗╔═╗╦ ╦╔═╗╔═╗╔═╗╦  
╠╦╝╠═╣╚╦╝╠═╝║ ║║ ║║  
╩╚═╩ ╩ ╩ ╩  ╚═╝╚═╝╩═╝
"#;

/// 打印横幅
pub fn print_banner(version: &str) {
    println!("{}", LOGO.bright_cyan().bold());
    println!("{}", "A v2ray Server Pool with Live Switching".bright_black());
    println!("{} {}\n", "Version:".bright_black(), version.yellow());
}

/// 打印成功消息
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// 打印错误消息
pub fn print_error(msg: &str) {
    println!("{} {}", "✗".red().bold(), msg);
}

/// 打印警告消息
pub fn print_warning(msg: &str) {
    println!("{} {}", "!".yellow().bold(), msg);
}

/// 打印信息消息
pub fn print_info(msg: &str) {
    println!("{} {}", "i".blue().bold(), msg);
}

/// 等待耗时操作，期间显示转圈提示
#[cfg(feature = "ui")]
pub async fn track<F: Future>(message: &str, fut: F) -> F::Output {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed_precise}]") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    let output = fut.await;
    pb.finish_and_clear();
    output
}

#[cfg(not(feature = "ui"))]
pub async fn track<F: Future>(message: &str, fut: F) -> F::Output {
    print_info(message);
    fut.await
}
