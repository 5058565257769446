//! 内核控制接口：通过 `<binary> api <cmd>` 子命令实时增删入站/出站

use async_trait::async_trait;

use crate::core_config::{Inbound, Outbound};
use crate::error::{Error, Result};

/// 运行中内核实例的实时配置接口
///
/// 探测引擎和选择控制器只依赖这个接口，不直接接触进程。
#[async_trait]
pub trait LiveApi: Send + Sync {
    /// 实例名（main/test）
    fn name(&self) -> &str;

    async fn add_outbound(&self, outbound: &Outbound) -> Result<()>;

    async fn remove_outbounds(&self, tags: &[String]) -> Result<()>;

    async fn add_inbound(&self, inbound: &Inbound) -> Result<()>;

    async fn remove_inbounds(&self, tags: &[String]) -> Result<()>;

    /// 运行时统计信息（原样返回）
    async fn stats(&self) -> Result<String>;

    /// 该标签的出站当前是否已推送到实例
    fn has_outbound(&self, tag: &str) -> bool;

    fn has_inbound(&self, tag: &str) -> bool;
}

/// 控制子命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    AddInbound,
    RemoveInbound,
    AddOutbound,
    RemoveOutbound,
    Stats,
}

impl ControlAction {
    pub fn command(&self) -> &'static str {
        match self {
            ControlAction::AddInbound => "adi",
            ControlAction::RemoveInbound => "rmi",
            ControlAction::AddOutbound => "ado",
            ControlAction::RemoveOutbound => "rmo",
            ControlAction::Stats => "stats",
        }
    }

    /// 构造子命令参数，`target` 为配置片段文件路径或标签列表
    pub fn args(&self, server: &str, target: &[String]) -> Vec<String> {
        let mut args = vec![
            "api".to_string(),
            self.command().to_string(),
            "-s".to_string(),
            server.to_string(),
        ];
        match self {
            ControlAction::AddInbound | ControlAction::AddOutbound => {
                args.extend(target.iter().cloned());
            }
            ControlAction::RemoveInbound | ControlAction::RemoveOutbound => {
                args.push("-tags".to_string());
                args.extend(target.iter().cloned());
            }
            ControlAction::Stats => args.push("-runtime".to_string()),
        }
        args
    }
}

/// 子命令执行结果
#[derive(Debug, Clone, Default)]
pub struct ControlOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ControlOutput {
    /// 非零退出码或stderr有输出都视为失败。
    /// 添加入站时若提示端口被占用，返回 [`Error::PortInUse`]。
    pub fn into_result(self, action: ControlAction, tags: &[String], port: Option<u16>) -> Result<String> {
        let stderr = self.stderr.trim();
        if self.success && stderr.is_empty() {
            return Ok(self.stdout);
        }
        let message = if stderr.is_empty() {
            format!("exit with failure, stdout: {}", self.stdout.trim())
        } else {
            stderr.to_string()
        };
        if let Some(port) = port {
            if is_address_in_use(&message) {
                return Err(Error::PortInUse(port));
            }
        }
        Err(Error::ControlApi {
            action: action.command(),
            tags: tags.join(","),
            message,
        })
    }
}

fn is_address_in_use(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("address already in use") || message.contains("only one usage of each socket address")
}
