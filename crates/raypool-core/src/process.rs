//! 代理内核进程管理
//!
//! 每个 [`ProxyCore`] 独占一个内核进程：写启动配置、拉起进程、转发输出、
//! 记录退出码，并通过控制子命令实时增删入站/出站。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Endpoint};
use crate::control::{ControlAction, ControlOutput, LiveApi};
use crate::core_config::{CoreConfig, Inbound, Outbound};
use crate::error::{Error, Result};

/// 进程启动后的观察期，期间退出视为启动失败
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// 实例状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
}

/// 进程退出记录
#[derive(Debug, Clone, PartialEq)]
pub struct ExitReport {
    /// 退出码，被信号终止时为 `None`
    pub code: Option<i32>,
    /// 是否由 `stop()` 主动终止
    pub requested: bool,
    pub at: DateTime<Utc>,
}

impl ExitReport {
    /// 非主动停止且退出码非零
    pub fn is_failure(&self) -> bool {
        !self.requested && self.code != Some(0)
    }
}

/// 实例生命周期快照
#[derive(Debug, Clone, PartialEq)]
pub struct Lifecycle {
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub last_exit: Option<ExitReport>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self { state: InstanceState::Stopped, pid: None, last_exit: None }
    }
}

impl Lifecycle {
    /// 状态描述，上次异常退出时附带退出码和时间
    pub fn describe(&self) -> String {
        let state = match (self.state, self.pid) {
            (InstanceState::Running, Some(pid)) => format!("运行中 (pid {})", pid),
            (InstanceState::Running, None) => "运行中".to_string(),
            (InstanceState::Starting, _) => "启动中".to_string(),
            (InstanceState::Stopped, _) => "已停止".to_string(),
        };
        match &self.last_exit {
            Some(exit) if exit.is_failure() => {
                let code = exit.code.map_or_else(|| "被信号终止".to_string(), |c| format!("退出码 {}", c));
                format!("{}, 上次异常退出: {} @ {}", state, code, exit.at.format("%Y-%m-%d %H:%M:%S"))
            }
            _ => state,
        }
    }
}

type KillReply = oneshot::Sender<io::Result<()>>;

#[derive(Debug, Default)]
struct LiveTags {
    inbounds: HashSet<String>,
    outbounds: HashSet<String>,
}

/// 一个受管的内核实例
pub struct ProxyCore {
    name: String,
    binary: PathBuf,
    config_file: PathBuf,
    api_addr: String,
    control_timeout: Duration,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
    killer: Mutex<Option<mpsc::Sender<KillReply>>>,
    live: Arc<Mutex<LiveTags>>,
}

impl ProxyCore {
    pub fn new(name: &str, binary: &Path, config_file: &Path, api: &Endpoint, control_timeout: Duration) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::default());
        Self {
            name: name.to_string(),
            binary: binary.to_path_buf(),
            config_file: config_file.to_path_buf(),
            api_addr: api.addr(),
            control_timeout,
            lifecycle: Arc::new(lifecycle),
            killer: Mutex::new(None),
            live: Arc::new(Mutex::new(LiveTags::default())),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.borrow().clone()
    }

    pub fn state(&self) -> InstanceState {
        self.lifecycle.borrow().state
    }

    /// 已推送的入站/出站标签
    pub fn live_tags(&self) -> (Vec<String>, Vec<String>) {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        let mut inbounds: Vec<_> = live.inbounds.iter().cloned().collect();
        let mut outbounds: Vec<_> = live.outbounds.iter().cloned().collect();
        inbounds.sort();
        outbounds.sort();
        (inbounds, outbounds)
    }

    fn process_error(&self, message: String) -> Error {
        Error::Process { name: self.name.clone(), message }
    }

    /// 写入启动配置并拉起进程
    pub async fn start(&self, config: &CoreConfig) -> Result<()> {
        let mut claimed = false;
        self.lifecycle.send_if_modified(|l| {
            if l.state == InstanceState::Stopped {
                l.state = InstanceState::Starting;
                claimed = true;
            }
            claimed
        });
        if !claimed {
            warn!(instance = %self.name, "内核已在运行");
            return Err(Error::AlreadyRunning(self.name.clone()));
        }

        match self.spawn(config).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.lifecycle.send_if_modified(|l| {
                    let starting = l.state == InstanceState::Starting;
                    if starting {
                        l.state = InstanceState::Stopped;
                        l.pid = None;
                    }
                    starting
                });
                error!(instance = %self.name, "内核启动失败: {}", e);
                Err(e)
            }
        }
    }

    async fn spawn(&self, config: &CoreConfig) -> Result<()> {
        if let Some(dir) = self.config_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.config_file, serde_json::to_vec_pretty(config)?).await?;
        info!(instance = %self.name, "启动内核: {} run -c {}", self.binary.display(), self.config_file.display());

        let mut child = Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(&self.config_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.process_error(format!("无法启动 {}: {}", self.binary.display(), e)))?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_output(self.name.clone(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(self.name.clone(), stderr, true);
        }

        {
            let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
            live.inbounds = config.inbounds.iter().map(|i| i.tag.clone()).collect();
            live.outbounds = config.outbounds.iter().map(|o| o.tag.clone()).collect();
        }

        let (kill_tx, mut kill_rx) = mpsc::channel::<KillReply>(1);
        *self.killer.lock().unwrap_or_else(|e| e.into_inner()) = Some(kill_tx);

        let name = self.name.clone();
        let lifecycle = Arc::clone(&self.lifecycle);
        let live = Arc::clone(&self.live);
        tokio::spawn(async move {
            let mut requested = false;
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(reply) = kill_rx.recv() => {
                        let result = child.start_kill();
                        requested |= result.is_ok();
                        let _ = reply.send(result);
                    }
                }
            };

            let code = match &status {
                Ok(status) => status.code(),
                Err(e) => {
                    error!(instance = %name, "等待内核进程失败: {}", e);
                    None
                }
            };
            let report = ExitReport { code, requested, at: Utc::now() };
            if report.is_failure() {
                error!(instance = %name, "内核异常退出, 退出码: {:?}", code);
            } else {
                info!(instance = %name, "内核已退出, 退出码: {:?}", code);
            }

            {
                let mut live = live.lock().unwrap_or_else(|e| e.into_inner());
                live.inbounds.clear();
                live.outbounds.clear();
            }
            lifecycle.send_modify(|l| {
                l.state = InstanceState::Stopped;
                l.pid = None;
                l.last_exit = Some(report);
            });
        });

        // 启动后立即退出通常是配置错误或端口冲突
        let mut rx = self.lifecycle.subscribe();
        let exited = matches!(
            timeout(STARTUP_GRACE, rx.wait_for(|l| l.state == InstanceState::Stopped)).await,
            Ok(Ok(_))
        );
        if exited {
            let code = self.lifecycle.borrow().last_exit.as_ref().and_then(|r| r.code);
            return Err(self.process_error(format!("启动后立即退出, 退出码: {:?}", code)));
        }

        let promoted = self.lifecycle.send_if_modified(|l| {
            let starting = l.state == InstanceState::Starting;
            if starting {
                l.state = InstanceState::Running;
                l.pid = pid;
            }
            starting
        });
        if !promoted {
            return Err(self.process_error("启动过程中进程退出".to_string()));
        }
        info!(instance = %self.name, "内核已启动, pid: {:?}", pid);
        Ok(())
    }

    /// 强制终止进程并等待其退出；未运行时直接返回
    pub async fn stop(&self) -> Result<()> {
        let killer = self.killer.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(killer) = killer else {
            return Ok(());
        };
        let mut rx = self.lifecycle.subscribe();
        if rx.borrow().state == InstanceState::Stopped {
            return Ok(());
        }

        info!(instance = %self.name, "停止内核");
        let (reply_tx, reply_rx) = oneshot::channel();
        if killer.send(reply_tx).await.is_err() {
            // 进程已自行退出
            return Ok(());
        }
        match reply_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.process_error(format!("无法终止进程: {}", e))),
            Err(_) => return Ok(()),
        }

        let exited = timeout(self.control_timeout, rx.wait_for(|l| l.state == InstanceState::Stopped))
            .await
            .is_ok();
        if !exited {
            return Err(self.process_error("已发送终止信号但进程未退出".to_string()));
        }
        *self.killer.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state() == InstanceState::Running {
            Ok(())
        } else {
            Err(Error::NotRunning(self.name.clone()))
        }
    }

    /// 执行一次控制子命令
    async fn exec(
        &self,
        action: ControlAction,
        target: &[String],
        tags: &[String],
        port: Option<u16>,
    ) -> Result<String> {
        self.ensure_running()?;
        let args = action.args(&self.api_addr, target);
        debug!(instance = %self.name, "控制命令: {} {}", self.binary.display(), args.join(" "));

        let output = timeout(
            self.control_timeout,
            Command::new(&self.binary)
                .args(&args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.control_timeout.as_millis() as u64))?
        .map_err(|e| self.process_error(format!("无法执行控制命令: {}", e)))?;

        let output = ControlOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !output.stdout.trim().is_empty() {
            debug!(instance = %self.name, "{}", output.stdout.trim());
        }
        if !output.stderr.trim().is_empty() {
            warn!(instance = %self.name, "{}", output.stderr.trim());
        }
        output.into_result(action, tags, port)
    }

    /// 把配置片段写到独立的临时文件，并发调用互不覆盖
    fn write_fragment(&self, fragment: &CoreConfig) -> Result<tempfile::NamedTempFile> {
        let dir = self
            .config_file
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-fragment-", self.name))
            .suffix(".json")
            .tempfile_in(dir)?;
        file.write_all(&serde_json::to_vec(fragment)?)?;
        file.flush()?;
        Ok(file)
    }

    async fn exec_fragment(
        &self,
        action: ControlAction,
        fragment: &CoreConfig,
        tag: &str,
        port: Option<u16>,
    ) -> Result<()> {
        self.ensure_running()?;
        let file = self.write_fragment(fragment)?;
        let target = vec![file.path().to_string_lossy().into_owned()];
        self.exec(action, &target, &[tag.to_string()], port).await?;
        Ok(())
    }
}

#[async_trait]
impl LiveApi for ProxyCore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add_outbound(&self, outbound: &Outbound) -> Result<()> {
        let fragment = CoreConfig::outbound_fragment(outbound.clone());
        self.exec_fragment(ControlAction::AddOutbound, &fragment, &outbound.tag, None).await?;
        self.live.lock().unwrap_or_else(|e| e.into_inner()).outbounds.insert(outbound.tag.clone());
        Ok(())
    }

    async fn remove_outbounds(&self, tags: &[String]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        self.exec(ControlAction::RemoveOutbound, tags, tags, None).await?;
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        for tag in tags {
            live.outbounds.remove(tag);
        }
        Ok(())
    }

    async fn add_inbound(&self, inbound: &Inbound) -> Result<()> {
        let fragment = CoreConfig::inbound_fragment(inbound.clone());
        self.exec_fragment(ControlAction::AddInbound, &fragment, &inbound.tag, Some(inbound.port)).await?;
        self.live.lock().unwrap_or_else(|e| e.into_inner()).inbounds.insert(inbound.tag.clone());
        Ok(())
    }

    async fn remove_inbounds(&self, tags: &[String]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        self.exec(ControlAction::RemoveInbound, tags, tags, None).await?;
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        for tag in tags {
            live.inbounds.remove(tag);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<String> {
        self.exec(ControlAction::Stats, &[], &[], None).await
    }

    fn has_outbound(&self, tag: &str) -> bool {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).outbounds.contains(tag)
    }

    fn has_inbound(&self, tag: &str) -> bool {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).inbounds.contains(tag)
    }
}

/// 按行转发内核输出到日志
fn forward_output<R>(name: String, reader: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if is_stderr {
                warn!(instance = %name, "{}", line);
            } else {
                info!(instance = %name, "{}", line);
            }
        }
    });
}

/// 主实例和测试实例
pub struct Orchestrator {
    pub main: Arc<ProxyCore>,
    pub test: Arc<ProxyCore>,
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn from_config(config: Arc<Config>) -> Self {
        let timeout = config.control_timeout();
        let main = ProxyCore::new(
            "main",
            &config.core_binary,
            &config.core_config_file("main"),
            &config.main.api,
            timeout,
        );
        let test = ProxyCore::new(
            "test",
            &config.core_binary,
            &config.core_config_file("test"),
            &config.test.api,
            timeout,
        );
        Self { main: Arc::new(main), test: Arc::new(test), config }
    }

    /// 启动两个实例。`active` 为恢复的选中服务器出站（已打 `remote` 标签）。
    pub async fn start(&self, active: Option<Outbound>) -> Result<()> {
        let slots = self.config.connectivity.workers;
        let loglevel = &self.config.core_log_level;
        let main_cfg = CoreConfig::bootstrap(&self.config.main, loglevel, 0, active.into_iter().collect());
        self.main.start(&main_cfg).await?;

        let test_cfg = CoreConfig::bootstrap(&self.config.test, loglevel, slots, Vec::new());
        if let Err(e) = self.test.start(&test_cfg).await {
            if let Err(stop_err) = self.main.stop().await {
                error!("停止主实例失败: {}", stop_err);
            }
            return Err(e);
        }
        Ok(())
    }

    /// 停止两个实例，两个都尝试后再返回第一个错误
    pub async fn shutdown(&self) -> Result<()> {
        let (main, test) = tokio::join!(self.main.stop(), self.test.stop());
        if let Err(e) = &main {
            error!("停止主实例失败: {}", e);
        }
        if let Err(e) = &test {
            error!("停止测试实例失败: {}", e);
        }
        main.and(test)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(binary: &str) -> ProxyCore {
        let dir = std::env::temp_dir().join("raypool-process-unit");
        ProxyCore::new(
            "unit",
            Path::new(binary),
            &dir.join("v2ray.unit.json"),
            &Endpoint::new("127.0.0.1", 65000),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn live_calls_require_running_instance() {
        let core = core("/nonexistent/v2ray");
        let err = core.remove_outbounds(&["remote".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::NotRunning(_)));
        assert!(!core.has_outbound("remote"));
    }

    #[tokio::test]
    async fn spawn_failure_returns_to_stopped() {
        let core = core("/nonexistent/v2ray");
        let err = core.start(&CoreConfig::default()).await.unwrap_err();
        assert!(matches!(err, Error::Process { .. }));
        assert_eq!(core.state(), InstanceState::Stopped);
        // 未运行时停止是空操作
        core.stop().await.unwrap();
    }

    #[test]
    fn requested_exit_is_not_a_failure() {
        let killed = ExitReport { code: None, requested: true, at: Utc::now() };
        let crashed = ExitReport { code: Some(23), requested: false, at: Utc::now() };
        assert!(!killed.is_failure());
        assert!(crashed.is_failure());
    }

    #[test]
    fn describes_abnormal_exit() {
        let running = Lifecycle { state: InstanceState::Running, pid: Some(42), last_exit: None };
        assert_eq!(running.describe(), "运行中 (pid 42)");

        let crashed = Lifecycle {
            state: InstanceState::Stopped,
            pid: None,
            last_exit: Some(ExitReport { code: Some(23), requested: false, at: Utc::now() }),
        };
        assert!(crashed.describe().starts_with("已停止, 上次异常退出: 退出码 23 @ "));

        let stopped = Lifecycle {
            last_exit: Some(ExitReport { code: None, requested: true, at: Utc::now() }),
            ..Lifecycle::default()
        };
        assert_eq!(stopped.describe(), "已停止");
    }
}
