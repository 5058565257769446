use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{Error, Result};
use tracing::{info, warn};

/// 主配置结构体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 数据目录（状态文件、内核配置文件）
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 代理内核可执行文件
    #[serde(default = "default_core_binary")]
    pub core_binary: PathBuf,
    /// 内核日志级别（写入内核配置）
    #[serde(default = "default_core_log_level")]
    pub core_log_level: String,
    /// 控制接口调用超时（秒）
    #[serde(default = "default_control_timeout")]
    pub control_timeout_secs: u64,
    /// 主实例
    #[serde(default = "InstanceSettings::main")]
    pub main: InstanceSettings,
    /// 测试实例
    #[serde(default = "InstanceSettings::test")]
    pub test: InstanceSettings,
    /// 订阅设置
    #[serde(default)]
    pub subscription: SubscriptionSettings,
    /// 延迟测试设置
    #[serde(default)]
    pub latency: LatencySettings,
    /// 连通性测试设置
    #[serde(default)]
    pub connectivity: ConnectivitySettings,
}

fn default_data_dir() -> PathBuf { PathBuf::from(".raypool") }
fn default_log_level() -> String { "info".to_string() }
fn default_core_binary() -> PathBuf { PathBuf::from("v2ray") }
fn default_core_log_level() -> String { "warning".to_string() }
fn default_control_timeout() -> u64 { 10 }

/// 监听地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self { host: host.to_string(), port }
    }

    /// `host:port` 形式
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 单个内核实例的监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSettings {
    /// 用户HTTP入口，测试实例可不设置
    #[serde(default)]
    pub http: Option<Endpoint>,
    /// 用户SOCKS入口
    #[serde(default)]
    pub socks: Option<Endpoint>,
    /// 控制接口
    pub api: Endpoint,
}

impl InstanceSettings {
    pub fn main() -> Self {
        Self {
            http: Some(Endpoint::new("127.0.0.1", 1080)),
            socks: Some(Endpoint::new("127.0.0.1", 1090)),
            api: Endpoint::new("127.0.0.1", 1100),
        }
    }

    pub fn test() -> Self {
        Self {
            http: None,
            socks: None,
            api: Endpoint::new("127.0.0.1", 2100),
        }
    }
}

/// 订阅设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// 订阅地址
    #[serde(default)]
    pub urls: Vec<String>,
    /// 更新间隔（秒）
    #[serde(default = "default_subscription_interval")]
    pub interval: u64,
    /// 单个订阅下载超时（秒）
    #[serde(default = "default_subscription_timeout")]
    pub timeout: u64,
}

fn default_subscription_interval() -> u64 { 6 * 3600 }
fn default_subscription_timeout() -> u64 { 30 }

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            interval: default_subscription_interval(),
            timeout: default_subscription_timeout(),
        }
    }
}

/// 延迟（ping）测试设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySettings {
    /// 测试间隔（秒）
    #[serde(default = "default_latency_interval")]
    pub interval: u64,
    /// 单次ping超时（秒）
    #[serde(default = "default_latency_timeout")]
    pub timeout: u64,
    /// 连续失败次数达到该值且连通性也失败时移除
    #[serde(default = "default_latency_evict_threshold")]
    pub evict_threshold: u32,
}

fn default_latency_interval() -> u64 { 600 }
fn default_latency_timeout() -> u64 { 10 }
fn default_latency_evict_threshold() -> u32 { 5 }

impl Default for LatencySettings {
    fn default() -> Self {
        Self {
            interval: default_latency_interval(),
            timeout: default_latency_timeout(),
            evict_threshold: default_latency_evict_threshold(),
        }
    }
}

/// 连通性测试设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivitySettings {
    /// 测试间隔（秒）
    #[serde(default = "default_conn_interval")]
    pub interval: u64,
    /// 单个请求超时（秒）
    #[serde(default = "default_conn_timeout")]
    pub timeout: u64,
    /// 测试URL
    #[serde(default = "default_test_url")]
    pub test_url: String,
    /// 是否先直连检查本地网络
    #[serde(default = "default_true")]
    pub precheck: bool,
    /// 直连检查URL
    #[serde(default = "default_precheck_url")]
    pub precheck_url: String,
    /// 同时测试的服务器数量
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// 本地测试端口起始值
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// 端口冲突时最多尝试的端口数
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u32,
    /// 是否自动移除连续失败的服务器
    #[serde(default)]
    pub auto_evict: bool,
    /// 连续失败次数超过该值时视为失效
    #[serde(default = "default_conn_evict_threshold")]
    pub evict_threshold: u32,
}

fn default_conn_interval() -> u64 { 300 }
fn default_conn_timeout() -> u64 { 10 }
fn default_test_url() -> String { "https://www.google.com/generate_204".to_string() }
fn default_true() -> bool { true }
fn default_precheck_url() -> String { "http://www.baidu.com".to_string() }
fn default_workers() -> usize { 10 }
fn default_base_port() -> u16 { 20800 }
fn default_port_attempts() -> u32 { 100 }
fn default_conn_evict_threshold() -> u32 { 3 }

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            interval: default_conn_interval(),
            timeout: default_conn_timeout(),
            test_url: default_test_url(),
            precheck: true,
            precheck_url: default_precheck_url(),
            workers: default_workers(),
            base_port: default_base_port(),
            port_attempts: default_port_attempts(),
            auto_evict: false,
            evict_threshold: default_conn_evict_threshold(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            core_binary: default_core_binary(),
            core_log_level: default_core_log_level(),
            control_timeout_secs: default_control_timeout(),
            main: InstanceSettings::main(),
            test: InstanceSettings::test(),
            subscription: SubscriptionSettings::default(),
            latency: LatencySettings::default(),
            connectivity: ConnectivitySettings::default(),
        }
    }
}

impl Config {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("无法读取配置文件: {}", e);
                return Err(Error::Configuration(format!("无法读取配置文件: {}", e)));
            }
        };

        let config = toml::from_str::<Self>(&content)?;
        config.validate()?;
        info!("成功读取配置: {} 个订阅", config.subscription.urls.len());
        Ok(config)
    }

    /// 加载配置，文件不存在时写入默认配置
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::from_file(path);
        }
        let config = Self::default();
        config.save_to_file(&path)?;
        info!("默认配置已保存到 {}", path.as_ref().display());
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 检查互相冲突的配置项
    pub fn validate(&self) -> Result<()> {
        if self.connectivity.workers == 0 {
            return Err(Error::Configuration("connectivity.workers 必须大于0".to_string()));
        }
        if self.connectivity.port_attempts == 0 {
            return Err(Error::Configuration("connectivity.port_attempts 必须大于0".to_string()));
        }
        if self.main.api == self.test.api {
            return Err(Error::Configuration(format!(
                "主实例与测试实例的控制接口地址相同: {}",
                self.main.api.addr()
            )));
        }
        Ok(())
    }

    /// 注册表状态文件
    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    /// 内核实例配置文件
    pub fn core_config_file(&self, instance: &str) -> PathBuf {
        self.data_dir.join(format!("v2ray.{}.json", instance))
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    /// 主实例对外代理对应的环境变量
    pub fn proxy_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = Vec::new();
        if let Some(http) = &self.main.http {
            let url = format!("http://{}", http.addr());
            vars.push(("http_proxy", url.clone()));
            vars.push(("https_proxy", url));
        }
        if let Some(socks) = &self.main.socks {
            vars.push(("ALL_PROXY", format!("socks5://{}", socks.addr())));
        }
        vars
    }

    /// 可直接粘贴到 shell 的 export 语句
    pub fn proxy_env_line(&self) -> String {
        let vars: Vec<_> = self.proxy_env().iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        if vars.is_empty() {
            String::new()
        } else {
            format!("export {}", vars.join(" "))
        }
    }
}
