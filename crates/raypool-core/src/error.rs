use std::io;

/// Error type for RayPool operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO操作错误
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// 无法解析的代理链接
    #[error("Invalid link: {0}")]
    InvalidLink(String),
    /// 服务器不存在
    #[error("Server not found: {0}")]
    NotFound(String),
    /// 重复的代理链接
    #[error("Duplicate server url: {0}")]
    Duplicate(String),
    /// 控制接口调用失败
    #[error("Control API `{action}` failed for [{tags}]: {message}")]
    ControlApi {
        action: &'static str,
        tags: String,
        message: String,
    },
    /// 端口已被占用
    #[error("Port {0} is already in use")]
    PortInUse(u16),
    /// 进程启动/退出错误
    #[error("Process `{name}` error: {message}")]
    Process { name: String, message: String },
    /// 进程已在运行
    #[error("Process `{0}` is already running")]
    AlreadyRunning(String),
    /// 进程未运行
    #[error("Process `{0}` is not running")]
    NotRunning(String),
    /// 超时错误
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),
    /// 请求错误
    #[error("Request failed: {0}")]
    Request(String),
    /// 本地网络不可用
    #[error("Local network is down: {0}")]
    NetworkDown(String),
    /// 定时任务已启动
    #[error("Task `{0}` is already scheduled")]
    AlreadyScheduled(String),
}

/// Result type for RayPool operations
pub type Result<T> = std::result::Result<T, Error>;

/// 从reqwest错误转换
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Request(err.to_string())
    }
}

/// 从toml错误转换
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// 从toml序列化错误转换
impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// 是否为端口冲突，端口分配时用于判断是否换下一个端口重试
    pub fn is_port_conflict(&self) -> bool {
        matches!(self, Error::PortInUse(_))
    }
}
