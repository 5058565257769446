//! RayPool Core - v2ray server pool manager (core functionality)
//!
//! 管理一组 v2ray 服务器：订阅导入、延迟/连通性测试，以及通过控制接口
//! 实时切换主实例使用的服务器。

// 导出模块
pub mod config;
pub mod connectivity;
pub mod control;
pub mod core_config;
pub mod error;
pub mod flight;
pub mod latency;
pub mod link;
pub mod ports;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod selection;
pub mod server;
pub mod subscription;

#[cfg(test)]
pub(crate) mod testing;

// 从模块导出核心类型
pub use config::{Config, Endpoint};
pub use connectivity::{ConnectivityChecker, ConnectivityReport, HttpProbe, ReqwestProbe};
pub use control::LiveApi;
pub use error::{Error, Result};
pub use latency::{LatencyProber, LatencyReport, Pinger, SystemPinger};
pub use process::{InstanceState, Orchestrator, ProxyCore};
pub use registry::Registry;
pub use scheduler::PeriodicTask;
pub use selection::SelectionController;
pub use server::{Provenance, ServerRecord};
pub use subscription::{RefreshReport, Subscriber};

/// 初始化日志，`RUST_LOG` 优先于配置中的级别
pub fn init_logger(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // 重复初始化（例如测试中）时忽略错误
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
