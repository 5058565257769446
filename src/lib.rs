//! RayPool - A v2ray server pool manager with latency and connectivity testing
//!
//! This library wires the core components into the `raypool` daemon.

// 重导出core库
pub use raypool_core::{
    init_logger, Config, ConnectivityChecker, Error, LatencyProber, Orchestrator, Provenance,
    Registry, Result, SelectionController, ServerRecord, Subscriber,
};
pub use raypool_cli::Command;

// 本地模块
pub mod app;
pub mod ui;

pub use app::App;
