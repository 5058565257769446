//! 切换主实例使用的服务器

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::control::LiveApi;
use crate::core_config::{Outbound, ACTIVE_OUTBOUND_TAG};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::server::ServerRecord;

/// 上次选中的服务器出站，启动主实例时直接写进配置
pub async fn restored_outbound(registry: &Registry) -> Option<Outbound> {
    let server = registry.selected_server().await?;
    match server.outbound_with_tag(ACTIVE_OUTBOUND_TAG) {
        Ok(outbound) => {
            info!("恢复选中的服务器 [{}] {}", server.name, server.host);
            Some(outbound)
        }
        Err(e) => {
            warn!("无法恢复选中的服务器 [{}]: {}", server.name, e);
            None
        }
    }
}

/// 选择控制器：维护主实例上的 `remote` 出站
pub struct SelectionController {
    registry: Registry,
    core: Arc<dyn LiveApi>,
    switching: Mutex<()>,
}

impl SelectionController {
    pub fn new(registry: Registry, core: Arc<dyn LiveApi>) -> Self {
        Self { registry, core, switching: Mutex::new(()) }
    }

    /// 切换到指定服务器。
    ///
    /// 先撤掉旧的 `remote` 再推送新的；推送失败时尝试把旧出站恢复回去，
    /// 已保存的选择不变。
    pub async fn select(&self, id: &str) -> Result<ServerRecord> {
        let _switching = self.switching.lock().await;

        let server = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let outbound = server.outbound_with_tag(ACTIVE_OUTBOUND_TAG)?;

        let previous = if self.core.has_outbound(ACTIVE_OUTBOUND_TAG) {
            let previous = self
                .registry
                .selected_server()
                .await
                .and_then(|s| s.outbound_with_tag(ACTIVE_OUTBOUND_TAG).ok());
            self.core.remove_outbounds(&[ACTIVE_OUTBOUND_TAG.to_string()]).await?;
            previous
        } else {
            None
        };

        if let Err(e) = self.core.add_outbound(&outbound).await {
            warn!("切换到 [{}] 失败: {}", server.name, e);
            if let Some(previous) = previous {
                match self.core.add_outbound(&previous).await {
                    Ok(()) => info!("已恢复之前的服务器"),
                    Err(restore) => error!("恢复之前的服务器失败: {}", restore),
                }
            }
            return Err(e);
        }

        self.registry.set_selected(&server.id).await?;
        info!("已切换到 [{}] {}", server.name, server.host);
        Ok(server)
    }

    /// 当前选中的服务器
    pub async fn current(&self) -> Option<ServerRecord> {
        self.registry.selected_server().await
    }

    /// 运行状态描述
    pub async fn running_status(&self) -> String {
        match self.current().await {
            Some(server) if self.core.has_outbound(ACTIVE_OUTBOUND_TAG) => format!(
                "运行中: [{}] {} ({}) 延迟 {}ms 连通 {}ms",
                server.name,
                server.host,
                server.scheme(),
                server.latency_ms,
                server.conn_latency_ms
            ),
            Some(server) => format!("已选择 [{}]，但主实例上没有可用出站", server.name),
            None => "未选择服务器".to_string(),
        }
    }
}
