//! 代理内核（v2ray）配置模型
//!
//! 只对本程序需要注入/替换的部分建模，传输层设置以原始JSON保存。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::InstanceSettings;

/// 控制接口入站/路由标签
pub const API_TAG: &str = "api";
/// 用户HTTP入站
pub const USER_HTTP_TAG: &str = "user-http";
/// 用户SOCKS入站
pub const USER_SOCKS_TAG: &str = "user-socks";
/// 当前选中服务器的出站
pub const ACTIVE_OUTBOUND_TAG: &str = "remote";
/// 默认出站，未匹配的流量直接丢弃
pub const BLOCK_OUTBOUND_TAG: &str = "block";
/// 探测槽位标签前缀
pub const PROBE_TAG_PREFIX: &str = "test-";

/// 第 `slot` 个探测槽位的标签
pub fn probe_tag(slot: usize) -> String {
    format!("{}{}", PROBE_TAG_PREFIX, slot)
}

pub fn is_probe_tag(tag: &str) -> bool {
    tag.strip_prefix(PROBE_TAG_PREFIX)
        .map(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// 完整的内核配置文件，同时也用作控制接口的配置片段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogSection>,
    #[serde(default)]
    pub inbounds: Vec<Inbound>,
    #[serde(default)]
    pub outbounds: Vec<Outbound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Routing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default)]
    pub access: String,
    #[serde(default)]
    pub error: String,
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSection {
    pub tag: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(rename = "inboundTag")]
    pub inbound_tag: Vec<String>,
    #[serde(rename = "outboundTag")]
    pub outbound_tag: String,
}

impl RoutingRule {
    pub fn field(inbound_tags: &[&str], outbound_tag: &str) -> Self {
        Self {
            rule_type: "field".to_string(),
            inbound_tag: inbound_tags.iter().map(|t| t.to_string()).collect(),
            outbound_tag: outbound_tag.to_string(),
        }
    }
}

/// 入站定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    #[serde(flatten)]
    pub protocol: InboundProtocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "kebab-case")]
pub enum InboundProtocol {
    DokodemoDoor { settings: DokodemoSettings },
    Http {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<Value>,
    },
    Socks { settings: SocksSettings },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DokodemoSettings {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocksSettings {
    #[serde(default)]
    pub udp: bool,
}

impl Inbound {
    /// 本地HTTP代理入口
    pub fn http(tag: &str, listen: &str, port: u16) -> Self {
        Self {
            tag: tag.to_string(),
            listen: listen.to_string(),
            port,
            protocol: InboundProtocol::Http { settings: None },
        }
    }

    pub fn socks(tag: &str, listen: &str, port: u16) -> Self {
        Self {
            tag: tag.to_string(),
            listen: listen.to_string(),
            port,
            protocol: InboundProtocol::Socks { settings: SocksSettings { udp: true } },
        }
    }

    /// 控制接口入口
    pub fn api(listen: &str, port: u16) -> Self {
        Self {
            tag: API_TAG.to_string(),
            listen: listen.to_string(),
            port,
            protocol: InboundProtocol::DokodemoDoor {
                settings: DokodemoSettings { address: listen.to_string() },
            },
        }
    }
}

/// 出站定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    #[serde(default)]
    pub tag: String,
    #[serde(flatten)]
    pub protocol: OutboundProtocol,
    /// 传输层设置，本程序不解释其内容
    #[serde(rename = "streamSettings", default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum OutboundProtocol {
    Vmess { settings: VmessSettings },
    Trojan { settings: ServerList<TrojanServer> },
    Shadowsocks { settings: ServerList<ShadowsocksServer> },
    Freedom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<Value>,
    },
    Blackhole {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmessSettings {
    pub vnext: Vec<VmessServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmessServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<VmessUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmessUser {
    pub id: String,
    #[serde(rename = "alterId", default)]
    pub alter_id: u32,
    #[serde(default = "default_security")]
    pub security: String,
}

fn default_security() -> String { "auto".to_string() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerList<T> {
    pub servers: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrojanServer {
    pub address: String,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowsocksServer {
    pub address: String,
    pub port: u16,
    pub method: String,
    pub password: String,
}

impl Outbound {
    pub fn blackhole(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            protocol: OutboundProtocol::Blackhole { settings: None },
            stream_settings: None,
        }
    }

    /// 远端服务器地址
    pub fn server_address(&self) -> Option<&str> {
        match &self.protocol {
            OutboundProtocol::Vmess { settings } => settings.vnext.first().map(|s| s.address.as_str()),
            OutboundProtocol::Trojan { settings } => settings.servers.first().map(|s| s.address.as_str()),
            OutboundProtocol::Shadowsocks { settings } => settings.servers.first().map(|s| s.address.as_str()),
            OutboundProtocol::Freedom { .. } | OutboundProtocol::Blackhole { .. } => None,
        }
    }
}

impl CoreConfig {
    /// 只包含一个入站的控制接口片段
    pub fn inbound_fragment(inbound: Inbound) -> Self {
        Self { inbounds: vec![inbound], ..Self::default() }
    }

    /// 只包含一个出站的控制接口片段
    pub fn outbound_fragment(outbound: Outbound) -> Self {
        Self { outbounds: vec![outbound], ..Self::default() }
    }

    /// 生成实例启动配置
    ///
    /// 路由规则在启动时一次性写好：用户入站指向 `remote`，每个探测槽位
    /// `test-{i}` 入站指向同名出站。之后只通过控制接口增删入站/出站定义，
    /// 规则引用的标签即使暂时没有对应出站也保留。
    pub fn bootstrap(
        instance: &InstanceSettings,
        loglevel: &str,
        probe_slots: usize,
        initial_outbounds: Vec<Outbound>,
    ) -> Self {
        let mut inbounds = vec![Inbound::api(&instance.api.host, instance.api.port)];
        let mut user_tags = Vec::new();
        if let Some(http) = &instance.http {
            inbounds.push(Inbound::http(USER_HTTP_TAG, &http.host, http.port));
            user_tags.push(USER_HTTP_TAG);
        }
        if let Some(socks) = &instance.socks {
            inbounds.push(Inbound::socks(USER_SOCKS_TAG, &socks.host, socks.port));
            user_tags.push(USER_SOCKS_TAG);
        }

        // 第一个出站是默认出站
        let mut outbounds = vec![Outbound::blackhole(BLOCK_OUTBOUND_TAG)];
        outbounds.extend(initial_outbounds);

        let mut rules = vec![RoutingRule::field(&[API_TAG], API_TAG)];
        if !user_tags.is_empty() {
            rules.push(RoutingRule::field(&user_tags, ACTIVE_OUTBOUND_TAG));
        }
        for slot in 0..probe_slots {
            let tag = probe_tag(slot);
            rules.push(RoutingRule::field(&[tag.as_str()], &tag));
        }

        Self {
            log: Some(LogSection {
                access: String::new(),
                error: String::new(),
                loglevel: loglevel.to_string(),
            }),
            inbounds,
            outbounds,
            api: Some(ApiSection {
                tag: API_TAG.to_string(),
                services: vec![
                    "HandlerService".to_string(),
                    "LoggerService".to_string(),
                    "StatsService".to_string(),
                ],
            }),
            routing: Some(Routing { rules }),
        }
    }
}
