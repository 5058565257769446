use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core_config::Outbound;
use crate::error::Result;
use crate::link::ParsedLink;

/// 未知或不可达的延迟值
pub const UNKNOWN_LATENCY: i64 = -1;

/// 服务器来源分区
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// 用户手动添加
    User,
    /// 订阅导入
    Subscription,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::User => write!(f, "U"),
            Provenance::Subscription => write!(f, "S"),
        }
    }
}

/// 服务器记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// 唯一标识符，创建后不变
    pub id: String,
    /// 显示名称
    pub name: String,
    /// 用于ping的服务器地址
    pub host: String,
    /// 原始代理链接，去重依据
    pub url: String,
    /// 序列化后的出站配置（JSON）
    pub outbound: String,
    /// 来源分区
    pub provenance: Provenance,
    /// ping延迟（毫秒），-1表示未知/不可达
    #[serde(default = "unknown_latency")]
    pub latency_ms: i64,
    /// ping连续失败次数
    #[serde(default)]
    pub latency_failure_streak: u32,
    /// 最后ping时间
    #[serde(default)]
    pub latency_checked_at: Option<DateTime<Utc>>,
    /// 连通性延迟（毫秒），-1表示未知/不可达
    #[serde(default = "unknown_latency")]
    pub conn_latency_ms: i64,
    /// 连通性连续失败次数
    #[serde(default)]
    pub conn_failure_streak: u32,
    /// 最后连通性检查时间
    #[serde(default)]
    pub conn_checked_at: Option<DateTime<Utc>>,
}

fn unknown_latency() -> i64 { UNKNOWN_LATENCY }

/// 生成服务器ID：毫秒时间戳 + 随机部分
pub fn generate_server_id() -> String {
    format!("{}-{}", Utc::now().timestamp_millis(), Uuid::new_v4().simple())
}

impl ServerRecord {
    /// 从解析后的链接创建记录
    pub fn from_link(url: &str, link: ParsedLink, provenance: Provenance) -> Result<Self> {
        Ok(Self {
            id: generate_server_id(),
            name: link.name,
            host: link.host,
            url: url.to_string(),
            outbound: serde_json::to_string(&link.outbound)?,
            provenance,
            latency_ms: UNKNOWN_LATENCY,
            latency_failure_streak: 0,
            latency_checked_at: None,
            conn_latency_ms: UNKNOWN_LATENCY,
            conn_failure_streak: 0,
            conn_checked_at: None,
        })
    }

    /// 解析出站配置并打上指定标签
    pub fn outbound_with_tag(&self, tag: &str) -> Result<Outbound> {
        let mut outbound: Outbound = serde_json::from_str(&self.outbound)?;
        outbound.tag = tag.to_string();
        Ok(outbound)
    }

    /// 链接协议名（vmess/trojan/ss）
    pub fn scheme(&self) -> &str {
        self.url.split("://").next().unwrap_or_default()
    }

    /// 清空测试结果，重新作为新服务器处理
    pub fn reset_health(&mut self) {
        self.latency_ms = UNKNOWN_LATENCY;
        self.latency_failure_streak = 0;
        self.latency_checked_at = None;
        self.conn_latency_ms = UNKNOWN_LATENCY;
        self.conn_failure_streak = 0;
        self.conn_checked_at = None;
    }

    /// 记录一次ping结果
    pub fn record_latency(&mut self, latency_ms: Option<i64>) {
        match latency_ms {
            Some(ms) => {
                self.latency_ms = ms;
                self.latency_failure_streak = 0;
            }
            None => {
                self.latency_ms = UNKNOWN_LATENCY;
                self.latency_failure_streak += 1;
            }
        }
        self.latency_checked_at = Some(Utc::now());
    }

    /// 记录一次连通性检查结果
    pub fn record_connectivity(&mut self, latency_ms: Option<i64>) {
        match latency_ms {
            Some(ms) => {
                self.conn_latency_ms = ms;
                self.conn_failure_streak = 0;
            }
            None => {
                self.conn_latency_ms = UNKNOWN_LATENCY;
                self.conn_failure_streak += 1;
            }
        }
        self.conn_checked_at = Some(Utc::now());
    }

    pub fn is_connectable(&self) -> bool {
        self.conn_latency_ms >= 0
    }
}

/// 列表排序：连通性延迟优先，未知排最后；相同时再比较ping延迟
pub fn compare_servers(a: &ServerRecord, b: &ServerRecord) -> Ordering {
    fn known_first(a: i64, b: i64) -> Ordering {
        match (a < 0, b < 0) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => a.cmp(&b),
        }
    }
    known_first(a.conn_latency_ms, b.conn_latency_ms)
        .then_with(|| known_first(a.latency_ms, b.latency_ms))
}
