//! 订阅更新

use futures::future::join_all;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SubscriptionSettings;
use crate::error::{Error, Result};
use crate::flight::SingleFlight;
use crate::link::{decode_base64, parse_link};
use crate::registry::Registry;
use crate::server::{Provenance, ServerRecord};

/// 一次订阅更新的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub feeds: usize,
    pub failed_feeds: usize,
    pub added: usize,
    pub skipped_lines: usize,
}

/// 解码后的订阅内容
#[derive(Debug, Default)]
pub struct DecodedFeed {
    pub servers: Vec<ServerRecord>,
    pub skipped: usize,
}

/// 解码订阅正文：整体 base64 编码、每行一个链接。
/// 正文本身就是明文链接列表时也接受。
pub fn decode_feed(body: &str) -> Result<DecodedFeed> {
    let text = match decode_base64(body) {
        Ok(bytes) => String::from_utf8(bytes).map_err(|e| Error::Serialization(e.to_string()))?,
        Err(_) if body.contains("://") => body.to_string(),
        Err(e) => return Err(e),
    };

    let mut feed = DecodedFeed::default();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match parse_link(line).and_then(|link| ServerRecord::from_link(line, link, Provenance::Subscription)) {
            Ok(server) => feed.servers.push(server),
            Err(e) => {
                debug!("跳过无法解析的链接: {}", e);
                feed.skipped += 1;
            }
        }
    }
    Ok(feed)
}

/// 订阅下载与合并
pub struct Subscriber {
    registry: Registry,
    client: reqwest::Client,
    urls: Vec<String>,
    flight: SingleFlight,
}

impl Subscriber {
    pub fn new(registry: Registry, settings: &SubscriptionSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout))
            .build()?;
        Ok(Self { registry, client, urls: settings.urls.clone(), flight: SingleFlight::new() })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    /// 更新配置中的所有订阅
    pub async fn refresh(&self) -> Result<Option<RefreshReport>> {
        self.refresh_urls(&self.urls).await
    }

    /// 并发下载给定订阅并合并。单个订阅失败只记日志，不影响其他订阅。
    /// 已有一次更新在进行时直接返回 `None`。
    pub async fn refresh_urls(&self, urls: &[String]) -> Result<Option<RefreshReport>> {
        let Some(_guard) = self.flight.try_acquire() else {
            warn!("订阅更新正在进行中，跳过本次请求");
            return Ok(None);
        };
        if urls.is_empty() {
            debug!("未配置订阅地址");
            return Ok(Some(RefreshReport::default()));
        }

        info!("开始更新 {} 个订阅", urls.len());
        let bodies = join_all(urls.iter().map(|url| self.fetch(url))).await;

        let mut report = RefreshReport { feeds: urls.len(), ..Default::default() };
        for (url, body) in urls.iter().zip(bodies) {
            let feed = match body.and_then(|body| decode_feed(&body)) {
                Ok(feed) => feed,
                Err(e) => {
                    warn!("订阅 {} 更新失败: {}", url, e);
                    report.failed_feeds += 1;
                    continue;
                }
            };
            let parsed = feed.servers.len();
            let added = self.registry.merge(feed.servers).await;
            info!("订阅 {} 解析 {} 个, 新增 {} 个, 跳过 {} 行", url, parsed, added, feed.skipped);
            report.added += added;
            report.skipped_lines += feed.skipped;
        }

        self.registry.persist().await?;
        info!(
            "订阅更新完成: {}/{} 成功, 新增 {} 个服务器",
            report.feeds - report.failed_feeds,
            report.feeds,
            report.added
        );
        Ok(Some(report))
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Request(format!("HTTP {}", status)));
        }
        Ok(response.text().await?)
    }
}
