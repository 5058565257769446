//! 连通性测试：经测试实例真正发起 HTTP 请求
//!
//! 每个工作者占用一个固定的探测槽位 `test-{i}`：推送同标签的出站，
//! 在空闲端口上开一个 HTTP 入站，请求测试地址后再把两者都撤掉。
//! 路由规则在启动时已写好 `test-{i}` 入站到 `test-{i}` 出站。

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ConnectivitySettings;
use crate::control::LiveApi;
use crate::core_config::{probe_tag, Inbound};
use crate::error::{Error, Result};
use crate::flight::SingleFlight;
use crate::latency::ceil_millis;
use crate::ports::PortAllocator;
use crate::registry::Registry;
use crate::server::ServerRecord;

/// HTTP 请求实现
#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// 不走代理直接请求，用于判断本机网络
    async fn direct(&self, url: &str) -> Result<()>;

    /// 经本地 HTTP 代理端口请求，返回耗时
    async fn through_proxy(&self, port: u16, url: &str) -> Result<Duration>;
}

/// 基于 reqwest 的实现
pub struct ReqwestProbe {
    proxy_host: String,
    timeout: Duration,
    direct: reqwest::Client,
}

impl ReqwestProbe {
    pub fn new(proxy_host: &str, timeout: Duration) -> Result<Self> {
        let direct = reqwest::Client::builder().timeout(timeout).no_proxy().build()?;
        Ok(Self { proxy_host: proxy_host.to_string(), timeout, direct })
    }
}

fn expect_success(response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::Request(format!("unexpected status {}", status)))
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn direct(&self, url: &str) -> Result<()> {
        let response = self.direct.head(url).send().await?;
        expect_success(&response)
    }

    async fn through_proxy(&self, port: u16, url: &str) -> Result<Duration> {
        let proxy = reqwest::Proxy::all(format!("http://{}:{}", self.proxy_host, port))?;
        let client = reqwest::Client::builder().timeout(self.timeout).proxy(proxy).build()?;
        let start = Instant::now();
        let response = client.head(url).send().await?;
        expect_success(&response)?;
        Ok(start.elapsed())
    }
}

/// 一轮连通性测试的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityReport {
    pub tested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub evicted: usize,
}

/// 连通性测试任务
pub struct ConnectivityChecker {
    registry: Registry,
    core: Arc<dyn LiveApi>,
    http: Arc<dyn HttpProbe>,
    settings: ConnectivitySettings,
    listen: String,
    ports: PortAllocator,
    flight: SingleFlight,
}

impl ConnectivityChecker {
    /// `listen` 为测试实例上探测入站监听的地址
    pub fn new(
        registry: Registry,
        core: Arc<dyn LiveApi>,
        http: Arc<dyn HttpProbe>,
        settings: ConnectivitySettings,
        listen: &str,
    ) -> Self {
        let ports = PortAllocator::new(settings.base_port);
        Self {
            registry,
            core,
            http,
            settings,
            listen: listen.to_string(),
            ports,
            flight: SingleFlight::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    /// 测试所有服务器。已有一轮在运行时直接返回 `None`；
    /// 本机网络不通时返回 [`Error::NetworkDown`]，不改动任何计数。
    pub async fn check_connectivity(&self) -> Result<Option<ConnectivityReport>> {
        let Some(_guard) = self.flight.try_acquire() else {
            warn!("连通性测试正在进行中，跳过本次请求");
            return Ok(None);
        };

        if self.settings.precheck {
            if let Err(e) = self.http.direct(&self.settings.precheck_url).await {
                warn!("本机网络不可用，跳过连通性测试: {}", e);
                return Err(Error::NetworkDown(e.to_string()));
            }
        }

        let servers = self.registry.snapshot().await;
        let workers = self.settings.workers.max(1).min(servers.len());
        info!("开始连通性测试: {} 个服务器, {} 个并发", servers.len(), workers);

        let mut report = ConnectivityReport { tested: servers.len(), ..Default::default() };
        let queue = Mutex::new(servers.into_iter().collect::<VecDeque<_>>());
        let counts = join_all((0..workers).map(|slot| self.run_worker(slot, &queue))).await;
        for (ok, failed) in counts {
            report.succeeded += ok;
            report.failed += failed;
        }

        if self.settings.auto_evict {
            let threshold = self.settings.evict_threshold;
            report.evicted = self.registry.evict_where(|s| s.conn_failure_streak > threshold).await.len();
        }
        self.registry.persist().await?;

        info!(
            "连通性测试完成: {} 成功, {} 失败, 移除 {} 个",
            report.succeeded, report.failed, report.evicted
        );
        Ok(Some(report))
    }

    /// 工作者不断从队列取下一个服务器，直到队列为空
    async fn run_worker(&self, slot: usize, queue: &Mutex<VecDeque<ServerRecord>>) -> (usize, usize) {
        let (mut ok, mut failed) = (0, 0);
        loop {
            let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            let Some(server) = next else { break };

            let latency = self.probe_server(slot, &server).await;
            if latency.is_some() {
                ok += 1;
            } else {
                failed += 1;
            }
            if !self.registry.update(&server.id, |s| s.record_connectivity(latency)).await {
                debug!("[{}] 测试期间已被移除", server.name);
            }
        }
        (ok, failed)
    }

    /// 在槽位上测一个服务器，返回延迟毫秒；无论成败都会撤掉推送的配置
    async fn probe_server(&self, slot: usize, server: &ServerRecord) -> Option<i64> {
        let tag = probe_tag(slot);
        let mut pushed_outbound = false;
        let mut port = None;
        let result = self.attempt(&tag, server, &mut pushed_outbound, &mut port).await;
        self.cleanup(&tag, pushed_outbound, port).await;

        match result {
            Ok(elapsed) => {
                let ms = ceil_millis(elapsed);
                debug!("[{}] {} 连通 {}ms", server.name, server.host, ms);
                Some(ms)
            }
            Err(e) => {
                debug!("[{}] {} 连通性测试失败: {}", server.name, server.host, e);
                None
            }
        }
    }

    async fn attempt(
        &self,
        tag: &str,
        server: &ServerRecord,
        pushed_outbound: &mut bool,
        port: &mut Option<u16>,
    ) -> Result<Duration> {
        let outbound = server.outbound_with_tag(tag)?;
        self.clear_stale(tag).await?;

        self.core.add_outbound(&outbound).await?;
        *pushed_outbound = true;

        let bound = self.open_inbound(tag).await?;
        *port = Some(bound);

        // reqwest 自带超时，这里再兜一层
        let limit = Duration::from_secs(self.settings.timeout) + Duration::from_secs(1);
        match timeout(limit, self.http.through_proxy(bound, &self.settings.test_url)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit.as_millis() as u64)),
        }
    }

    /// 上一次清理失败时残留的同名标签要先撤掉
    async fn clear_stale(&self, tag: &str) -> Result<()> {
        let tags = [tag.to_string()];
        if self.core.has_inbound(tag) {
            self.core.remove_inbounds(&tags).await?;
        }
        if self.core.has_outbound(tag) {
            self.core.remove_outbounds(&tags).await?;
        }
        Ok(())
    }

    /// 申请端口并添加入站，端口被占用时换下一个
    async fn open_inbound(&self, tag: &str) -> Result<u16> {
        let mut conflict = None;
        for _ in 0..self.settings.port_attempts.max(1) {
            let port = self
                .ports
                .acquire(conflict)
                .ok_or_else(|| Error::PortInUse(conflict.unwrap_or(self.settings.base_port)))?;
            match self.core.add_inbound(&Inbound::http(tag, &self.listen, port)).await {
                Ok(()) => return Ok(port),
                Err(e) if e.is_port_conflict() => {
                    debug!("端口 {} 被占用，尝试下一个", port);
                    self.ports.release(port);
                    conflict = Some(port);
                }
                Err(e) => {
                    self.ports.release(port);
                    return Err(e);
                }
            }
        }
        Err(Error::PortInUse(conflict.unwrap_or(self.settings.base_port)))
    }

    async fn cleanup(&self, tag: &str, pushed_outbound: bool, port: Option<u16>) {
        let tags = [tag.to_string()];
        if let Some(port) = port {
            if let Err(e) = self.core.remove_inbounds(&tags).await {
                warn!("移除探测入站 {} 失败: {}", tag, e);
            }
            self.ports.release(port);
        }
        if pushed_outbound {
            if let Err(e) = self.core.remove_outbounds(&tags).await {
                warn!("移除探测出站 {} 失败: {}", tag, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Provenance;
    use crate::testing::{record, FakeCore, FakeHttp};

    fn settings(workers: usize) -> ConnectivitySettings {
        ConnectivitySettings {
            workers,
            base_port: 31000,
            timeout: 2,
            ..ConnectivitySettings::default()
        }
    }

    async fn registry_with(count: usize) -> (Registry, Vec<ServerRecord>) {
        let registry = Registry::in_memory();
        let servers: Vec<_> = (0..count).map(|i| record(&format!("node{}", i), Provenance::Subscription)).collect();
        registry.merge(servers.clone()).await;
        (registry, servers)
    }

    fn checker(registry: &Registry, core: &Arc<FakeCore>, http: &Arc<FakeHttp>, settings: ConnectivitySettings) -> ConnectivityChecker {
        ConnectivityChecker::new(
            registry.clone(),
            Arc::clone(core) as Arc<dyn LiveApi>,
            Arc::clone(http) as Arc<dyn HttpProbe>,
            settings,
            "127.0.0.1",
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn records_results_and_cleans_up_every_slot() {
        let (registry, servers) = registry_with(5).await;
        let core = Arc::new(FakeCore::new());
        let http = Arc::new(FakeHttp::new(Arc::clone(&core)));
        http.unreachable(&servers[1].host);
        core.refuse_host(&servers[3].host);

        let checker = checker(&registry, &core, &http, settings(2));
        let report = checker.check_connectivity().await.unwrap().unwrap();
        assert_eq!(report, ConnectivityReport { tested: 5, succeeded: 3, failed: 2, evicted: 0 });

        assert!(core.inbound_tags().is_empty());
        assert!(core.outbound_tags().is_empty());
        assert_eq!(checker.ports.leased(), 0);

        let ok = registry.get(&servers[0].id).await.unwrap();
        assert_eq!((ok.conn_latency_ms, ok.conn_failure_streak), (120, 0));
        for failed in [&servers[1], &servers[3]] {
            let failed = registry.get(&failed.id).await.unwrap();
            assert_eq!((failed.conn_latency_ms, failed.conn_failure_streak), (-1, 1));
        }
    }

    #[tokio::test]
    async fn keeps_a_sliding_window_of_workers() {
        let (registry, _) = registry_with(12).await;
        let core = Arc::new(FakeCore::new());
        let http = Arc::new(FakeHttp::new(Arc::clone(&core)).gated());
        let gate = http.gate();
        let checker = Arc::new(checker(&registry, &core, &http, settings(10)));

        let pass = tokio::spawn({
            let checker = Arc::clone(&checker);
            async move { checker.check_connectivity().await }
        });

        wait_until(|| http.started() == 10).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(http.started(), 10);
        assert_eq!(core.inbound_tags().len(), 10);

        // 一个完成后立刻补上第11个
        gate.add_permits(1);
        wait_until(|| http.started() == 11).await;
        assert_eq!(core.inbound_tags().len(), 10);

        gate.add_permits(11);
        let report = pass.await.unwrap().unwrap().unwrap();
        assert_eq!(report.succeeded, 12);
        assert_eq!(http.max_in_flight(), 10);
        assert!(core.inbound_tags().is_empty());
    }

    #[tokio::test]
    async fn second_pass_is_skipped_while_running() {
        let (registry, _) = registry_with(3).await;
        let core = Arc::new(FakeCore::new());
        let http = Arc::new(FakeHttp::new(Arc::clone(&core)).gated());
        let gate = http.gate();
        let checker = Arc::new(checker(&registry, &core, &http, settings(10)));

        let pass = tokio::spawn({
            let checker = Arc::clone(&checker);
            async move { checker.check_connectivity().await }
        });
        wait_until(|| http.started() == 3).await;

        assert_eq!(checker.check_connectivity().await.unwrap(), None);
        assert_eq!(core.outbound_adds(), 3);

        gate.add_permits(3);
        pass.await.unwrap().unwrap();
        assert!(!checker.is_running());
    }

    #[tokio::test]
    async fn retries_on_occupied_ports() {
        let (registry, servers) = registry_with(1).await;
        let core = Arc::new(FakeCore::new().occupy(31000..31003));
        let http = Arc::new(FakeHttp::new(Arc::clone(&core)));

        let checker = checker(&registry, &core, &http, settings(1));
        let report = checker.check_connectivity().await.unwrap().unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(core.port_conflicts(), 3);
        assert_eq!(registry.get(&servers[0].id).await.unwrap().conn_latency_ms, 120);
    }

    #[tokio::test]
    async fn gives_up_after_port_attempts() {
        let (registry, servers) = registry_with(1).await;
        let core = Arc::new(FakeCore::new().occupy(31000..31010));
        let http = Arc::new(FakeHttp::new(Arc::clone(&core)));

        let mut settings = settings(1);
        settings.port_attempts = 4;
        let checker = checker(&registry, &core, &http, settings);
        let report = checker.check_connectivity().await.unwrap().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(core.port_conflicts(), 4);
        assert!(core.outbound_tags().is_empty());
        assert_eq!(registry.get(&servers[0].id).await.unwrap().conn_failure_streak, 1);
    }

    #[tokio::test]
    async fn network_down_aborts_without_penalties() {
        let (registry, servers) = registry_with(2).await;
        let core = Arc::new(FakeCore::new());
        let http = Arc::new(FakeHttp::new(Arc::clone(&core)).network_down());

        let checker = checker(&registry, &core, &http, settings(2));
        let err = checker.check_connectivity().await.unwrap_err();
        assert!(matches!(err, Error::NetworkDown(_)));
        assert_eq!(http.direct_calls(), 1);
        assert_eq!(core.outbound_adds(), 0);
        let untouched = registry.get(&servers[0].id).await.unwrap();
        assert_eq!(untouched.conn_failure_streak, 0);
        assert!(untouched.conn_checked_at.is_none());
    }

    #[tokio::test]
    async fn auto_evicts_repeatedly_failing_servers() {
        let (registry, servers) = registry_with(2).await;
        let core = Arc::new(FakeCore::new());
        let http = Arc::new(FakeHttp::new(Arc::clone(&core)));
        http.unreachable(&servers[0].host);

        let mut settings = settings(2);
        settings.auto_evict = true;
        settings.evict_threshold = 1;
        let checker = checker(&registry, &core, &http, settings);

        assert_eq!(checker.check_connectivity().await.unwrap().unwrap().evicted, 0);
        assert_eq!(checker.check_connectivity().await.unwrap().unwrap().evicted, 1);
        assert!(registry.get(&servers[0].id).await.is_none());
        assert!(registry.get(&servers[1].id).await.is_some());
    }

    #[tokio::test]
    async fn empty_registry_is_a_no_op() {
        let registry = Registry::in_memory();
        let core = Arc::new(FakeCore::new());
        let http = Arc::new(FakeHttp::new(Arc::clone(&core)));
        let checker = checker(&registry, &core, &http, settings(10));
        let report = checker.check_connectivity().await.unwrap().unwrap();
        assert_eq!(report, ConnectivityReport::default());
    }
}
