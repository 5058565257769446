//! 延迟测试（ICMP ping）

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::LatencySettings;
use crate::error::{Error, Result};
use crate::flight::SingleFlight;
use crate::registry::Registry;

/// ping 实现
#[async_trait]
pub trait Pinger: Send + Sync {
    /// 返回往返时间
    async fn ping(&self, host: &str) -> Result<Duration>;
}

/// 调用系统 `ping` 命令
#[derive(Debug, Clone)]
pub struct SystemPinger {
    timeout: Duration,
}

impl SystemPinger {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn args(&self, host: &str) -> Vec<String> {
        let secs = self.timeout.as_secs().max(1).to_string();
        let millis = self.timeout.as_millis().max(1).to_string();
        if cfg!(windows) {
            vec!["-n".into(), "1".into(), "-w".into(), millis, host.into()]
        } else if cfg!(target_os = "macos") {
            vec!["-n".into(), "-c".into(), "1".into(), "-W".into(), millis, host.into()]
        } else {
            vec!["-n".into(), "-c".into(), "1".into(), "-W".into(), secs, host.into()]
        }
    }
}

/// 从 ping 输出中取出往返时间，例如 `time=14.0 ms`、`time<1ms`
pub fn parse_ping_output(output: &str) -> Option<Duration> {
    static RTT: OnceLock<Regex> = OnceLock::new();
    let re = RTT.get_or_init(|| {
        Regex::new(r"(?i)(?:time|时间)\s*([=<])\s*([0-9]+(?:\.[0-9]+)?)\s*ms").expect("valid regex")
    });
    let caps = re.captures(output)?;
    let ms: f64 = caps.get(2)?.as_str().parse().ok()?;
    let ms = if &caps[1] == "<" { ms.min(1.0) } else { ms };
    Some(Duration::from_secs_f64(ms / 1000.0))
}

#[async_trait]
impl Pinger for SystemPinger {
    async fn ping(&self, host: &str) -> Result<Duration> {
        let output = Command::new("ping")
            .args(self.args(host))
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Request(format!("ping {} 失败", host)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ping_output(&stdout).ok_or_else(|| Error::Request(format!("无法解析 ping {} 的输出", host)))
    }
}

/// 向上取整到毫秒
pub fn ceil_millis(rtt: Duration) -> i64 {
    let nanos = rtt.as_nanos();
    ((nanos + 999_999) / 1_000_000) as i64
}

/// 一轮延迟测试的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencyReport {
    pub tested: usize,
    pub reachable: usize,
    pub evicted: usize,
}

/// 延迟测试任务
pub struct LatencyProber {
    registry: Registry,
    pinger: Arc<dyn Pinger>,
    settings: LatencySettings,
    flight: SingleFlight,
}

impl LatencyProber {
    pub fn new(registry: Registry, pinger: Arc<dyn Pinger>, settings: LatencySettings) -> Self {
        Self { registry, pinger, settings, flight: SingleFlight::new() }
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    /// 并发 ping 所有服务器。已有一轮在运行时直接返回 `None`。
    ///
    /// 只写延迟相关字段，可以和连通性测试同时运行。连续失败达到阈值
    /// 且连通性也不通的服务器会被移除。
    pub async fn probe_all(&self) -> Result<Option<LatencyReport>> {
        let Some(_guard) = self.flight.try_acquire() else {
            warn!("延迟测试正在进行中，跳过本次请求");
            return Ok(None);
        };

        let servers = self.registry.snapshot().await;
        info!("开始延迟测试: {} 个服务器", servers.len());
        let limit = Duration::from_secs(self.settings.timeout);
        let mut report = LatencyReport { tested: servers.len(), ..Default::default() };

        let mut probes: FuturesUnordered<_> = servers
            .iter()
            .map(|server| {
                let pinger = Arc::clone(&self.pinger);
                async move {
                    let result = match timeout(limit, pinger.ping(&server.host)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(limit.as_millis() as u64)),
                    };
                    (server, result)
                }
            })
            .collect();

        while let Some((server, result)) = probes.next().await {
            let latency = match result {
                Ok(rtt) => {
                    let ms = ceil_millis(rtt);
                    debug!("[{}] {} {}ms", server.name, server.host, ms);
                    report.reachable += 1;
                    Some(ms)
                }
                Err(e) => {
                    debug!("[{}] {} ping失败: {}", server.name, server.host, e);
                    None
                }
            };
            self.registry.update(&server.id, |s| s.record_latency(latency)).await;
        }

        let threshold = self.settings.evict_threshold;
        let evicted = self
            .registry
            .evict_where(|s| s.latency_failure_streak >= threshold && s.conn_latency_ms < 0)
            .await;
        report.evicted = evicted.len();

        self.registry.persist().await?;
        info!(
            "延迟测试完成: {}/{} 可达, 移除 {} 个",
            report.reachable, report.tested, report.evicted
        );
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Provenance;
    use crate::testing::{record, FakePinger};

    fn settings(threshold: u32) -> LatencySettings {
        LatencySettings { interval: 60, timeout: 1, evict_threshold: threshold }
    }

    #[test]
    fn parses_common_ping_outputs() {
        let linux = "64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=14.2 ms";
        assert_eq!(parse_ping_output(linux), Some(Duration::from_micros(14_200)));
        let windows = "Reply from 1.1.1.1: bytes=32 time<1ms TTL=57";
        assert_eq!(parse_ping_output(windows), Some(Duration::from_millis(1)));
        assert_eq!(parse_ping_output("Request timed out."), None);
    }

    #[test]
    fn rounds_up_to_whole_millis() {
        assert_eq!(ceil_millis(Duration::from_micros(14_200)), 15);
        assert_eq!(ceil_millis(Duration::from_millis(3)), 3);
        assert_eq!(ceil_millis(Duration::from_nanos(1)), 1);
    }

    #[tokio::test]
    async fn records_results_and_streaks() {
        let registry = Registry::in_memory();
        let up = record("up", Provenance::User);
        let down = record("down", Provenance::User);
        registry.merge(vec![up.clone(), down.clone()]).await;

        let pinger = FakePinger::new().reply(&up.host, Duration::from_micros(20_500));
        let prober = LatencyProber::new(registry.clone(), Arc::new(pinger), settings(10));

        let report = prober.probe_all().await.unwrap().unwrap();
        assert_eq!(report, LatencyReport { tested: 2, reachable: 1, evicted: 0 });
        prober.probe_all().await.unwrap();

        let up = registry.get(&up.id).await.unwrap();
        assert_eq!(up.latency_ms, 21);
        assert_eq!(up.latency_failure_streak, 0);
        let down = registry.get(&down.id).await.unwrap();
        assert_eq!(down.latency_ms, -1);
        assert_eq!(down.latency_failure_streak, 2);
    }

    #[tokio::test]
    async fn eviction_requires_connectivity_failure_too() {
        let registry = Registry::in_memory();
        let nat = record("behind-nat", Provenance::Subscription);
        let dead = record("dead", Provenance::Subscription);
        registry.merge(vec![nat.clone(), dead.clone()]).await;
        registry.update(&nat.id, |s| s.conn_latency_ms = 230).await;

        let prober = LatencyProber::new(registry.clone(), Arc::new(FakePinger::new()), settings(2));
        prober.probe_all().await.unwrap();
        assert_eq!(registry.len().await, 2);

        let report = prober.probe_all().await.unwrap().unwrap();
        assert_eq!(report.evicted, 1);
        let survivor = registry.get(&nat.id).await.unwrap();
        assert_eq!(survivor.latency_failure_streak, 2);
        assert!(registry.get(&dead.id).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_pass_is_rejected() {
        let registry = Registry::in_memory();
        let server = record("slow", Provenance::User);
        registry.merge(vec![server.clone()]).await;

        let pinger = FakePinger::new().gated();
        let gate = pinger.gate();
        let prober = Arc::new(LatencyProber::new(registry.clone(), Arc::new(pinger), settings(5)));

        let first = tokio::spawn({
            let prober = Arc::clone(&prober);
            async move { prober.probe_all().await }
        });
        while !prober.is_running() {
            tokio::task::yield_now().await;
        }
        assert_eq!(prober.probe_all().await.unwrap(), None);

        gate.add_permits(1);
        let report = first.await.unwrap().unwrap().unwrap();
        assert_eq!(report.tested, 1);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let registry = Registry::in_memory();
        let server = record("hang", Provenance::User);
        registry.merge(vec![server.clone()]).await;

        // 门控永不放行，只能等超时
        let prober = LatencyProber::new(registry.clone(), Arc::new(FakePinger::new().gated()), settings(5));
        let report = prober.probe_all().await.unwrap().unwrap();
        assert_eq!(report.reachable, 0);
        assert_eq!(registry.get(&server.id).await.unwrap().latency_failure_streak, 1);
    }
}
