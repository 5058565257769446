//! 单元测试用的替身实现

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::connectivity::HttpProbe;
use crate::control::LiveApi;
use crate::core_config::{Inbound, Outbound};
use crate::error::{Error, Result};
use crate::latency::Pinger;
use crate::link::parse_link;
use crate::server::{Provenance, ServerRecord};

/// 构造一个可用的 trojan 服务器记录，地址为 `{name}.example.com`
pub fn record(name: &str, provenance: Provenance) -> ServerRecord {
    let url = format!("trojan://secret@{}.example.com:443#{}", name, name);
    let link = parse_link(&url).expect("valid trojan link");
    ServerRecord::from_link(&url, link, provenance).expect("valid record")
}

#[derive(Default)]
struct CoreState {
    inbounds: HashMap<String, u16>,
    outbounds: HashMap<String, Outbound>,
    occupied: HashSet<u16>,
    refused_hosts: HashSet<String>,
    port_conflicts: usize,
    outbound_adds: usize,
}

/// 内存中的内核实例，行为与真实控制接口一致：重复标签和占用端口都会失败
#[derive(Default)]
pub struct FakeCore {
    state: Mutex<CoreState>,
}

impl FakeCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 这些端口被外部程序占用
    pub fn occupy(self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.lock().occupied.extend(ports);
        self
    }

    /// 拒绝添加指向该地址的出站
    pub fn refuse_host(&self, host: &str) {
        self.lock().refused_hosts.insert(host.to_string());
    }

    pub fn inbound_tags(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.lock().inbounds.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn outbound_tags(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.lock().outbounds.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn outbound(&self, tag: &str) -> Option<Outbound> {
        self.lock().outbounds.get(tag).cloned()
    }

    pub fn port_conflicts(&self) -> usize {
        self.lock().port_conflicts
    }

    pub fn outbound_adds(&self) -> usize {
        self.lock().outbound_adds
    }

    /// 端口上的入站转发到的服务器地址（入站和出站同标签）
    pub fn server_behind(&self, port: u16) -> Option<String> {
        let state = self.lock();
        let (tag, _) = state.inbounds.iter().find(|(_, p)| **p == port)?;
        let outbound = state.outbounds.get(tag)?;
        outbound.server_address().map(str::to_string)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn control_error(action: &'static str, tag: &str, message: &str) -> Error {
    Error::ControlApi { action, tags: tag.to_string(), message: message.to_string() }
}

#[async_trait]
impl LiveApi for FakeCore {
    fn name(&self) -> &str {
        "fake"
    }

    async fn add_outbound(&self, outbound: &Outbound) -> Result<()> {
        let mut state = self.lock();
        state.outbound_adds += 1;
        if state.outbounds.contains_key(&outbound.tag) {
            return Err(control_error("ado", &outbound.tag, "existing tag found"));
        }
        if let Some(host) = outbound.server_address() {
            if state.refused_hosts.contains(host) {
                return Err(control_error("ado", &outbound.tag, "refused"));
            }
        }
        state.outbounds.insert(outbound.tag.clone(), outbound.clone());
        Ok(())
    }

    async fn remove_outbounds(&self, tags: &[String]) -> Result<()> {
        let mut state = self.lock();
        for tag in tags {
            if state.outbounds.remove(tag).is_none() {
                return Err(control_error("rmo", tag, "not found"));
            }
        }
        Ok(())
    }

    async fn add_inbound(&self, inbound: &Inbound) -> Result<()> {
        let mut state = self.lock();
        if state.occupied.contains(&inbound.port) || state.inbounds.values().any(|p| *p == inbound.port) {
            state.port_conflicts += 1;
            return Err(Error::PortInUse(inbound.port));
        }
        if state.inbounds.contains_key(&inbound.tag) {
            return Err(control_error("adi", &inbound.tag, "existing tag found"));
        }
        state.inbounds.insert(inbound.tag.clone(), inbound.port);
        Ok(())
    }

    async fn remove_inbounds(&self, tags: &[String]) -> Result<()> {
        let mut state = self.lock();
        for tag in tags {
            if state.inbounds.remove(tag).is_none() {
                return Err(control_error("rmi", tag, "not found"));
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<String> {
        let state = self.lock();
        Ok(format!("inbounds: {} outbounds: {}", state.inbounds.len(), state.outbounds.len()))
    }

    fn has_outbound(&self, tag: &str) -> bool {
        self.lock().outbounds.contains_key(tag)
    }

    fn has_inbound(&self, tag: &str) -> bool {
        self.lock().inbounds.contains_key(tag)
    }
}

/// 按主机名返回固定延迟的 ping，未登记的主机视为不可达
#[derive(Default)]
pub struct FakePinger {
    replies: HashMap<String, Duration>,
    gate: Option<Arc<Semaphore>>,
}

impl FakePinger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, host: &str, rtt: Duration) -> Self {
        self.replies.insert(host.to_string(), rtt);
        self
    }

    /// 每次 ping 都要先拿到一个许可
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn gate(&self) -> Arc<Semaphore> {
        self.gate.clone().expect("pinger is gated")
    }
}

#[async_trait]
impl Pinger for FakePinger {
    async fn ping(&self, host: &str) -> Result<Duration> {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.replies
            .get(host)
            .copied()
            .ok_or_else(|| Error::Request(format!("{} unreachable", host)))
    }
}

/// 通过 [`FakeCore`] 找到端口背后的服务器，再决定请求成败
pub struct FakeHttp {
    core: Arc<FakeCore>,
    unreachable: Mutex<HashSet<String>>,
    network_up: bool,
    latency: Duration,
    gate: Option<Arc<Semaphore>>,
    started: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    direct_calls: AtomicUsize,
}

impl FakeHttp {
    pub fn new(core: Arc<FakeCore>) -> Self {
        Self {
            core,
            unreachable: Mutex::new(HashSet::new()),
            network_up: true,
            latency: Duration::from_millis(120),
            gate: None,
            started: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            direct_calls: AtomicUsize::new(0),
        }
    }

    pub fn network_down(mut self) -> Self {
        self.network_up = false;
        self
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn gate(&self) -> Arc<Semaphore> {
        self.gate.clone().expect("probe is gated")
    }

    pub fn unreachable(&self, host: &str) {
        self.unreachable.lock().unwrap_or_else(|e| e.into_inner()).insert(host.to_string());
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn direct_calls(&self) -> usize {
        self.direct_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpProbe for FakeHttp {
    async fn direct(&self, url: &str) -> Result<()> {
        self.direct_calls.fetch_add(1, Ordering::SeqCst);
        if self.network_up {
            Ok(())
        } else {
            Err(Error::Request(format!("{} unreachable", url)))
        }
    }

    async fn through_proxy(&self, port: u16, _url: &str) -> Result<Duration> {
        let host = self.core.server_behind(port);
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let blocked = self.unreachable.lock().unwrap_or_else(|e| e.into_inner());
        match host {
            Some(host) if !blocked.contains(&host) => Ok(self.latency),
            Some(host) => Err(Error::Request(format!("{} unreachable", host))),
            None => Err(Error::Request(format!("nothing listening on {}", port))),
        }
    }
}
