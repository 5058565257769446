//! 周期任务

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 按固定间隔重复执行一个任务。首次执行在一个间隔之后。
///
/// 停止只会阻止下一次执行，正在进行的一轮会跑完。
pub struct PeriodicTask {
    name: String,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), running: Mutex::new(None) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_scheduled(&self) -> bool {
        self.lock().as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    /// 启动任务，已启动时返回 [`Error::AlreadyScheduled`]
    pub fn start<F, Fut>(&self, period: Duration, job: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(Error::AlreadyScheduled(self.name.clone()));
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                debug!("执行周期任务 {}", name);
                job().await;
            }
            debug!("周期任务 {} 已退出", name);
        });

        info!("周期任务 {} 已启动, 间隔 {:?}", self.name, period);
        *running = Some(Running { token, handle });
        Ok(())
    }

    /// 停止任务，未启动时什么也不做
    pub fn stop(&self) {
        if let Some(running) = self.lock().take() {
            running.token.cancel();
            info!("周期任务 {} 已停止", self.name);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
