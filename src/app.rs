//! 守护进程的组件装配

use anyhow::Result;
use raypool_core::selection::restored_outbound;
use raypool_core::{
    Config, ConnectivityChecker, LatencyProber, LiveApi, Orchestrator, PeriodicTask, Registry,
    ReqwestProbe, SelectionController, Subscriber, SystemPinger,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 注册表、两个内核实例、探测任务和周期调度
pub struct App {
    pub config: Arc<Config>,
    pub registry: Registry,
    pub orchestrator: Orchestrator,
    pub selection: SelectionController,
    pub latency: Arc<LatencyProber>,
    pub connectivity: Arc<ConnectivityChecker>,
    pub subscriber: Arc<Subscriber>,
    subscription_task: PeriodicTask,
    latency_task: PeriodicTask,
    connectivity_task: PeriodicTask,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir)?;
        let registry = Registry::open(config.state_file())?;
        let orchestrator = Orchestrator::from_config(Arc::clone(&config));

        let main: Arc<dyn LiveApi> = orchestrator.main.clone();
        let test: Arc<dyn LiveApi> = orchestrator.test.clone();
        let selection = SelectionController::new(registry.clone(), main);

        let pinger = SystemPinger::new(Duration::from_secs(config.latency.timeout));
        let latency = LatencyProber::new(registry.clone(), Arc::new(pinger), config.latency.clone());

        let probe = ReqwestProbe::new(&config.test.api.host, Duration::from_secs(config.connectivity.timeout))?;
        let connectivity = ConnectivityChecker::new(
            registry.clone(),
            test,
            Arc::new(probe),
            config.connectivity.clone(),
            &config.test.api.host,
        );
        let subscriber = Subscriber::new(registry.clone(), &config.subscription)?;

        Ok(Self {
            config,
            registry,
            orchestrator,
            selection,
            latency: Arc::new(latency),
            connectivity: Arc::new(connectivity),
            subscriber: Arc::new(subscriber),
            subscription_task: PeriodicTask::new("subscription"),
            latency_task: PeriodicTask::new("latency"),
            connectivity_task: PeriodicTask::new("connectivity"),
        })
    }

    /// 启动内核实例和周期任务，随后在后台跑一轮完整的更新和测试
    pub async fn start(&self) -> Result<()> {
        let active = restored_outbound(&self.registry).await;
        self.orchestrator.start(active).await?;
        self.schedule()?;

        let subscriber = Arc::clone(&self.subscriber);
        let latency = Arc::clone(&self.latency);
        let connectivity = Arc::clone(&self.connectivity);
        tokio::spawn(async move {
            if !subscriber.urls().is_empty() {
                if let Err(e) = subscriber.refresh().await {
                    error!("订阅更新失败: {}", e);
                }
            }
            let (ping, check) = tokio::join!(latency.probe_all(), connectivity.check_connectivity());
            if let Err(e) = ping {
                error!("延迟测试失败: {}", e);
            }
            if let Err(e) = check {
                warn!("连通性测试失败: {}", e);
            }
        });
        Ok(())
    }

    fn schedule(&self) -> Result<()> {
        let subscriber = Arc::clone(&self.subscriber);
        self.subscription_task.start(Duration::from_secs(self.config.subscription.interval), move || {
            let subscriber = Arc::clone(&subscriber);
            async move {
                if let Err(e) = subscriber.refresh().await {
                    error!("订阅更新失败: {}", e);
                }
            }
        })?;

        let latency = Arc::clone(&self.latency);
        self.latency_task.start(Duration::from_secs(self.config.latency.interval), move || {
            let latency = Arc::clone(&latency);
            async move {
                if let Err(e) = latency.probe_all().await {
                    error!("延迟测试失败: {}", e);
                }
            }
        })?;

        let connectivity = Arc::clone(&self.connectivity);
        self.connectivity_task.start(Duration::from_secs(self.config.connectivity.interval), move || {
            let connectivity = Arc::clone(&connectivity);
            async move {
                if let Err(e) = connectivity.check_connectivity().await {
                    warn!("连通性测试失败: {}", e);
                }
            }
        })?;
        Ok(())
    }

    /// 停止周期任务并等待两个内核实例退出
    pub async fn shutdown(&self) -> Result<()> {
        self.subscription_task.stop();
        self.latency_task.stop();
        self.connectivity_task.stop();
        self.orchestrator.shutdown().await?;
        info!("所有内核实例已停止");
        Ok(())
    }
}
