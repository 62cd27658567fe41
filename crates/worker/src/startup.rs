use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use flowjob_core::config::AppConfig;
use flowjob_core::{SchedError, SchedResult, Worker};
use flowjob_registry::{build_registry, local_host, RegistryServer, ServerRegistry, ServerRole};

use crate::client::SupervisorClient;
use crate::executor::ExecutorRegistry;
use crate::provider::{worker_router, WorkerRpcState};
use crate::runner::WorkerRunner;
use crate::timing_wheel::TimingWheel;

/// Worker 进程装配
///
/// 注册中心（发现 Supervisor）→ RPC 客户端 → 时间轮 + 执行端 → RPC 服务端。
pub struct WorkerStartup {
    worker: Worker,
    registry: Arc<dyn ServerRegistry>,
    runner: Arc<WorkerRunner>,
    client: Arc<SupervisorClient>,
    shutdown_timeout: Duration,
    server_handle: Option<JoinHandle<()>>,
}

impl WorkerStartup {
    pub async fn build(config: &AppConfig, executors: ExecutorRegistry) -> SchedResult<Self> {
        let wc = &config.worker;
        let worker = Worker::new(
            wc.group.clone(),
            Uuid::new_v4().simple().to_string(),
            local_host(&wc.bind_host),
            wc.port,
        );
        let registry = build_registry(
            config,
            RegistryServer::Worker(worker.clone()),
            ServerRole::Supervisor,
        )
        .await?;

        let client = Arc::new(SupervisorClient::new(
            Arc::clone(&registry),
            &config.http,
            worker.clone(),
            &wc.worker_token,
        )?);
        let wheel = Arc::new(TimingWheel::new(
            wc.timing_wheel_tick_ms,
            wc.timing_wheel_ring_size,
        ));
        let runner = WorkerRunner::new(
            wheel,
            Arc::new(executors),
            Arc::clone(&client),
            wc.maximum_pool_size,
        );

        Ok(Self {
            worker,
            registry,
            runner,
            client,
            shutdown_timeout: Duration::from_secs(wc.shutdown_timeout_seconds),
            server_handle: None,
        })
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn runner(&self) -> Arc<WorkerRunner> {
        Arc::clone(&self.runner)
    }

    pub async fn start(&mut self, config: &AppConfig) -> SchedResult<()> {
        self.registry.register().await?;
        self.runner.start();

        let state = Arc::new(WorkerRpcState {
            runner: self.runner(),
            client: Arc::clone(&self.client),
        });
        let router = worker_router(state);
        let addr = format!("{}:{}", config.worker.bind_host, config.worker.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SchedError::config(format!("绑定Worker端口失败 {addr}: {e}")))?;
        info!("Worker RPC 服务监听 {} | {}", addr, self.worker);
        self.server_handle = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("Worker RPC 服务退出: {}", e);
            }
        }));
        Ok(())
    }

    /// 先注销（止住新派发）再排空执行池
    pub async fn shutdown(mut self) {
        self.registry.close().await;
        self.runner.shutdown(self.shutdown_timeout).await;
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
        info!("Worker 已关停: {}", self.worker);
    }
}
