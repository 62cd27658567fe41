use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info};

use flowjob_core::config::AppConfig;
use flowjob_core::id::IdGenerator;
use flowjob_core::{SchedError, SchedResult, Supervisor, Worker};
use flowjob_dispatch::TaskDispatcher;
use flowjob_registry::rpc::{DestinationClient, DiscoveryClient};
use flowjob_registry::{build_registry, local_host, RegistryServer, ServerRegistry, ServerRole};

use crate::heartbeat::HeartbeatThread;
use crate::lock::ClusterLock;
use crate::manager::JobManager;
use crate::rpc::{supervisor_router, SupervisorRpcState};
use crate::scanner::{RunningInstanceScanner, TriggeringJobScanner, WaitingInstanceScanner};

/// 数据库迁移脚本
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Supervisor 进程装配
///
/// 注册中心 → 状态机 → 派发器 → 三个扫描器心跳 → RPC 服务端，
/// 依赖方向与关停顺序相反。
pub struct SupervisorStartup {
    registry: Arc<dyn ServerRegistry>,
    manager: Arc<JobManager>,
    scanners: Vec<HeartbeatThread>,
    server_handle: Option<JoinHandle<()>>,
}

impl SupervisorStartup {
    /// `local_worker`：同进程拉起的 Worker（LOCAL_PRIORITY 路由优先命中）
    pub async fn build(
        config: &AppConfig,
        pool: PgPool,
        local_worker: Option<Worker>,
    ) -> SchedResult<Self> {
        let supervisor = Supervisor::new(
            local_host(&config.supervisor.bind_host),
            config.supervisor.port,
        );
        let registry = build_registry(
            config,
            RegistryServer::Supervisor(supervisor),
            ServerRole::Worker,
        )
        .await?;

        let id_gen = Arc::new(IdGenerator::new(config.supervisor.node_id)?);
        let worker_client = DiscoveryClient::new(Arc::clone(&registry), &config.http, None)?;
        let manager = Arc::new(JobManager::new(
            pool.clone(),
            id_gen,
            Arc::clone(&registry),
            worker_client,
        ));

        let dispatch_client = DestinationClient::new(&config.http, None)?;
        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&registry),
            dispatch_client,
            local_worker,
            Arc::clone(&manager) as Arc<dyn flowjob_dispatch::DispatchEventListener>,
        ));
        manager.set_dispatcher(dispatcher);

        Ok(Self {
            registry,
            manager,
            scanners: Vec::new(),
            server_handle: None,
        })
    }

    pub fn manager(&self) -> Arc<JobManager> {
        Arc::clone(&self.manager)
    }

    pub fn registry(&self) -> Arc<dyn ServerRegistry> {
        Arc::clone(&self.registry)
    }

    /// 注册自身、拉起扫描器与 RPC 服务端
    pub async fn start(&mut self, config: &AppConfig) -> SchedResult<()> {
        self.registry.register().await?;

        let sup = &config.supervisor;
        let batch = sup.process_batch_size;
        let pool = self.manager.pool().clone();

        let triggering = TriggeringJobScanner::new(
            self.manager(),
            ClusterLock::new(pool.clone(), "scan_triggering_job"),
            sup.trigger_lookahead_ms,
            batch,
        );
        let waiting = WaitingInstanceScanner::new(
            self.manager(),
            ClusterLock::new(pool.clone(), "scan_waiting_instance"),
            sup.scan_waiting_instance_period_ms,
            batch,
        );
        let running = RunningInstanceScanner::new(
            self.manager(),
            ClusterLock::new(pool, "scan_running_instance"),
            sup.scan_running_instance_period_ms,
            batch,
        );
        self.scanners = vec![
            HeartbeatThread::start(sup.scan_triggering_job_period_ms, Arc::new(triggering)),
            HeartbeatThread::start(sup.scan_waiting_instance_period_ms, Arc::new(waiting)),
            HeartbeatThread::start(sup.scan_running_instance_period_ms, Arc::new(running)),
        ];

        let state = Arc::new(SupervisorRpcState {
            manager: self.manager(),
            group_tokens: sup.group_tokens.clone(),
        });
        let router = supervisor_router(state);
        let addr = format!("{}:{}", sup.bind_host, sup.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SchedError::config(format!("绑定Supervisor端口失败 {addr}: {e}")))?;
        info!("Supervisor RPC 服务监听 {}", addr);
        self.server_handle = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("Supervisor RPC 服务退出: {}", e);
            }
        }));
        Ok(())
    }

    /// 反向关停：扫描器 → RPC 服务端 → 注销
    pub async fn shutdown(mut self) {
        for scanner in self.scanners.drain(..) {
            scanner.shutdown(Duration::from_secs(3)).await;
        }
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
        self.registry.close().await;
        info!("Supervisor 已关停");
    }
}

