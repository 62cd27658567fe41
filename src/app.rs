use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;

use flowjob_core::config::AppConfig;
use flowjob_core::Worker;
use flowjob_registry::local_host;
use flowjob_supervisor::SupervisorStartup;
use flowjob_worker::{ExecutorRegistry, WorkerStartup};

use crate::shutdown::wait_for_shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Supervisor,
    Worker,
    All,
}

pub struct Application {
    config: AppConfig,
    mode: AppMode,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode) -> Self {
        Self { config, mode }
    }

    pub async fn run(self) -> Result<()> {
        let supervisor = if matches!(self.mode, AppMode::Supervisor | AppMode::All) {
            let pool = PgPoolOptions::new()
                .max_connections(self.config.database.max_connections)
                .acquire_timeout(Duration::from_secs(
                    self.config.database.connect_timeout_seconds,
                ))
                .connect(&self.config.database.url)
                .await
                .context("连接数据库失败")?;
            flowjob_supervisor::MIGRATOR
                .run(&pool)
                .await
                .context("数据库迁移失败")?;

            // all 模式下 Supervisor 与 Worker 同机，本机优先路由可命中
            let local_worker = (self.mode == AppMode::All).then(|| {
                Worker::new(
                    self.config.worker.group.clone(),
                    "local",
                    local_host(&self.config.worker.bind_host),
                    self.config.worker.port,
                )
            });
            let mut startup = SupervisorStartup::build(&self.config, pool, local_worker)
                .await
                .context("装配Supervisor失败")?;
            startup.start(&self.config).await.context("启动Supervisor失败")?;
            Some(startup)
        } else {
            None
        };

        let worker = if matches!(self.mode, AppMode::Worker | AppMode::All) {
            let mut startup = WorkerStartup::build(&self.config, ExecutorRegistry::with_builtins())
                .await
                .context("装配Worker失败")?;
            startup.start(&self.config).await.context("启动Worker失败")?;
            Some(startup)
        } else {
            None
        };

        info!("flowjob 启动完成");
        wait_for_shutdown().await;
        info!("开始关停");

        // Worker 先走（止住新任务），Supervisor 收尾
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }
        info!("flowjob 已退出");
        Ok(())
    }
}
