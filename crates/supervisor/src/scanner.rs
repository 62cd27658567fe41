//! 三个扫描器心跳
//!
//! - Triggering：到期任务触发；
//! - Waiting：长期 WAITING 的实例复活（重派未被存活 Worker 认领的 Task）；
//! - Running：长期 RUNNING 的实例体检（死 Worker 重派 / 终态收口 / 僵尸清理）。
//!
//! 每轮先抢集群锁（advisory lock），再处理至多一个批量；批量打满返回 busy。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use flowjob_core::{RunState, SchedInstance, SchedResult, SchedTask};

use crate::heartbeat::HeartbeatAction;
use crate::lock::ClusterLock;
use crate::manager::JobManager;

/// 过期阈值 = 心跳周期 × 8
const EXPIRE_PERIODS: i64 = 8;

pub struct TriggeringJobScanner {
    manager: Arc<JobManager>,
    cluster_lock: ClusterLock,
    lookahead_ms: i64,
    batch_size: i64,
}

impl TriggeringJobScanner {
    pub fn new(
        manager: Arc<JobManager>,
        cluster_lock: ClusterLock,
        lookahead_ms: u64,
        batch_size: i64,
    ) -> Self {
        Self {
            manager,
            cluster_lock,
            lookahead_ms: lookahead_ms as i64,
            batch_size,
        }
    }

    async fn process(&self) -> SchedResult<bool> {
        let now = Utc::now();
        let max_next_trigger_time = now.timestamp_millis() + self.lookahead_ms;
        let jobs = self
            .manager
            .find_triggering_jobs(max_next_trigger_time, self.batch_size)
            .await?;
        if jobs.is_empty() {
            return Ok(true);
        }
        let count = jobs.len();
        for job in jobs {
            if let Err(e) = self.manager.process_triggering_job(&job, now).await {
                error!("触发任务失败: {} | {}", job.job_id, e);
            }
        }
        Ok((count as i64) < self.batch_size)
    }
}

#[async_trait]
impl HeartbeatAction for TriggeringJobScanner {
    fn name(&self) -> &'static str {
        "TriggeringJobScanner"
    }

    async fn heartbeat(&self) -> SchedResult<bool> {
        let snapshot = self.manager.discovered().await?;
        if !snapshot.has_workers(None) {
            warn!("没有发现可用Worker，跳过触发扫描");
            return Ok(true);
        }
        Ok(self
            .cluster_lock
            .try_locked(|| self.process())
            .await?
            .unwrap_or(true))
    }
}

pub struct WaitingInstanceScanner {
    manager: Arc<JobManager>,
    cluster_lock: ClusterLock,
    period_ms: u64,
    batch_size: i64,
}

impl WaitingInstanceScanner {
    pub fn new(
        manager: Arc<JobManager>,
        cluster_lock: ClusterLock,
        period_ms: u64,
        batch_size: i64,
    ) -> Self {
        Self {
            manager,
            cluster_lock,
            period_ms,
            batch_size,
        }
    }

    async fn process(&self) -> SchedResult<bool> {
        let now = Utc::now();
        let expire_before = now - Duration::milliseconds(self.period_ms as i64 * EXPIRE_PERIODS);
        let instances = self
            .manager
            .find_expired_instances(RunState::Waiting, expire_before, self.batch_size)
            .await?;
        if instances.is_empty() {
            return Ok(true);
        }
        let count = instances.len();
        for instance in instances {
            if let Err(e) = self.process_each(&instance).await {
                error!("处理过期WAITING实例失败: {} | {}", instance.instance_id, e);
            }
        }
        Ok((count as i64) < self.batch_size)
    }

    async fn process_each(&self, instance: &SchedInstance) -> SchedResult<()> {
        let now = Utc::now();
        let tasks = self.manager.find_instance_tasks(instance.instance_id).await?;

        if tasks.iter().all(SchedTask::is_terminal) {
            // Task 已全部终态，只是实例没收口
            if self.manager.renew_instance_update_time(instance, now).await? {
                info!("WAITING实例的Task已全部终态，收口: {}", instance.instance_id);
                self.manager.purge_instance(instance).await?;
            }
            return Ok(());
        }

        let snapshot = self.manager.discovered().await?;
        let dispatching = self.manager.filter_dispatching_tasks(&tasks, &snapshot);
        if dispatching.is_empty() {
            // 所有WAITING Task 都已被存活 Worker 认领，续期观察
            self.manager.renew_instance_update_time(instance, now).await?;
            return Ok(());
        }

        let Some(job) = self.manager.get_job(instance.job_id).await? else {
            error!("WAITING实例找不到任务定义: {}", instance.job_id);
            self.manager
                .cancel_invalid_instance(instance.instance_id, "job missing")
                .await?;
            return Ok(());
        };

        if !snapshot.has_workers(Some(&job.job_group)) {
            self.manager.renew_instance_update_time(instance, now).await?;
            warn!("分组 {} 没有可用Worker，实例 {} 暂缓重派", job.job_group, instance.instance_id);
            return Ok(());
        }

        if self.manager.renew_instance_update_time(instance, now).await? {
            info!("WAITING扫描器重派实例: {}", instance.instance_id);
            self.manager.redispatch(&job, instance, &dispatching);
        }
        Ok(())
    }
}

#[async_trait]
impl HeartbeatAction for WaitingInstanceScanner {
    fn name(&self) -> &'static str {
        "WaitingInstanceScanner"
    }

    async fn heartbeat(&self) -> SchedResult<bool> {
        let snapshot = self.manager.discovered().await?;
        if !snapshot.has_workers(None) {
            warn!("没有发现可用Worker，跳过WAITING扫描");
            return Ok(true);
        }
        Ok(self
            .cluster_lock
            .try_locked(|| self.process())
            .await?
            .unwrap_or(true))
    }
}

pub struct RunningInstanceScanner {
    manager: Arc<JobManager>,
    cluster_lock: ClusterLock,
    period_ms: u64,
    batch_size: i64,
}

impl RunningInstanceScanner {
    pub fn new(
        manager: Arc<JobManager>,
        cluster_lock: ClusterLock,
        period_ms: u64,
        batch_size: i64,
    ) -> Self {
        Self {
            manager,
            cluster_lock,
            period_ms,
            batch_size,
        }
    }

    async fn process(&self) -> SchedResult<bool> {
        let now = Utc::now();
        let expire_before = now - Duration::milliseconds(self.period_ms as i64 * EXPIRE_PERIODS);
        let instances = self
            .manager
            .find_expired_instances(RunState::Running, expire_before, self.batch_size)
            .await?;
        if instances.is_empty() {
            return Ok(true);
        }
        let count = instances.len();
        for instance in instances {
            if let Err(e) = self.process_each(&instance).await {
                error!("处理过期RUNNING实例失败: {} | {}", instance.instance_id, e);
            }
        }
        Ok((count as i64) < self.batch_size)
    }

    async fn process_each(&self, instance: &SchedInstance) -> SchedResult<()> {
        let now = Utc::now();
        if !self.manager.renew_instance_update_time(instance, now).await? {
            // 已有其他副本在推进
            return Ok(());
        }

        if instance.is_workflow_lead() {
            // 主实例没有自己的 Task，按图状态重算
            return self.manager.heal_workflow_lead(instance.instance_id).await;
        }

        let tasks = self.manager.find_instance_tasks(instance.instance_id).await?;
        let snapshot = self.manager.discovered().await?;
        let waiting: Vec<&SchedTask> = tasks.iter().filter(|t| t.is_waiting()).collect();

        if !waiting.is_empty() {
            // 1、有未执行的 Task：未认领或认领者已死则重派
            let redispatching = self.manager.filter_dispatching_tasks(&tasks, &snapshot);
            if redispatching.is_empty() {
                return Ok(());
            }
            let Some(job) = self.manager.get_job(instance.job_id).await? else {
                error!("RUNNING实例找不到任务定义: {}", instance.job_id);
                return Ok(());
            };
            if !snapshot.has_workers(Some(&job.job_group)) {
                error!(
                    "RUNNING实例 {} 所在分组 {} 没有可用Worker",
                    instance.instance_id, job.job_group
                );
                return Ok(());
            }
            info!("RUNNING扫描器重派实例Task: {}", instance.instance_id);
            self.manager.redispatch(&job, instance, &redispatching);
        } else if tasks.iter().all(SchedTask::is_terminal) {
            // 2、Task 全部终态但实例未收口
            let Some(reloaded) = self.manager.get_instance(instance.instance_id).await? else {
                error!("RUNNING实例不存在: {}", instance.instance_id);
                return Ok(());
            };
            if reloaded.run_state.is_terminal() {
                return Ok(());
            }
            info!("RUNNING实例的Task已全部终态，收口: {}", instance.instance_id);
            self.manager.purge_instance(instance).await?;
        } else {
            // 3、还有执行中的 Task：认领的 Worker 全部死亡则清理
            if self.manager.has_alive_executing(&tasks, &snapshot) {
                return Ok(());
            }
            info!("RUNNING实例已无存活执行Worker，清理: {}", instance.instance_id);
            self.manager.purge_instance(instance).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl HeartbeatAction for RunningInstanceScanner {
    fn name(&self) -> &'static str {
        "RunningInstanceScanner"
    }

    async fn heartbeat(&self) -> SchedResult<bool> {
        let snapshot = self.manager.discovered().await?;
        if !snapshot.has_workers(None) {
            warn!("没有发现可用Worker，跳过RUNNING扫描");
            return Ok(true);
        }
        Ok(self
            .cluster_lock
            .try_locked(|| self.process())
            .await?
            .unwrap_or(true))
    }
}
