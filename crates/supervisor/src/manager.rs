use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use sqlx::{Connection, PgConnection, PgPool};
use tracing::{error, info, warn};

use flowjob_core::id::IdGenerator;
use flowjob_core::param::{
    ExecuteTaskParam, SplitJobParam, StartTaskParam, TaskWorkerParam, TerminateTaskParam,
};
use flowjob_core::{
    derive_run_state, CollisionStrategy, ExecuteState, JobType, Operation, RunState, RunType,
    SchedError, SchedInstance, SchedJob, SchedResult, SchedTask, TriggerType, Worker,
};
use flowjob_dispatch::{DispatchEventListener, TaskDispatcher};
use flowjob_registry::rpc::DiscoveryClient;
use flowjob_registry::{DiscoveredServers, ServerRegistry};

use crate::dao;
use crate::instance::{build_dispatch_params, TriggerInstance};
use crate::lock::InternLockPool;

/// Worker 拆分任务的 RPC 路径
const SPLIT_PATH: &str = "/worker/rpc/split";
/// 派发失败累计到该阈值后 Task 置为 DISPATCH_FAILED
const DISPATCH_FAILED_THRESHOLD: i32 = 3;

/// 事务提交后要执行的派发动作
pub type DispatchEffects = Vec<ExecuteTaskParam>;

/// 调度状态机
///
/// 所有实例/Task 的状态迁移都在「进程内分片锁 + 数据库行锁 + 单事务」
/// 的三重保护下执行，锁 key 统一为 `wnstance_id ?? instance_id`。
/// 派发 RPC 一律在事务提交之后发出，避免与 Worker 的 startTask 回调
/// 竞争未提交的 Task 行。
pub struct JobManager {
    pool: PgPool,
    id_gen: Arc<IdGenerator>,
    registry: Arc<dyn ServerRegistry>,
    worker_client: DiscoveryClient,
    lock_pool: InternLockPool,
    dispatcher: OnceLock<Arc<TaskDispatcher>>,
}

impl JobManager {
    pub fn new(
        pool: PgPool,
        id_gen: Arc<IdGenerator>,
        registry: Arc<dyn ServerRegistry>,
        worker_client: DiscoveryClient,
    ) -> Self {
        Self {
            pool,
            id_gen,
            registry,
            worker_client,
            lock_pool: InternLockPool::default(),
            dispatcher: OnceLock::new(),
        }
    }

    /// 注入派发器（与状态机互相引用，启动时回填）
    pub fn set_dispatcher(&self, dispatcher: Arc<TaskDispatcher>) {
        if self.dispatcher.set(dispatcher).is_err() {
            warn!("重复注入派发器");
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn generate_id(&self) -> i64 {
        self.id_gen.generate()
    }

    pub(crate) async fn discovered(&self) -> SchedResult<Arc<DiscoveredServers>> {
        self.registry.discovered().await
    }

    pub(crate) async fn intern_lock(&self, key: i64) -> tokio::sync::OwnedMutexGuard<()> {
        self.lock_pool.lock(key).await
    }

    /// 提交后异步派发
    pub(crate) fn dispatch_after_commit(&self, effects: DispatchEffects) {
        if effects.is_empty() {
            return;
        }
        match self.dispatcher.get() {
            Some(dispatcher) => {
                let dispatcher = Arc::clone(dispatcher);
                tokio::spawn(async move { dispatcher.dispatch(effects).await });
            }
            None => error!("派发器未注入，丢弃 {} 个派发动作", effects.len()),
        }
    }

    // ------------------------------------------------------------------查询

    pub async fn get_job(&self, job_id: i64) -> SchedResult<Option<SchedJob>> {
        let mut conn = self.pool.acquire().await?;
        dao::get_job(&mut conn, job_id).await
    }

    pub async fn get_instance(&self, instance_id: i64) -> SchedResult<Option<SchedInstance>> {
        let mut conn = self.pool.acquire().await?;
        dao::get_instance(&mut conn, instance_id).await
    }

    pub async fn get_task(&self, task_id: i64) -> SchedResult<Option<SchedTask>> {
        let mut conn = self.pool.acquire().await?;
        dao::get_task(&mut conn, task_id).await
    }

    pub async fn find_triggering_jobs(
        &self,
        max_next_trigger_time: i64,
        limit: i64,
    ) -> SchedResult<Vec<SchedJob>> {
        let mut conn = self.pool.acquire().await?;
        dao::find_triggering_jobs(&mut conn, max_next_trigger_time, limit).await
    }

    pub async fn find_expired_instances(
        &self,
        run_state: RunState,
        expire_before: DateTime<Utc>,
        limit: i64,
    ) -> SchedResult<Vec<SchedInstance>> {
        let mut conn = self.pool.acquire().await?;
        dao::find_expired_instances(&mut conn, run_state, expire_before, limit).await
    }

    pub async fn find_instance_tasks(&self, instance_id: i64) -> SchedResult<Vec<SchedTask>> {
        let mut conn = self.pool.acquire().await?;
        dao::find_tasks_by_instance(&mut conn, instance_id).await
    }

    /// 版本号 CAS 续期，并发推进防护
    pub async fn renew_instance_update_time(
        &self,
        instance: &SchedInstance,
        now: DateTime<Utc>,
    ) -> SchedResult<bool> {
        let mut conn = self.pool.acquire().await?;
        dao::renew_update_time(&mut conn, instance.instance_id, now, instance.version).await
    }

    // ------------------------------------------------------------------任务 CRUD

    /// 新增任务：校验触发配置并计算首次触发时间；DEPEND 类型落依赖边
    pub async fn add_job(&self, mut job: SchedJob) -> SchedResult<i64> {
        job.job_id = self.generate_id();
        let now = Utc::now();
        job.updated_at = now;
        job.created_at = now;
        job.trigger_type.validate_value(&job.trigger_value)?;

        let mut tx = self.pool.begin().await?;
        if job.trigger_type == TriggerType::Depend {
            self.bind_depend_parents(&mut tx, &job).await?;
            job.next_trigger_time = None;
        } else {
            job.next_trigger_time = job
                .trigger_type
                .compute_next_trigger_time(&job.trigger_value, now)?
                .map(|t| t.timestamp_millis());
            if job.next_trigger_time.is_none() {
                return Err(SchedError::InvalidTrigger {
                    trigger_type: format!("{:?}", job.trigger_type),
                    value: job.trigger_value.clone(),
                });
            }
        }
        dao::insert_job(&mut tx, &job).await?;
        tx.commit().await?;
        info!("新增任务成功: {} | {}", job.job_id, job.job_name);
        Ok(job.job_id)
    }

    pub async fn delete_job(&self, job_id: i64) -> SchedResult<()> {
        let mut tx = self.pool.begin().await?;
        if !dao::delete_job(&mut tx, job_id).await? {
            return Err(SchedError::job_not_found(job_id));
        }
        dao::delete_depends_by_parent(&mut tx, job_id).await?;
        dao::delete_depends_by_child(&mut tx, job_id).await?;
        tx.commit().await?;
        info!("删除任务成功: {}", job_id);
        Ok(())
    }

    async fn bind_depend_parents(&self, conn: &mut PgConnection, job: &SchedJob) -> SchedResult<()> {
        let parents = job.trigger_type.parse_depend_parents(&job.trigger_value)?;
        let mut depends = Vec::with_capacity(parents.len());
        for (index, parent_job_id) in parents.iter().enumerate() {
            let parent = dao::get_job(conn, *parent_job_id)
                .await?
                .ok_or_else(|| SchedError::job_not_found(*parent_job_id))?;
            if parent.job_group != job.job_group {
                return Err(SchedError::config(format!(
                    "依赖任务必须同分组: parent={} child={}",
                    parent.job_group, job.job_group
                )));
            }
            depends.push(flowjob_core::SchedDepend::new(
                *parent_job_id,
                job.job_id,
                index as i32 + 1,
            ));
        }
        dao::delete_depends_by_child(conn, job.job_id).await?;
        dao::batch_insert_depends(conn, &depends).await
    }

    // ------------------------------------------------------------------触发

    /// 手动触发
    pub async fn trigger_job_manually(&self, job_id: i64) -> SchedResult<()> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| SchedError::job_not_found(job_id))?;
        let now = Utc::now();
        let created = self
            .create_trigger_instance(&job, RunType::Manual, now.timestamp_millis(), now)
            .await?;

        let mut tx = self.pool.begin().await?;
        created.persist(&mut tx).await?;
        tx.commit().await?;
        self.dispatch_after_commit(created.dispatch_params(&job));
        Ok(())
    }

    /// 调度触发：冲突检查 → 推进 next_trigger_time（CAS）→ 创建实例 → 提交后派发
    ///
    /// CAS 失败说明另一个 Supervisor 已处理本次触发，静默放弃。
    pub async fn process_triggering_job(&self, job: &SchedJob, now: DateTime<Utc>) -> SchedResult<()> {
        let Some(current_trigger_time) = job.next_trigger_time else {
            return Ok(());
        };

        match self.check_collision(job).await? {
            CollisionOutcome::Proceed => {}
            CollisionOutcome::Skip => {
                info!("任务 {} 上一实例未结束，SERIAL 策略跳过本次触发", job.job_id);
                return Ok(());
            }
            CollisionOutcome::Discard => {
                info!("任务 {} 上一实例未结束，DISCARD 策略丢弃本次触发", job.job_id);
                self.advance_next_trigger_time(job, now).await?;
                return Ok(());
            }
        }

        let created = match self
            .create_trigger_instance(job, RunType::Schedule, current_trigger_time, now)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                // 创建失败（拆分失败/无可用Worker）也推进触发时间，避免热循环
                error!("任务 {} 创建实例失败，跳过本次触发: {}", job.job_id, e);
                self.advance_next_trigger_time(job, now).await?;
                return Ok(());
            }
        };

        let next = self.compute_subsequent_trigger_time(job, now)?;
        let mut tx = self.pool.begin().await?;
        if !dao::update_next_trigger_time(
            &mut tx,
            job.job_id,
            Some(current_trigger_time),
            next,
            Some(current_trigger_time),
        )
        .await?
        {
            // 另一副本已抢到本次触发
            return Ok(());
        }
        created.persist(&mut tx).await?;
        tx.commit().await?;
        self.dispatch_after_commit(created.dispatch_params(job));
        Ok(())
    }

    async fn advance_next_trigger_time(&self, job: &SchedJob, now: DateTime<Utc>) -> SchedResult<()> {
        let next = self.compute_subsequent_trigger_time(job, now)?;
        let mut conn = self.pool.acquire().await?;
        dao::update_next_trigger_time(&mut conn, job.job_id, job.next_trigger_time, next, job.next_trigger_time)
            .await?;
        Ok(())
    }

    fn compute_subsequent_trigger_time(
        &self,
        job: &SchedJob,
        now: DateTime<Utc>,
    ) -> SchedResult<Option<i64>> {
        // FIXED_DELAY 基于执行结束时间，本次实例终态后再重新武装
        if job.trigger_type == TriggerType::FixedDelay {
            return Ok(None);
        }
        let base = match job.trigger_type {
            TriggerType::FixedRate => job
                .next_trigger_time
                .and_then(|t| chrono::TimeZone::timestamp_millis_opt(&Utc, t).single())
                .unwrap_or(now),
            _ => now,
        };
        Ok(job
            .trigger_type
            .compute_next_trigger_time(&job.trigger_value, base.max(now - chrono::Duration::seconds(1)))?
            .map(|t| t.timestamp_millis()))
    }

    /// 冲突策略：检查上一触发的实例是否仍未终态
    async fn check_collision(&self, job: &SchedJob) -> SchedResult<CollisionOutcome> {
        if job.collision_strategy == CollisionStrategy::Concurrent {
            return Ok(CollisionOutcome::Proceed);
        }
        let Some(last_trigger_time) = job.last_trigger_time else {
            return Ok(CollisionOutcome::Proceed);
        };
        let mut conn = self.pool.acquire().await?;
        let last = dao::get_instance_by_trigger(&mut conn, job.job_id, last_trigger_time, RunType::Schedule)
            .await?;
        drop(conn);
        let Some(last) = last else {
            return Ok(CollisionOutcome::Proceed);
        };
        if last.run_state.is_terminal() {
            return Ok(CollisionOutcome::Proceed);
        }
        match job.collision_strategy {
            CollisionStrategy::Concurrent => Ok(CollisionOutcome::Proceed),
            CollisionStrategy::Serial => Ok(CollisionOutcome::Skip),
            CollisionStrategy::Override => {
                info!("任务 {} OVERRIDE 策略取消上一实例 {}", job.job_id, last.instance_id);
                self.cancel_instance(last.instance_id, last.wnstance_id, Operation::CollisionCancel)
                    .await?;
                Ok(CollisionOutcome::Proceed)
            }
            CollisionStrategy::Discard => Ok(CollisionOutcome::Discard),
        }
    }

    /// 按任务类型装配一次触发的实例/Task/工作流边
    pub(crate) async fn create_trigger_instance(
        &self,
        job: &SchedJob,
        run_type: RunType,
        trigger_time: i64,
        now: DateTime<Utc>,
    ) -> SchedResult<TriggerInstance> {
        match job.job_type {
            JobType::Normal => {
                let instance_id = self.generate_id();
                let instance =
                    SchedInstance::create(instance_id, job.job_id, run_type, trigger_time, 0, now);
                let tasks = self
                    .split_tasks(&SplitJobParam::from_job(job), job, instance_id, now)
                    .await?;
                Ok(TriggerInstance::Normal { instance, tasks })
            }
            JobType::Broadcast => {
                let snapshot = self.discovered().await?;
                let workers = snapshot.workers_of_group(&job.job_group);
                if workers.is_empty() {
                    return Err(SchedError::conflict(format!(
                        "广播任务 {} 所在分组没有存活Worker",
                        job.job_id
                    )));
                }
                let instance_id = self.generate_id();
                let instance =
                    SchedInstance::create(instance_id, job.job_id, run_type, trigger_time, 0, now);
                let task_count = workers.len() as i32;
                let tasks = workers
                    .iter()
                    .enumerate()
                    .map(|(index, worker)| {
                        SchedTask::create(
                            self.generate_id(),
                            instance_id,
                            index as i32 + 1,
                            task_count,
                            job.job_param.clone(),
                            Some(worker.serialize()),
                            now,
                        )
                    })
                    .collect();
                Ok(TriggerInstance::Broadcast { instance, tasks })
            }
            JobType::Workflow => self.create_workflow_trigger(job, run_type, trigger_time, now).await,
        }
    }

    /// 经 Worker 的 split 接口拆分任务
    pub(crate) async fn split_tasks(
        &self,
        param: &SplitJobParam,
        job: &SchedJob,
        instance_id: i64,
        now: DateTime<Utc>,
    ) -> SchedResult<Vec<SchedTask>> {
        let task_params: Vec<String> = self
            .worker_client
            .post_worker(&job.job_group, SPLIT_PATH, param)
            .await
            .map_err(|e| SchedError::SplitFailed(format!("{}: {e}", job.job_id)))?;
        if task_params.is_empty() {
            return Err(SchedError::SplitFailed(format!("任务 {} 拆分结果为空", job.job_id)));
        }
        let task_count = task_params.len() as i32;
        Ok(task_params
            .into_iter()
            .enumerate()
            .map(|(index, task_param)| {
                SchedTask::create(
                    self.generate_id(),
                    instance_id,
                    index as i32 + 1,
                    task_count,
                    task_param,
                    None,
                    now,
                )
            })
            .collect())
    }

    // ------------------------------------------------------------------Worker 回调

    /// Worker 开始执行回调
    ///
    /// 实例与 Task 的两个 CAS 必须同时成立：实例仍可运行（WAITING/RUNNING，
    /// WAITING 时顺带拉起），Task 仍为 WAITING。Task CAS 落空时回滚实例拉起。
    pub async fn start_task(&self, param: StartTaskParam) -> SchedResult<bool> {
        let now = Utc::now();
        let (_key, _guard, mut tx, instance) =
            self.lock_instance_tx(param.instance_id, None).await?;
        let Some(instance) = instance else {
            return Err(SchedError::instance_not_found(param.instance_id));
        };

        if !RunState::PAUSABLE.contains(&instance.run_state) {
            return Ok(false);
        }

        if instance.run_state == RunState::Waiting {
            dao::start_instance(&mut tx, instance.instance_id, now).await?;
        }
        if !dao::start_task(&mut tx, param.task_id, &param.worker, now).await? {
            // Task 已被并发迁移，连同实例拉起一起回滚
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Worker 上报终态回调
    pub async fn terminate_task(&self, param: TerminateTaskParam) -> SchedResult<bool> {
        if !param.to_state.is_terminal() && param.to_state != ExecuteState::Paused {
            return Err(SchedError::internal(format!(
                "终态上报的目标状态无效: {:?}",
                param.to_state
            )));
        }
        let now = Utc::now();
        let mut effects = DispatchEffects::new();
        let (_key, _guard, mut tx, instance) = self
            .lock_instance_tx(param.instance_id, param.wnstance_id)
            .await?;
        let Some(instance) = instance else {
            return Err(SchedError::instance_not_found(param.instance_id));
        };
        if instance.is_workflow_lead() {
            return Err(SchedError::conflict(format!(
                "不能直接终止工作流主实例: {}",
                instance.instance_id
            )));
        }
        if instance.run_state.is_terminal() {
            return Ok(false);
        }

        let end_time = param.to_state.is_terminal().then_some(now);
        if !dao::terminate_task(
            &mut tx,
            param.task_id,
            param.to_state,
            ExecuteState::Executing,
            end_time,
            param.error_msg.as_deref(),
        )
        .await?
        {
            // 常见于 Worker 超时重试导致的重复上报
            warn!("终态上报冲突: task={} to={:?}", param.task_id, param.to_state);
            return Ok(false);
        }

        let tasks = dao::find_tasks_by_instance(&mut tx, instance.instance_id).await?;
        if let Some((to_state, end_time)) = derive_run_state(&tasks, now) {
            if dao::terminate_instance(
                &mut tx,
                instance.instance_id,
                to_state,
                &RunState::TERMINABLE,
                end_time,
            )
            .await?
            {
                let mut terminated = instance.clone();
                terminated.run_state = to_state;
                if param.operation == Operation::Trigger {
                    self.after_terminate_task(&mut tx, &terminated, now, &mut effects)
                        .await?;
                } else if terminated.is_workflow_node() {
                    // 带外暂停/取消路径：只同步边与主实例状态，不做级联
                    self.update_workflow_edge_state(&mut tx, &terminated, to_state, &RunState::TERMINABLE)
                        .await?;
                    if let Some(wnstance_id) = terminated.wnstance_id {
                        let lead = dao::get_instance(&mut tx, wnstance_id)
                            .await?
                            .ok_or_else(|| SchedError::instance_not_found(wnstance_id))?;
                        self.update_workflow_lead_state(&mut tx, &lead).await?;
                    }
                }
            }
        }
        tx.commit().await?;
        self.dispatch_after_commit(effects);
        Ok(true)
    }

    // ------------------------------------------------------------------实例操作

    /// 暂停实例
    pub async fn pause_instance(&self, instance_id: i64, wnstance_id: Option<i64>) -> SchedResult<bool> {
        let now = Utc::now();
        let snapshot = self.discovered().await?;
        let mut effects = DispatchEffects::new();
        let (_key, _guard, mut tx, instance) = self.lock_instance_tx(instance_id, wnstance_id).await?;
        let Some(instance) = instance else {
            return Err(SchedError::instance_not_found(instance_id));
        };
        if !RunState::PAUSABLE.contains(&instance.run_state) {
            return Ok(false);
        }

        if instance.is_workflow() {
            if !instance.is_workflow_lead() {
                return Err(SchedError::conflict(format!(
                    "不能单独暂停工作流节点实例: {instance_id}"
                )));
            }
            dao::update_workflow_state(
                &mut tx,
                instance.instance_id,
                None,
                RunState::Paused,
                None,
                &[RunState::Waiting],
                None,
            )
            .await?;
            let nodes = dao::find_workflow_node_instances(&mut tx, instance.instance_id).await?;
            for node in nodes {
                if RunState::PAUSABLE.contains(&node.run_state) {
                    self.pause_instance_core(&mut tx, &node, &snapshot, now, &mut effects)
                        .await?;
                }
            }
            self.update_workflow_lead_state(&mut tx, &instance).await?;
        } else {
            self.pause_instance_core(&mut tx, &instance, &snapshot, now, &mut effects)
                .await?;
        }
        tx.commit().await?;
        self.dispatch_after_commit(effects);
        Ok(true)
    }

    async fn pause_instance_core(
        &self,
        tx: &mut PgConnection,
        instance: &SchedInstance,
        snapshot: &DiscoveredServers,
        now: DateTime<Utc>,
        effects: &mut DispatchEffects,
    ) -> SchedResult<()> {
        // 1、未派发的 Task 直接置 PAUSED
        dao::update_tasks_state_by_instance(
            tx,
            instance.instance_id,
            ExecuteState::Paused,
            &[ExecuteState::Waiting],
            None,
        )
        .await?;

        // 2、对存活 Worker 上执行中的 Task 发带外暂停
        let executing = self
            .load_executing_tasks(tx, instance, Operation::Pause, snapshot, now)
            .await?;
        if executing.is_empty() {
            let tasks = dao::find_tasks_by_instance(tx, instance.instance_id).await?;
            let (to_state, end_time) = derive_run_state(&tasks, now).ok_or_else(|| {
                SchedError::conflict(format!("暂停实例失败: {}", instance.instance_id))
            })?;
            if !dao::terminate_instance(tx, instance.instance_id, to_state, &RunState::PAUSABLE, end_time)
                .await?
            {
                return Err(SchedError::conflict(format!(
                    "暂停实例状态迁移失败: {} -> {:?}",
                    instance.instance_id, to_state
                )));
            }
            if instance.is_workflow_node() {
                self.update_workflow_edge_state(tx, instance, to_state, &RunState::PAUSABLE)
                    .await?;
            }
        } else {
            effects.extend(executing);
        }
        Ok(())
    }

    /// 取消实例；ops 决定 Task 的终态失败码
    pub async fn cancel_instance(
        &self,
        instance_id: i64,
        wnstance_id: Option<i64>,
        ops: Operation,
    ) -> SchedResult<bool> {
        let to_state = ops
            .target_execute_state()
            .filter(|s| s.is_failure())
            .ok_or_else(|| SchedError::internal(format!("取消操作无效: {ops:?}")))?;
        let now = Utc::now();
        let snapshot = self.discovered().await?;
        let mut effects = DispatchEffects::new();
        let (_key, _guard, mut tx, instance) = self.lock_instance_tx(instance_id, wnstance_id).await?;
        let Some(instance) = instance else {
            return Err(SchedError::instance_not_found(instance_id));
        };
        if instance.run_state.is_terminal() {
            return Ok(false);
        }

        if instance.is_workflow() {
            if !instance.is_workflow_lead() {
                return Err(SchedError::conflict(format!(
                    "不能单独取消工作流节点实例: {instance_id}"
                )));
            }
            dao::update_workflow_state(
                &mut tx,
                instance.instance_id,
                None,
                RunState::Canceled,
                None,
                &[RunState::Waiting],
                None,
            )
            .await?;
            let nodes = dao::find_workflow_node_instances(&mut tx, instance.instance_id).await?;
            for node in nodes {
                if !node.run_state.is_terminal() {
                    self.cancel_instance_core(&mut tx, &node, ops, to_state, &snapshot, now, &mut effects)
                        .await?;
                }
            }
            self.update_workflow_lead_state(&mut tx, &instance).await?;
        } else {
            self.cancel_instance_core(&mut tx, &instance, ops, to_state, &snapshot, now, &mut effects)
                .await?;
        }
        tx.commit().await?;
        self.dispatch_after_commit(effects);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn cancel_instance_core(
        &self,
        tx: &mut PgConnection,
        instance: &SchedInstance,
        ops: Operation,
        to_state: ExecuteState,
        snapshot: &DiscoveredServers,
        now: DateTime<Utc>,
        effects: &mut DispatchEffects,
    ) -> SchedResult<()> {
        // 1、WAITING/PAUSED 的 Task 直接取消
        dao::update_tasks_state_by_instance(
            tx,
            instance.instance_id,
            to_state,
            &ExecuteState::EXECUTABLE,
            Some(now),
        )
        .await?;

        // 2、对存活 Worker 上执行中的 Task 发带外取消
        let executing = self
            .load_executing_tasks(tx, instance, ops, snapshot, now)
            .await?;
        if executing.is_empty() {
            let tasks = dao::find_tasks_by_instance(tx, instance.instance_id).await?;
            let derived = derive_run_state(&tasks, now).ok_or_else(|| {
                SchedError::conflict(format!("取消实例失败: {}", instance.instance_id))
            })?;
            // 全部为暂停态时强制取消
            let (run_state, end_time) = if derived.0 == RunState::Paused {
                (RunState::Canceled, Some(now))
            } else {
                derived
            };
            if !dao::terminate_instance(tx, instance.instance_id, run_state, &RunState::TERMINABLE, end_time)
                .await?
            {
                return Err(SchedError::conflict(format!(
                    "取消实例状态迁移失败: {} -> {:?}",
                    instance.instance_id, run_state
                )));
            }
            if instance.is_workflow_node() {
                self.update_workflow_edge_state(tx, instance, run_state, &RunState::TERMINABLE)
                    .await?;
            }
        } else {
            effects.extend(executing);
        }
        Ok(())
    }

    /// 恢复实例：PAUSED → WAITING，恢复后的 Task 重新派发（重新路由）
    pub async fn resume_instance(&self, instance_id: i64) -> SchedResult<bool> {
        let wnstance_id = {
            let mut conn = self.pool.acquire().await?;
            dao::get_wnstance_id(&mut conn, instance_id).await?
        };
        let now = Utc::now();
        let mut effects = DispatchEffects::new();
        let (_key, _guard, mut tx, instance) = self.lock_instance_tx(instance_id, wnstance_id).await?;
        let Some(instance) = instance else {
            return Err(SchedError::instance_not_found(instance_id));
        };
        if instance.run_state != RunState::Paused {
            return Ok(false);
        }

        if instance.is_workflow() {
            if !instance.is_workflow_lead() {
                return Err(SchedError::conflict(format!(
                    "不能单独恢复工作流节点实例: {instance_id}"
                )));
            }
            if !dao::update_instance_state(&mut tx, instance_id, RunState::Running, RunState::Paused)
                .await?
            {
                return Err(SchedError::conflict(format!("恢复工作流主实例失败: {instance_id}")));
            }
            dao::resume_workflow_waiting(&mut tx, instance_id).await?;
            let nodes = dao::find_workflow_node_instances(&mut tx, instance_id).await?;
            for node in nodes {
                if node.run_state == RunState::Paused {
                    self.resume_instance_core(&mut tx, &node, &mut effects).await?;
                    self.update_workflow_edge_state(&mut tx, &node, RunState::Running, &[RunState::Paused])
                        .await?;
                }
            }
            // 前驱已终态的等待节点重新建出来
            let lead = dao::get_instance(&mut tx, instance_id)
                .await?
                .ok_or_else(|| SchedError::instance_not_found(instance_id))?;
            let workflows = dao::find_workflows(&mut tx, instance_id).await?;
            let candidates: Vec<flowjob_core::SchedWorkflow> = workflows.clone();
            self.create_workflow_nodes(&mut tx, &lead, &workflows, &candidates, now, &mut effects)
                .await?;
        } else {
            self.resume_instance_core(&mut tx, &instance, &mut effects).await?;
        }
        tx.commit().await?;
        self.dispatch_after_commit(effects);
        Ok(true)
    }

    async fn resume_instance_core(
        &self,
        tx: &mut PgConnection,
        instance: &SchedInstance,
        effects: &mut DispatchEffects,
    ) -> SchedResult<()> {
        if !dao::update_instance_state(tx, instance.instance_id, RunState::Waiting, RunState::Paused)
            .await?
        {
            return Err(SchedError::conflict(format!(
                "恢复实例失败: {}",
                instance.instance_id
            )));
        }
        dao::update_tasks_state_by_instance(
            tx,
            instance.instance_id,
            ExecuteState::Waiting,
            &[ExecuteState::Paused],
            None,
        )
        .await?;
        let job = dao::get_job(tx, instance.job_id)
            .await?
            .ok_or_else(|| SchedError::job_not_found(instance.job_id))?;
        let tasks = dao::find_tasks_by_instance(tx, instance.instance_id).await?;
        let waiting: Vec<SchedTask> = tasks.into_iter().filter(SchedTask::is_waiting).collect();
        effects.extend(build_dispatch_params(&job, instance, &waiting));
        Ok(())
    }

    /// 清理僵尸实例：没有 WAITING Task 且没有存活的执行中 Task 才允许
    pub async fn purge_instance(&self, inst: &SchedInstance) -> SchedResult<bool> {
        let now = Utc::now();
        let snapshot = self.discovered().await?;
        let mut effects = DispatchEffects::new();
        let (_key, _guard, mut tx, instance) = self
            .lock_instance_tx(inst.instance_id, inst.wnstance_id)
            .await?;
        let Some(instance) = instance else {
            return Err(SchedError::instance_not_found(inst.instance_id));
        };
        if instance.is_workflow_lead() {
            return Err(SchedError::conflict(format!(
                "不能清理工作流主实例: {}",
                instance.instance_id
            )));
        }
        if !RunState::PAUSABLE.contains(&instance.run_state) {
            return Ok(false);
        }

        let tasks = dao::find_tasks_by_instance(&mut tx, instance.instance_id).await?;
        if tasks.iter().any(SchedTask::is_waiting) {
            warn!("清理失败，实例 {} 还有WAITING Task", instance.instance_id);
            return Ok(false);
        }
        if self.has_alive_executing(&tasks, &snapshot) {
            warn!("清理失败，实例 {} 还有存活的执行中 Task", instance.instance_id);
            return Ok(false);
        }

        // 残余的暂停/死亡执行中 Task 都按超时终结
        dao::update_tasks_state_by_instance(
            &mut tx,
            instance.instance_id,
            ExecuteState::ExecuteTimeout,
            &ExecuteState::PAUSABLE,
            Some(now),
        )
        .await?;

        let tasks = dao::find_tasks_by_instance(&mut tx, instance.instance_id).await?;
        let (to_state, end_time) = match derive_run_state(&tasks, now) {
            Some((RunState::Paused, _)) | None => (RunState::Canceled, Some(now)),
            Some(derived) => derived,
        };
        if !dao::terminate_instance(&mut tx, instance.instance_id, to_state, &RunState::TERMINABLE, end_time)
            .await?
        {
            return Ok(false);
        }
        let mut terminated = instance.clone();
        terminated.run_state = to_state;
        self.after_terminate_task(&mut tx, &terminated, now, &mut effects)
            .await?;
        tx.commit().await?;
        self.dispatch_after_commit(effects);
        warn!("清理实例 {} 至状态 {:?}", instance.instance_id, to_state);
        Ok(true)
    }

    /// 数据异常兜底：任务定义丢失时把实例终结为 CANCELED
    pub async fn cancel_invalid_instance(&self, instance_id: i64, reason: &str) -> SchedResult<bool> {
        let now = Utc::now();
        let wnstance_id = {
            let mut conn = self.pool.acquire().await?;
            dao::get_wnstance_id(&mut conn, instance_id).await?
        };
        let (_key, _guard, mut tx, instance) = self.lock_instance_tx(instance_id, wnstance_id).await?;
        let Some(instance) = instance else {
            return Ok(false);
        };
        if instance.run_state.is_terminal() {
            return Ok(false);
        }
        let tasks = dao::find_tasks_by_instance(&mut tx, instance.instance_id).await?;
        for task in tasks.iter().filter(|t| !t.is_terminal()) {
            dao::terminate_task(
                &mut tx,
                task.task_id,
                ExecuteState::ExecuteAborted,
                task.execute_state,
                Some(now),
                Some(reason),
            )
            .await?;
        }
        let terminated = dao::terminate_instance(
            &mut tx,
            instance.instance_id,
            RunState::Canceled,
            &RunState::TERMINABLE,
            Some(now),
        )
        .await?;
        tx.commit().await?;
        error!("实例 {} 数据异常，已终结: {}", instance_id, reason);
        Ok(terminated)
    }

    /// 强制修改实例状态（非工作流），恢复为 WAITING 时重新派发
    pub async fn change_instance_state(
        &self,
        instance_id: i64,
        to_execute_state: ExecuteState,
    ) -> SchedResult<()> {
        if to_execute_state == ExecuteState::Executing {
            return Err(SchedError::conflict("不能强制修改为EXECUTING".to_string()));
        }
        let to_run_state = to_execute_state.run_state();
        let mut effects = DispatchEffects::new();
        let (_key, _guard, mut tx, instance) = self.lock_instance_tx(instance_id, None).await?;
        let Some(instance) = instance else {
            return Err(SchedError::instance_not_found(instance_id));
        };
        if instance.is_workflow() {
            return Err(SchedError::conflict(format!(
                "不支持强制修改工作流实例状态: {instance_id}"
            )));
        }

        let instance_changed =
            dao::update_instance_state(&mut tx, instance_id, to_run_state, instance.run_state).await?;
        let task_changed = dao::update_tasks_state_by_instance(
            &mut tx,
            instance_id,
            to_execute_state,
            &all_execute_states_except(to_execute_state),
            to_execute_state.is_terminal().then(Utc::now),
        )
        .await?;
        if !instance_changed && task_changed == 0 {
            return Err(SchedError::conflict(format!("强制修改实例状态无效: {instance_id}")));
        }

        if to_execute_state == ExecuteState::Waiting {
            let job = dao::get_job(&mut tx, instance.job_id)
                .await?
                .ok_or_else(|| SchedError::job_not_found(instance.job_id))?;
            let tasks = dao::find_tasks_by_instance(&mut tx, instance_id).await?;
            let waiting: Vec<SchedTask> = tasks.into_iter().filter(SchedTask::is_waiting).collect();
            effects.extend(build_dispatch_params(&job, &instance, &waiting));
        }
        tx.commit().await?;
        self.dispatch_after_commit(effects);
        info!("强制修改实例状态成功: {} | {:?}", instance_id, to_execute_state);
        Ok(())
    }

    /// 删除终态实例；工作流主实例级联删除节点与边
    pub async fn delete_instance(&self, instance_id: i64) -> SchedResult<()> {
        let wnstance_id = {
            let mut conn = self.pool.acquire().await?;
            dao::get_wnstance_id(&mut conn, instance_id).await?
        };
        let (_key, _guard, mut tx, instance) = self.lock_instance_tx(instance_id, wnstance_id).await?;
        let Some(instance) = instance else {
            return Err(SchedError::instance_not_found(instance_id));
        };
        if !instance.run_state.is_terminal() {
            return Err(SchedError::conflict(format!("只能删除终态实例: {instance_id}")));
        }

        if instance.is_workflow() {
            if !instance.is_workflow_lead() {
                return Err(SchedError::conflict(format!(
                    "不能单独删除工作流节点实例: {instance_id}"
                )));
            }
            let nodes = dao::find_workflow_node_instances(&mut tx, instance.instance_id).await?;
            for node in &nodes {
                if !node.run_state.is_terminal() {
                    return Err(SchedError::conflict(format!(
                        "工作流节点未终态，不能删除: {}",
                        node.instance_id
                    )));
                }
            }
            for node in &nodes {
                dao::delete_instance(&mut tx, node.instance_id).await?;
                dao::delete_tasks_by_instance(&mut tx, node.instance_id).await?;
            }
            dao::delete_workflows(&mut tx, instance.instance_id).await?;
            dao::delete_instance(&mut tx, instance.instance_id).await?;
        } else {
            dao::delete_instance(&mut tx, instance.instance_id).await?;
            dao::delete_tasks_by_instance(&mut tx, instance.instance_id).await?;
        }
        tx.commit().await?;
        info!("删除实例成功: {}", instance_id);
        Ok(())
    }

    /// Worker 上报检查点
    pub async fn checkpoint_task(&self, task_id: i64, execute_snapshot: &str) -> SchedResult<bool> {
        let mut conn = self.pool.acquire().await?;
        dao::checkpoint_task(&mut conn, task_id, execute_snapshot).await
    }

    /// 批量更新 Task 的 worker 绑定；按 task_id 排序避免死锁
    pub async fn update_task_worker(&self, mut params: Vec<TaskWorkerParam>) -> SchedResult<()> {
        if params.is_empty() {
            return Ok(());
        }
        params.sort_by_key(|p| p.task_id);
        let mut conn = self.pool.acquire().await?;
        for param in &params {
            dao::update_task_worker(&mut conn, param.task_id, param.worker.as_deref()).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------扫描器支撑

    /// WAITING 且未被存活 Worker 认领的 Task（待重派集合）
    pub fn filter_dispatching_tasks(
        &self,
        tasks: &[SchedTask],
        snapshot: &DiscoveredServers,
    ) -> Vec<SchedTask> {
        tasks
            .iter()
            .filter(|t| t.is_waiting())
            .filter(|t| match t.assigned_worker() {
                Some(worker) => !snapshot.is_alive_worker(&worker),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn has_alive_executing(&self, tasks: &[SchedTask], snapshot: &DiscoveredServers) -> bool {
        tasks
            .iter()
            .filter(|t| t.is_executing())
            .any(|t| matches!(t.assigned_worker(), Some(w) if snapshot.is_alive_worker(&w)))
    }

    /// 扫描器重派入口（不在事务内，直接走派发器）
    pub fn redispatch(&self, job: &SchedJob, instance: &SchedInstance, tasks: &[SchedTask]) {
        self.dispatch_after_commit(build_dispatch_params(job, instance, tasks));
    }

    // ------------------------------------------------------------------内部工具

    /// 进程内分片锁 + 事务 + 行锁，返回目标实例（锁行是 wnstance ?? instance）
    async fn lock_instance_tx(
        &self,
        instance_id: i64,
        wnstance_id: Option<i64>,
    ) -> SchedResult<(
        i64,
        tokio::sync::OwnedMutexGuard<()>,
        sqlx::Transaction<'static, sqlx::Postgres>,
        Option<SchedInstance>,
    )> {
        let lock_key = wnstance_id.unwrap_or(instance_id);
        let guard = self.lock_pool.lock(lock_key).await;
        let mut tx = self.pool.begin().await?;
        let locked = dao::lock_instance(&mut tx, lock_key).await?;
        let instance = match (wnstance_id, locked) {
            (_, None) => None,
            (None, Some(locked)) => Some(locked),
            (Some(w), Some(locked)) => {
                if instance_id == w {
                    Some(locked)
                } else {
                    let node = dao::get_instance(&mut tx, instance_id).await?;
                    if let Some(node) = &node {
                        if node.wnstance_id != Some(w) {
                            return Err(SchedError::conflict(format!(
                                "实例 {instance_id} 不属于工作流 {w}"
                            )));
                        }
                    }
                    node
                }
            }
        };
        Ok((lock_key, guard, tx, instance))
    }

    /// 加载执行中的 Task：活 Worker 的转成带外 RPC 参数；死 Worker 的就地终结
    pub(crate) async fn load_executing_tasks(
        &self,
        tx: &mut PgConnection,
        instance: &SchedInstance,
        ops: Operation,
        snapshot: &DiscoveredServers,
        now: DateTime<Utc>,
    ) -> SchedResult<Vec<ExecuteTaskParam>> {
        let to_state = ops
            .target_execute_state()
            .ok_or_else(|| SchedError::internal(format!("操作缺少目标状态: {ops:?}")))?;
        let job = dao::get_job(tx, instance.job_id)
            .await?
            .ok_or_else(|| SchedError::job_not_found(instance.job_id))?;
        let mut params = Vec::new();
        for task in dao::find_tasks_by_instance(tx, instance.instance_id).await? {
            if !task.is_executing() {
                continue;
            }
            let worker = task.assigned_worker();
            let alive = matches!(&worker, Some(w) if snapshot.is_alive_worker(w));
            if alive {
                params.push(ExecuteTaskParam::from_job(
                    &job,
                    ops,
                    task.task_id,
                    instance.instance_id,
                    instance.wnstance_id,
                    0,
                    worker,
                ));
            } else {
                // Worker 已死，直接在库里终结
                let end_time = to_state.is_terminal().then_some(now);
                if dao::terminate_task(tx, task.task_id, to_state, ExecuteState::Executing, end_time, None)
                    .await?
                {
                    info!("死亡Worker上的Task已就地终结: {}", task.task_id);
                } else {
                    error!("死亡Worker上的Task终结失败: {}", task.task_id);
                }
            }
        }
        Ok(params)
    }
}

enum CollisionOutcome {
    Proceed,
    Skip,
    Discard,
}

fn all_execute_states_except(excluded: ExecuteState) -> Vec<ExecuteState> {
    [
        ExecuteState::Waiting,
        ExecuteState::Executing,
        ExecuteState::Paused,
        ExecuteState::Completed,
        ExecuteState::DispatchFailed,
        ExecuteState::InitException,
        ExecuteState::ExecuteFailed,
        ExecuteState::ExecuteException,
        ExecuteState::ExecuteTimeout,
        ExecuteState::ExecuteCollision,
        ExecuteState::BroadcastAborted,
        ExecuteState::ExecuteAborted,
        ExecuteState::ShutdownCanceled,
        ExecuteState::ManualCanceled,
        ExecuteState::WaitingCanceled,
    ]
    .into_iter()
    .filter(|s| *s != excluded)
    .collect()
}

#[async_trait::async_trait]
impl DispatchEventListener for JobManager {
    async fn on_dispatched(&self, task_id: i64, worker: &Worker) -> SchedResult<()> {
        let mut conn = self.pool.acquire().await?;
        // 认领绑定，Task 已离开 WAITING 时静默忽略
        dao::update_task_worker(&mut conn, task_id, Some(&worker.serialize())).await?;
        Ok(())
    }

    async fn on_dispatch_failed(&self, task_id: i64, instance_id: i64) -> SchedResult<()> {
        let mut conn = self.pool.acquire().await?;
        let count = dao::incr_dispatch_failed(&mut conn, task_id).await?;
        if count < DISPATCH_FAILED_THRESHOLD {
            warn!("task {} 派发失败 {}/{} 次，等待扫描器重派", task_id, count, DISPATCH_FAILED_THRESHOLD);
            return Ok(());
        }
        if dao::terminate_task(
            &mut conn,
            task_id,
            ExecuteState::DispatchFailed,
            ExecuteState::Waiting,
            Some(Utc::now()),
            Some("派发失败次数超限"),
        )
        .await?
        {
            error!("task {} 派发失败超限，已置为 DISPATCH_FAILED (实例 {})", task_id, instance_id);
        }
        Ok(())
    }
}

// 依赖级联的嵌套事务需要 Connection::begin
pub(crate) async fn begin_nested<'a>(
    conn: &'a mut PgConnection,
) -> SchedResult<sqlx::Transaction<'a, sqlx::Postgres>> {
    Ok(conn.begin().await?)
}
