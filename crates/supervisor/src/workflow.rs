//! 工作流推进与终态级联
//!
//! 节点实例到达终态后：回写边状态 → 折叠 End 状态 → 主实例终态判定，
//! 否则创建前驱已全部成功终态的后继节点。CANCELED 短路整个图。
//! 终态级联：CANCELED 走重试，FINISHED 走依赖触发（工作流节点走图推进）。

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgConnection;
use tracing::{error, info, warn};

use flowjob_core::dag::{is_end, parse_dag, WorkflowGraph, END_NODE, START_NODE};
use flowjob_core::param::SplitJobParam;
use flowjob_core::{
    RetryType, RunState, RunType, SchedError, SchedInstance, SchedJob, SchedResult, SchedTask,
    SchedWorkflow, TriggerType,
};

use crate::dao;
use crate::instance::{build_dispatch_params, TriggerInstance};
use crate::manager::{begin_nested, DispatchEffects, JobManager};

impl JobManager {
    /// WORKFLOW 类型的触发装配：主实例 + 全量边 + Start 后继节点
    pub(crate) async fn create_workflow_trigger(
        &self,
        job: &SchedJob,
        run_type: RunType,
        trigger_time: i64,
        now: DateTime<Utc>,
    ) -> SchedResult<TriggerInstance> {
        // 工作流任务的 executor 字段承载 DAG 表达式，节点名即节点执行器
        let edges = parse_dag(&job.executor)?;
        let wnstance_id = self.generate_id();
        let mut lead =
            SchedInstance::create(wnstance_id, job.job_id, run_type, trigger_time, 0, now);
        lead.wnstance_id = Some(wnstance_id);
        lead.rnstance_id = Some(wnstance_id);
        lead.run_state = RunState::Running;
        lead.run_start_time = Some(now);

        let mut workflows: Vec<SchedWorkflow> = edges
            .iter()
            .enumerate()
            .map(|(index, edge)| {
                SchedWorkflow::new(wnstance_id, edge.source.clone(), edge.target.clone(), index as i32 + 1)
            })
            .collect();

        // Start 的直接后继先行创建
        let mut nodes = Vec::new();
        for index in 0..workflows.len() {
            if workflows[index].pre_node != START_NODE {
                continue;
            }
            let cur_node = workflows[index].cur_node.clone();
            let sequence = workflows[index].sequence;
            let (instance, tasks) = self
                .build_workflow_node_instance(job, &lead, &cur_node, sequence, now)
                .await?;
            workflows[index].run_state = RunState::Running;
            workflows[index].instance_id = Some(instance.instance_id);
            nodes.push((instance, tasks));
        }
        if nodes.is_empty() {
            return Err(SchedError::InvalidDag(format!(
                "工作流没有起始节点: {}",
                job.job_id
            )));
        }
        Ok(TriggerInstance::Workflow {
            lead,
            workflows,
            nodes,
        })
    }

    async fn build_workflow_node_instance(
        &self,
        job: &SchedJob,
        lead: &SchedInstance,
        cur_node: &str,
        sequence: i32,
        now: DateTime<Utc>,
    ) -> SchedResult<(SchedInstance, Vec<SchedTask>)> {
        let instance_id = self.generate_id();
        let split = SplitJobParam::from_workflow_node(job, cur_node);
        let tasks = self.split_tasks(&split, job, instance_id, now).await?;
        let mut instance = SchedInstance::create(
            instance_id,
            job.job_id,
            lead.run_type,
            // 错开触发时间，规避 (job_id, trigger_time, run_type) 唯一约束
            lead.trigger_time + i64::from(sequence),
            0,
            now,
        );
        instance.wnstance_id = lead.wnstance_id;
        instance.rnstance_id = Some(lead.instance_id);
        instance.attach = Some(json!({ "cur_node": cur_node }).to_string());
        Ok((instance, tasks))
    }

    // ------------------------------------------------------------------终态级联

    /// 实例到达终态后的级联入口
    pub(crate) async fn after_terminate_task(
        &self,
        tx: &mut PgConnection,
        instance: &SchedInstance,
        now: DateTime<Utc>,
        effects: &mut DispatchEffects,
    ) -> SchedResult<()> {
        self.rearm_fixed_delay(tx, instance, now).await?;
        match instance.run_state {
            RunState::Canceled => self.retry_job(tx, instance, now, effects).await,
            RunState::Finished => {
                if instance.is_workflow_node() {
                    self.process_workflow(tx, instance, now, effects).await
                } else {
                    self.depend_job(tx, instance, now, effects).await
                }
            }
            other => {
                error!("未知的终态级联状态: {:?} | {}", other, instance.instance_id);
                Ok(())
            }
        }
    }

    /// FIXED_DELAY 任务在实例终态后以结束时间为基准重新武装下一次触发
    async fn rearm_fixed_delay(
        &self,
        tx: &mut PgConnection,
        instance: &SchedInstance,
        now: DateTime<Utc>,
    ) -> SchedResult<()> {
        let Some(job) = dao::get_job(tx, instance.job_id).await? else {
            return Ok(());
        };
        if job.trigger_type != TriggerType::FixedDelay
            || !job.is_enabled()
            || job.next_trigger_time.is_some()
        {
            return Ok(());
        }
        if let Some(next) = job
            .trigger_type
            .compute_next_trigger_time(&job.trigger_value, now)?
        {
            dao::update_next_trigger_time(
                tx,
                job.job_id,
                None,
                Some(next.timestamp_millis()),
                job.last_trigger_time,
            )
            .await?;
        }
        Ok(())
    }

    /// 重试级联：CANCELED 实例按 retry_type 生成重试实例
    async fn retry_job(
        &self,
        tx: &mut PgConnection,
        prev: &SchedInstance,
        now: DateTime<Utc>,
        effects: &mut DispatchEffects,
    ) -> SchedResult<()> {
        let Some(job) = dao::get_job(tx, prev.job_id).await? else {
            error!("重试时任务定义缺失: {}", prev.job_id);
            return self.process_workflow(tx, prev, now, effects).await;
        };

        if job.retry_type == RetryType::None || job.retry_count < 1 {
            return self.process_workflow(tx, prev, now, effects).await;
        }
        if prev.retried_count >= job.retry_count {
            info!("实例 {} 重试次数已达上限 {}", prev.instance_id, job.retry_count);
            return self.process_workflow(tx, prev, now, effects).await;
        }

        let retried_count = prev.retried_count + 1;
        let retry_instance_id = self.generate_id();

        // 2、按重试类型装配 Task
        let prev_tasks = dao::find_tasks_by_instance(tx, prev.instance_id).await?;
        let tasks = match job.retry_type {
            RetryType::All => {
                let split = SplitJobParam::from_job(&job);
                match self.split_tasks(&split, &job, retry_instance_id, now).await {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        error!("重试拆分失败: {} | {}", prev.instance_id, e);
                        return self.process_workflow(tx, prev, now, effects).await;
                    }
                }
            }
            RetryType::Failed => {
                let snapshot = self.discovered().await?;
                let broadcast = job.is_broadcast();
                let failed: Vec<&SchedTask> = prev_tasks
                    .iter()
                    .filter(|t| t.execute_state.is_failure())
                    // 广播 Task 绑定节点，节点已死则无法重试
                    .filter(|t| {
                        !broadcast
                            || matches!(t.assigned_worker(), Some(w) if snapshot.is_alive_worker(&w))
                    })
                    .collect();
                let task_count = failed.len() as i32;
                failed
                    .iter()
                    .enumerate()
                    .map(|(index, t)| {
                        SchedTask::create(
                            self.generate_id(),
                            retry_instance_id,
                            index as i32 + 1,
                            task_count,
                            t.task_param.clone(),
                            if broadcast { t.worker.clone() } else { None },
                            now,
                        )
                    })
                    .collect()
            }
            RetryType::None => unreachable!(),
        };

        if tasks.is_empty() {
            // 比如广播任务的全部失败节点都已下线：放弃重试
            warn!("实例 {} 无可重试的Task，放弃重试", prev.instance_id);
            return self.process_workflow(tx, prev, now, effects).await;
        }

        // 工作流节点重试要先把边换绑到新实例
        if prev.is_workflow_node() {
            let cur_node = prev.parse_attach()?.cur_node;
            let wnstance_id = prev.wnstance_id.ok_or_else(|| {
                SchedError::internal(format!("工作流节点缺少wnstance_id: {}", prev.instance_id))
            })?;
            let affected = dao::update_workflow_state(
                tx,
                wnstance_id,
                Some(&cur_node),
                RunState::Running,
                Some(retry_instance_id),
                &[RunState::Running],
                Some(prev.instance_id),
            )
            .await?;
            if affected == 0 {
                return Err(SchedError::conflict(format!(
                    "重试换绑工作流边失败: {}",
                    prev.instance_id
                )));
            }
        }

        // 1、装配重试实例并落库
        let mut retry = SchedInstance::create(
            retry_instance_id,
            job.job_id,
            RunType::Retry,
            job.compute_retry_trigger_time(retried_count, now),
            retried_count,
            now,
        );
        retry.rnstance_id = Some(prev.obtain_rnstance_id());
        retry.pnstance_id = Some(prev.instance_id);
        retry.wnstance_id = prev.wnstance_id;
        retry.attach = prev.attach.clone();

        dao::insert_instance(tx, &retry).await?;
        dao::batch_insert_tasks(tx, &tasks).await?;
        info!(
            "实例 {} 第 {} 次重试，新实例 {}",
            prev.instance_id, retried_count, retry_instance_id
        );
        effects.extend(build_dispatch_params(&job, &retry, &tasks));
        Ok(())
    }

    /// 依赖级联：父任务 FINISHED 后触发启用状态的子任务
    ///
    /// 每个子任务用嵌套事务（savepoint）隔离，单个失败不影响其余。
    async fn depend_job(
        &self,
        tx: &mut PgConnection,
        parent: &SchedInstance,
        now: DateTime<Utc>,
        effects: &mut DispatchEffects,
    ) -> SchedResult<()> {
        let depends = dao::find_depends_by_parent(tx, parent.job_id).await?;
        if depends.is_empty() {
            return Ok(());
        }

        for depend in depends {
            let Some(child) = dao::get_job(tx, depend.child_job_id).await? else {
                error!("依赖的子任务缺失: {} | {}", depend.parent_job_id, depend.child_job_id);
                continue;
            };
            if !child.is_enabled() {
                continue;
            }

            // sequence 错开触发时间，规避 (job_id, trigger_time, run_type) 唯一约束
            let trigger_time = now.timestamp() * 1000 + i64::from(depend.sequence);
            let created = match self
                .create_trigger_instance(&child, RunType::Depend, trigger_time, now)
                .await
            {
                Ok(mut created) => {
                    if let TriggerInstance::Normal { instance, .. }
                    | TriggerInstance::Broadcast { instance, .. } = &mut created
                    {
                        instance.rnstance_id = Some(parent.obtain_rnstance_id());
                        instance.pnstance_id = Some(parent.instance_id);
                    }
                    created
                }
                Err(e) => {
                    error!("创建依赖实例失败: {} | {}", child.job_id, e);
                    continue;
                }
            };

            let mut nested = begin_nested(tx).await?;
            match created.persist(&mut nested).await {
                Ok(()) => {
                    nested.commit().await?;
                    effects.extend(created.dispatch_params(&child));
                }
                Err(e) => {
                    error!("依赖实例落库失败: {} | {}", child.job_id, e);
                    nested.rollback().await?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------工作流图推进

    /// 节点实例终态后的图推进
    pub(crate) async fn process_workflow(
        &self,
        tx: &mut PgConnection,
        node_instance: &SchedInstance,
        now: DateTime<Utc>,
        effects: &mut DispatchEffects,
    ) -> SchedResult<()> {
        if !node_instance.is_workflow_node() {
            return Ok(());
        }
        let run_state = node_instance.run_state;
        let wnstance_id = node_instance.wnstance_id.ok_or_else(|| {
            SchedError::internal(format!("工作流节点缺少wnstance_id: {}", node_instance.instance_id))
        })?;

        self.update_workflow_edge_state(tx, node_instance, run_state, &RunState::TERMINABLE)
            .await?;
        if run_state == RunState::Canceled {
            // 失败短路：还没跑起来的边全部取消（执行中的节点让它自然终态）
            dao::update_workflow_state(
                tx,
                wnstance_id,
                None,
                RunState::Canceled,
                None,
                &[RunState::Waiting],
                None,
            )
            .await?;
        }

        self.update_workflow_end_state(tx, wnstance_id).await?;

        let workflows = dao::find_workflows(tx, wnstance_id).await?;
        let graph = WorkflowGraph::new(workflows.clone());
        if graph.all_match(|w| w.is_terminal()) {
            let state = if graph.any_match(|w| w.is_failure()) {
                RunState::Canceled
            } else {
                RunState::Finished
            };
            if !dao::terminate_instance(tx, wnstance_id, state, &RunState::TERMINABLE, Some(now)).await? {
                return Err(SchedError::conflict(format!(
                    "终结工作流主实例失败: {wnstance_id} -> {state:?}"
                )));
            }
            // 主实例终态级联：FINISHED 触发依赖任务
            if state == RunState::Finished {
                let lead = dao::get_instance(tx, wnstance_id)
                    .await?
                    .ok_or_else(|| SchedError::instance_not_found(wnstance_id))?;
                self.depend_job(tx, &lead, now, effects).await?;
            }
            return Ok(());
        }

        if run_state == RunState::Canceled {
            return Ok(());
        }

        // 以当前节点的后继为候选创建下一批节点
        let lead = dao::get_instance(tx, wnstance_id)
            .await?
            .ok_or_else(|| SchedError::instance_not_found(wnstance_id))?;
        let cur_node = node_instance.parse_attach()?.cur_node;
        let candidates: Vec<SchedWorkflow> = graph
            .successors(&cur_node)
            .into_iter()
            .cloned()
            .collect();
        self.create_workflow_nodes(tx, &lead, &workflows, &candidates, now, effects)
            .await
    }

    /// 创建候选边指向的后继节点（前驱须全部成功终态）
    pub(crate) async fn create_workflow_nodes(
        &self,
        tx: &mut PgConnection,
        lead: &SchedInstance,
        workflows: &[SchedWorkflow],
        candidates: &[SchedWorkflow],
        now: DateTime<Utc>,
        effects: &mut DispatchEffects,
    ) -> SchedResult<()> {
        let job = dao::get_job(tx, lead.job_id)
            .await?
            .ok_or_else(|| SchedError::job_not_found(lead.job_id))?;
        let wnstance_id = lead.wnstance_id.ok_or_else(|| {
            SchedError::internal(format!("工作流主实例缺少wnstance_id: {}", lead.instance_id))
        })?;
        let graph = WorkflowGraph::new(workflows.to_vec());

        let mut created_nodes: Vec<String> = Vec::new();
        for candidate in candidates {
            let target = &candidate.cur_node;
            if is_end(target)
                || candidate.run_state != RunState::Waiting
                || created_nodes.iter().any(|n| n == target)
            {
                continue;
            }

            let predecessors = graph.predecessors(target);
            if predecessors.iter().any(|w| !w.is_terminal()) {
                continue;
            }
            if predecessors.iter().any(|w| w.is_failure()) {
                // 前驱失败，该节点短路取消
                dao::update_workflow_state(
                    tx,
                    wnstance_id,
                    Some(target),
                    RunState::Canceled,
                    None,
                    &RunState::TERMINABLE,
                    None,
                )
                .await?;
                continue;
            }

            let (instance, tasks) = match self
                .build_workflow_node_instance(&job, lead, target, candidate.sequence, now)
                .await
            {
                Ok(built) => built,
                Err(e) => {
                    error!("工作流节点拆分失败，节点取消: {} | {}", target, e);
                    dao::update_workflow_state(
                        tx,
                        wnstance_id,
                        Some(target),
                        RunState::Canceled,
                        None,
                        &RunState::TERMINABLE,
                        None,
                    )
                    .await?;
                    continue;
                }
            };
            let mut instance = instance;
            instance.pnstance_id = predecessors
                .first()
                .and_then(|w| w.instance_id);

            let affected = dao::update_workflow_state(
                tx,
                wnstance_id,
                Some(target),
                RunState::Running,
                Some(instance.instance_id),
                &[RunState::Waiting],
                None,
            )
            .await?;
            if affected == 0 {
                return Err(SchedError::conflict(format!("启动工作流节点失败: {target}")));
            }

            dao::insert_instance(tx, &instance).await?;
            dao::batch_insert_tasks(tx, &tasks).await?;
            effects.extend(build_dispatch_params(&job, &instance, &tasks));
            created_nodes.push(target.clone());
        }
        Ok(())
    }

    /// 回写节点实例对应边的状态
    pub(crate) async fn update_workflow_edge_state(
        &self,
        tx: &mut PgConnection,
        instance: &SchedInstance,
        to_state: RunState,
        from_states: &[RunState],
    ) -> SchedResult<()> {
        let cur_node = instance.parse_attach()?.cur_node;
        let wnstance_id = instance.wnstance_id.ok_or_else(|| {
            SchedError::internal(format!("工作流节点缺少wnstance_id: {}", instance.instance_id))
        })?;
        let affected = dao::update_workflow_state(
            tx,
            wnstance_id,
            Some(&cur_node),
            to_state,
            None,
            from_states,
            None,
        )
        .await?;
        if affected == 0 {
            return Err(SchedError::conflict(format!(
                "更新工作流边状态失败: {} -> {:?}",
                instance.instance_id, to_state
            )));
        }
        Ok(())
    }

    /// 折叠 End 状态：全部前驱终态后 End 边一起终态
    pub(crate) async fn update_workflow_end_state(
        &self,
        tx: &mut PgConnection,
        wnstance_id: i64,
    ) -> SchedResult<()> {
        let workflows = dao::find_workflows(tx, wnstance_id).await?;
        let graph = WorkflowGraph::new(workflows);
        let has_open_end = graph.any_match(|w| is_end(&w.cur_node) && !w.is_terminal());
        if !has_open_end {
            return Ok(());
        }
        // End 的前驱节点由指向它们的边表示（边状态即节点状态）
        let pre_of_end: Vec<&SchedWorkflow> = graph
            .edges()
            .iter()
            .filter(|w| !is_end(&w.cur_node))
            .filter(|w| graph.successors(&w.cur_node).iter().any(|s| is_end(&s.cur_node)))
            .collect();
        if pre_of_end.is_empty() || pre_of_end.iter().any(|w| !w.is_terminal()) {
            return Ok(());
        }
        let end_state = if pre_of_end.iter().any(|w| w.is_failure()) {
            RunState::Canceled
        } else {
            RunState::Finished
        };
        dao::update_workflow_state(
            tx,
            wnstance_id,
            Some(END_NODE),
            end_state,
            None,
            &RunState::TERMINABLE,
            None,
        )
        .await?;
        Ok(())
    }

    /// 扫描器兜底：重算一个滞留 RUNNING 的工作流主实例
    pub async fn heal_workflow_lead(&self, lead_instance_id: i64) -> SchedResult<()> {
        let now = Utc::now();
        let mut effects = DispatchEffects::new();
        let _guard = self.intern_lock(lead_instance_id).await;
        let mut tx = self.pool().begin().await?;
        let Some(lead) = dao::lock_instance(&mut tx, lead_instance_id).await? else {
            return Ok(());
        };
        if !lead.is_workflow_lead() || lead.run_state.is_terminal() {
            return Ok(());
        }
        // 先补建前驱已终态的等待节点（推进中断的异常场景），再重算主实例状态，
        // 否则一个本应继续推进的图会被误判成 PAUSED
        let workflows = dao::find_workflows(&mut tx, lead_instance_id).await?;
        let candidates = workflows.clone();
        self.create_workflow_nodes(&mut tx, &lead, &workflows, &candidates, now, &mut effects)
            .await?;
        self.update_workflow_lead_state(&mut tx, &lead).await?;
        tx.commit().await?;
        self.dispatch_after_commit(effects);
        Ok(())
    }

    /// 暂停/取消/恢复路径下主实例状态的重算
    pub(crate) async fn update_workflow_lead_state(
        &self,
        tx: &mut PgConnection,
        lead: &SchedInstance,
    ) -> SchedResult<()> {
        if !lead.is_workflow_lead() {
            return Err(SchedError::conflict(format!(
                "必须是工作流主实例: {}",
                lead.instance_id
            )));
        }
        let wnstance_id = lead.instance_id;
        self.update_workflow_end_state(tx, wnstance_id).await?;

        let workflows = dao::find_workflows(tx, wnstance_id).await?;
        let graph = WorkflowGraph::new(workflows);
        if graph.all_match(|w| w.is_terminal()) {
            let state = if graph.any_match(|w| w.is_failure()) {
                RunState::Canceled
            } else {
                RunState::Finished
            };
            if !dao::terminate_instance(tx, wnstance_id, state, &RunState::TERMINABLE, Some(Utc::now()))
                .await?
            {
                return Err(SchedError::conflict(format!(
                    "更新工作流主实例状态失败: {wnstance_id} -> {state:?}"
                )));
            }
        } else if !graph.any_match(|w| w.run_state == RunState::Running) {
            if !dao::update_instance_state(tx, wnstance_id, RunState::Paused, lead.run_state).await? {
                return Err(SchedError::conflict(format!(
                    "更新工作流主实例状态失败: {wnstance_id} -> PAUSED"
                )));
            }
        }
        Ok(())
    }
}
