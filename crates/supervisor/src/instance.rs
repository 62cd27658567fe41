use sqlx::PgConnection;

use flowjob_core::param::ExecuteTaskParam;
use flowjob_core::{
    Operation, SchedInstance, SchedJob, SchedResult, SchedTask, SchedWorkflow,
};

use crate::dao;

/// 一次触发产出的持久化单元，按任务类型分三种形态
///
/// NORMAL/BROADCAST 是一个实例加一批 Task（广播的 Task 创建时即固定
/// worker）；WORKFLOW 是主实例、全量边，以及 Start 后继节点的实例与 Task。
#[derive(Debug)]
pub enum TriggerInstance {
    Normal {
        instance: SchedInstance,
        tasks: Vec<SchedTask>,
    },
    Workflow {
        lead: SchedInstance,
        workflows: Vec<SchedWorkflow>,
        nodes: Vec<(SchedInstance, Vec<SchedTask>)>,
    },
    Broadcast {
        instance: SchedInstance,
        tasks: Vec<SchedTask>,
    },
}

impl TriggerInstance {
    pub fn main_instance(&self) -> &SchedInstance {
        match self {
            TriggerInstance::Normal { instance, .. } => instance,
            TriggerInstance::Workflow { lead, .. } => lead,
            TriggerInstance::Broadcast { instance, .. } => instance,
        }
    }

    /// 事务内落库
    pub async fn persist(&self, conn: &mut PgConnection) -> SchedResult<()> {
        match self {
            TriggerInstance::Normal { instance, tasks }
            | TriggerInstance::Broadcast { instance, tasks } => {
                dao::insert_instance(conn, instance).await?;
                dao::batch_insert_tasks(conn, tasks).await?;
            }
            TriggerInstance::Workflow {
                lead,
                workflows,
                nodes,
            } => {
                dao::insert_instance(conn, lead).await?;
                dao::batch_insert_workflows(conn, workflows).await?;
                for (instance, tasks) in nodes {
                    dao::insert_instance(conn, instance).await?;
                    dao::batch_insert_tasks(conn, tasks).await?;
                }
            }
        }
        Ok(())
    }

    /// 提交后要派发的参数列表
    pub fn dispatch_params(&self, job: &SchedJob) -> Vec<ExecuteTaskParam> {
        match self {
            TriggerInstance::Normal { instance, tasks }
            | TriggerInstance::Broadcast { instance, tasks } => {
                build_dispatch_params(job, instance, tasks)
            }
            TriggerInstance::Workflow { nodes, .. } => nodes
                .iter()
                .flat_map(|(instance, tasks)| build_dispatch_params(job, instance, tasks))
                .collect(),
        }
    }
}

/// WAITING Task 的派发参数；广播 Task 沿用创建时固定的 worker
pub fn build_dispatch_params(
    job: &SchedJob,
    instance: &SchedInstance,
    tasks: &[SchedTask],
) -> Vec<ExecuteTaskParam> {
    tasks
        .iter()
        .map(|task| {
            ExecuteTaskParam::from_job(
                job,
                Operation::Trigger,
                task.task_id,
                instance.instance_id,
                instance.wnstance_id,
                instance.trigger_time,
                task.assigned_worker(),
            )
        })
        .collect()
}
