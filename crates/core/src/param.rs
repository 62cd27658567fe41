use serde::{Deserialize, Serialize};

use crate::enums::{ExecuteState, JobType, Operation, RouteStrategy};
use crate::models::SchedJob;
use crate::server::Worker;

/// Supervisor → Worker 的任务派发参数
///
/// `worker` 为路由选定的目标节点：TRIGGER 在派发时路由后填入，
/// 广播与带外操作在构造时即固定；Worker 收到后据此拒收误投的任务。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteTaskParam {
    pub operation: Operation,
    pub task_id: i64,
    pub instance_id: i64,
    pub wnstance_id: Option<i64>,
    pub job_id: i64,
    pub job_type: JobType,
    /// 任务所属分组，路由的候选范围
    pub group: String,
    pub route_strategy: RouteStrategy,
    /// epoch 毫秒，带外操作（pause/cancel）固定为 0 立即生效
    pub trigger_time: i64,
    pub execute_timeout_ms: i64,
    pub executor: String,
    pub job_param: String,
    pub worker: Option<Worker>,
}

impl ExecuteTaskParam {
    pub fn from_job(
        job: &SchedJob,
        operation: Operation,
        task_id: i64,
        instance_id: i64,
        wnstance_id: Option<i64>,
        trigger_time: i64,
        worker: Option<Worker>,
    ) -> Self {
        Self {
            operation,
            task_id,
            instance_id,
            wnstance_id,
            job_id: job.job_id,
            job_type: job.job_type,
            group: job.job_group.clone(),
            route_strategy: job.route_strategy,
            trigger_time,
            execute_timeout_ms: job.execute_timeout_ms,
            executor: job.executor.clone(),
            job_param: job.job_param.clone(),
            worker,
        }
    }
}

/// Worker → Supervisor：任务开始执行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTaskParam {
    pub instance_id: i64,
    pub task_id: i64,
    /// 序列化的 Worker 端点
    pub worker: String,
}

/// Worker → Supervisor：任务到达终态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateTaskParam {
    pub operation: Operation,
    pub instance_id: i64,
    pub wnstance_id: Option<i64>,
    pub task_id: i64,
    pub to_state: ExecuteState,
    pub error_msg: Option<String>,
}

/// 批量更新 Task 的 worker 绑定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWorkerParam {
    pub task_id: i64,
    pub worker: Option<String>,
}

/// Worker → Supervisor：执行检查点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointParam {
    pub task_id: i64,
    pub execute_snapshot: String,
}

/// Worker → Supervisor：拉取 Task 详情（拆分参数与快照）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTaskParam {
    pub task_id: i64,
}

/// 任务拆分请求（verify/split 共用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitJobParam {
    pub job_type: JobType,
    pub executor: String,
    pub job_param: String,
}

impl SplitJobParam {
    pub fn from_job(job: &SchedJob) -> Self {
        Self {
            job_type: job.job_type,
            executor: job.executor.clone(),
            job_param: job.job_param.clone(),
        }
    }

    /// 工作流节点的拆分参数：executor 为节点名
    pub fn from_workflow_node(job: &SchedJob, cur_node: &str) -> Self {
        Self {
            job_type: job.job_type,
            executor: cur_node.to_string(),
            job_param: job.job_param.clone(),
        }
    }
}

/// 暂停/取消实例（Supervisor 副本间转发用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceOperationParam {
    pub instance_id: i64,
    pub wnstance_id: Option<i64>,
    pub operation: Operation,
}

/// Worker 运行指标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub worker_id: String,
    pub group: String,
    /// 时间轮中排队的任务数
    pub queued_task_count: usize,
    /// 执行中的任务数
    pub executing_task_count: usize,
    pub max_pool_size: usize,
    pub uptime_seconds: u64,
}

/// 动态调整 Worker 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureWorkerParam {
    /// 目前支持 "max_pool_size"
    pub key: String,
    pub value: String,
}

/// 注册中心事件订阅回调载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeEventParam {
    pub event: String,
    pub server: String,
}
