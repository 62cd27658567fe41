use std::sync::Arc;

use tracing::warn;

use flowjob_core::config::HttpConfig;
use flowjob_core::param::{
    CheckpointParam, GetTaskParam, StartTaskParam, TaskWorkerParam, TerminateTaskParam,
};
use flowjob_core::{SchedResult, SchedTask, Worker};
use flowjob_registry::rpc::{DiscoveryClient, WorkerAuth};
use flowjob_registry::ServerRegistry;

/// Worker → Supervisor 的 RPC 客户端
///
/// 走发现列表负载均衡，所有请求携带分组签名头。
pub struct SupervisorClient {
    client: DiscoveryClient,
    self_worker: Worker,
}

impl SupervisorClient {
    pub fn new(
        registry: Arc<dyn ServerRegistry>,
        http: &HttpConfig,
        self_worker: Worker,
        worker_token: &str,
    ) -> SchedResult<Self> {
        let auth = WorkerAuth::new(self_worker.group.clone(), worker_token);
        Ok(Self {
            client: DiscoveryClient::new(registry, http, Some(auth))?,
            self_worker,
        })
    }

    pub fn self_worker(&self) -> &Worker {
        &self.self_worker
    }

    /// 任务开始执行上报；false 表示实例已不可运行，应放弃执行
    pub async fn start_task(&self, task_id: i64, instance_id: i64) -> SchedResult<bool> {
        let param = StartTaskParam {
            instance_id,
            task_id,
            worker: self.self_worker.serialize(),
        };
        self.client
            .post_supervisor("/supervisor/rpc/start_task", &param)
            .await
    }

    /// 拉取 Task 详情（拆分参数与上次检查点）
    pub async fn get_task(&self, task_id: i64) -> SchedResult<Option<SchedTask>> {
        self.client
            .post_supervisor("/supervisor/rpc/get_task", &GetTaskParam { task_id })
            .await
    }

    pub async fn terminate_task(&self, param: &TerminateTaskParam) -> SchedResult<bool> {
        self.client
            .post_supervisor("/supervisor/rpc/terminate_task", param)
            .await
    }

    pub async fn checkpoint(&self, task_id: i64, execute_snapshot: String) -> SchedResult<bool> {
        let param = CheckpointParam {
            task_id,
            execute_snapshot,
        };
        self.client
            .post_supervisor("/supervisor/rpc/checkpoint", &param)
            .await
    }

    /// 接收任务后的认领绑定，失败只告警（权威绑定在 startTask）
    pub async fn claim_task(&self, task_id: i64) {
        let params = vec![TaskWorkerParam {
            task_id,
            worker: Some(self.self_worker.serialize()),
        }];
        if let Err(e) = self
            .client
            .post_supervisor::<_, bool>("/supervisor/rpc/update_task_worker", &params)
            .await
        {
            warn!("任务认领绑定失败: task={} | {}", task_id, e);
        }
    }
}
