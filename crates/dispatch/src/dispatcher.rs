use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use flowjob_core::param::ExecuteTaskParam;
use flowjob_core::{Operation, SchedError, SchedResult, Worker};
use flowjob_registry::rpc::DestinationClient;
use flowjob_registry::ServerRegistry;

use crate::route::RouterRegistry;

/// Worker 接收派发的 RPC 路径
pub const RECEIVE_PATH: &str = "/worker/rpc/receive";

/// 派发结果回写钩子，由 Supervisor 侧实现（落库）
#[async_trait]
pub trait DispatchEventListener: Send + Sync {
    /// 路由成功并送达 Worker 之后回调，记录 Task 的认领绑定
    async fn on_dispatched(&self, task_id: i64, worker: &Worker) -> SchedResult<()>;

    /// 重试耗尽，累计失败计数并在超限时把 Task 置为 DISPATCH_FAILED
    async fn on_dispatch_failed(&self, task_id: i64, instance_id: i64) -> SchedResult<()>;
}

/// Supervisor 侧任务派发器
///
/// 对每个 ExecuteTaskParam 解析路由并调用 Worker 的 receive 接口；
/// RPC 层自带线性退避重试，这里只在重试耗尽后回写失败计数。
/// 带外操作（pause/cancel）的 param 已携带目标 worker，不再路由。
pub struct TaskDispatcher {
    registry: Arc<dyn ServerRegistry>,
    client: DestinationClient,
    routers: RouterRegistry,
    listener: Arc<dyn DispatchEventListener>,
}

impl TaskDispatcher {
    pub fn new(
        registry: Arc<dyn ServerRegistry>,
        client: DestinationClient,
        local_worker: Option<Worker>,
        listener: Arc<dyn DispatchEventListener>,
    ) -> Self {
        Self {
            registry,
            client,
            routers: RouterRegistry::new(local_worker),
            listener,
        }
    }

    /// 批量派发，逐个失败隔离
    pub async fn dispatch(&self, params: Vec<ExecuteTaskParam>) {
        for param in params {
            if let Err(e) = self.dispatch_one(param).await {
                error!("任务派发失败: {}", e);
            }
        }
    }

    async fn dispatch_one(&self, mut param: ExecuteTaskParam) -> SchedResult<()> {
        if param.worker.is_none() {
            // TRIGGER 需要现场路由；广播与带外操作的 worker 已在构造时固定
            let snapshot = self.registry.discovered().await?;
            let workers = snapshot.workers_of_group(&param.group);
            let Some(router) = self.routers.router(param.route_strategy) else {
                return Err(SchedError::internal(format!(
                    "路由策略不可路由: {:?}",
                    param.route_strategy
                )));
            };
            let Some(selected) = router.route(&param.group, param.job_id, &workers) else {
                warn!(
                    "分组 {} 没有可用Worker，task {} 留待扫描器重派",
                    param.group, param.task_id
                );
                return self
                    .listener
                    .on_dispatch_failed(param.task_id, param.instance_id)
                    .await;
            };
            param.worker = Some(selected);
        }

        let task_id = param.task_id;
        let instance_id = param.instance_id;
        let Some(worker) = param.worker.clone() else {
            return Err(SchedError::internal(format!("派发参数缺少worker: {task_id}")));
        };
        let out_of_band = param.operation != Operation::Trigger;
        let accepted: bool = match self
            .client
            .post(&worker.host, worker.port, RECEIVE_PATH, &param)
            .await
        {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("派发到 {} 重试耗尽: {}", worker, e);
                if out_of_band {
                    // 带外操作尽力而为，失败交给扫描器善后
                    return Ok(());
                }
                return self.listener.on_dispatch_failed(task_id, instance_id).await;
            }
        };

        if out_of_band {
            return Ok(());
        }
        if accepted {
            info!("task {} 已派发至 {}", task_id, worker);
            self.listener.on_dispatched(task_id, &worker).await
        } else {
            // Worker 明确拒收（时间轮溢出/重复/节点不匹配）
            warn!("Worker {} 拒收 task {}", worker, task_id);
            self.listener.on_dispatch_failed(task_id, instance_id).await
        }
    }
}
