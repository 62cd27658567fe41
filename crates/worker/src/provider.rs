//! Worker 的派发接收 RPC 服务端
//!
//! Supervisor → Worker 方向不带鉴权头。receive 只做时间轮投放并异步认领，
//! verify/split 直接代理到执行器。

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{debug, warn};

use flowjob_core::param::{ConfigureWorkerParam, ExecuteTaskParam, SplitJobParam, WorkerMetrics};
use flowjob_core::{Operation, SchedError};

use crate::client::SupervisorClient;
use crate::runner::WorkerRunner;

pub struct WorkerRpcState {
    pub runner: Arc<WorkerRunner>,
    pub client: Arc<SupervisorClient>,
}

pub fn worker_router(state: Arc<WorkerRpcState>) -> Router {
    Router::new()
        .route("/worker/rpc/receive", post(receive))
        .route("/worker/rpc/verify", post(verify))
        .route("/worker/rpc/split", post(split))
        .route("/worker/rpc/metrics", get(metrics))
        .route("/worker/rpc/configure", post(configure))
        .with_state(state)
}

struct RpcError(SchedError);

impl From<SchedError> for RpcError {
    fn from(err: SchedError) -> Self {
        Self(err)
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SchedError::Configuration(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!("Worker RPC处理失败: {}", self.0);
        (status, self.0.to_string()).into_response()
    }
}

/// 接收派发：投放时间轮，接受后异步向 Supervisor 认领
async fn receive(
    State(state): State<Arc<WorkerRpcState>>,
    Json(param): Json<ExecuteTaskParam>,
) -> Json<bool> {
    let task_id = param.task_id;
    let operation = param.operation;
    let accepted = state
        .runner
        .wheel()
        .offer(param, state.client.self_worker());
    if accepted && operation == Operation::Trigger {
        let client = Arc::clone(&state.client);
        tokio::spawn(async move { client.claim_task(task_id).await });
    }
    debug!("receive task={} accepted={}", task_id, accepted);
    Json(accepted)
}

/// 校验任务配置可执行（新增/修改任务时 Supervisor 代理调用）
async fn verify(
    State(state): State<Arc<WorkerRpcState>>,
    Json(param): Json<SplitJobParam>,
) -> Result<Json<bool>, RpcError> {
    let executor = state.runner.executors().resolve(&param.executor)?;
    executor.verify(&param).await?;
    Ok(Json(true))
}

/// 拆分任务参数
async fn split(
    State(state): State<Arc<WorkerRpcState>>,
    Json(param): Json<SplitJobParam>,
) -> Result<Json<Vec<String>>, RpcError> {
    let executor = state.runner.executors().resolve(&param.executor)?;
    let task_params = executor.split(&param).await?;
    if task_params.is_empty() {
        return Err(RpcError(SchedError::SplitFailed(format!(
            "执行器 {} 拆分结果为空",
            param.executor
        ))));
    }
    Ok(Json(task_params))
}

async fn metrics(State(state): State<Arc<WorkerRpcState>>) -> Json<WorkerMetrics> {
    Json(state.runner.metrics())
}

/// 运行时调参；当前支持 max_pool_size（仅扩容）
async fn configure(
    State(state): State<Arc<WorkerRpcState>>,
    Json(param): Json<ConfigureWorkerParam>,
) -> Result<Json<bool>, RpcError> {
    match param.key.as_str() {
        "max_pool_size" => {
            let size: usize = param.value.parse().map_err(|_| {
                RpcError(SchedError::Configuration(format!(
                    "max_pool_size 值无效: {}",
                    param.value
                )))
            })?;
            Ok(Json(state.runner.grow_pool(size)))
        }
        other => Err(RpcError(SchedError::Configuration(format!(
            "不支持的配置项: {other}"
        )))),
    }
}
