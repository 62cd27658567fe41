//! Supervisor 的 Worker 回调 RPC 服务端
//!
//! 所有端点要求 Worker 鉴权头（分组 + 时间戳 + 随机数 + HMAC 签名），
//! 签名密钥按分组在 Supervisor 配置中登记。

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tracing::{debug, warn};

use flowjob_core::param::{
    CheckpointParam, GetTaskParam, InstanceOperationParam, StartTaskParam, SubscribeEventParam,
    TaskWorkerParam, TerminateTaskParam,
};
use flowjob_core::{Operation, SchedError, SchedTask};
use flowjob_registry::rpc::{
    verify_signature, AUTH_GROUP_HEADER, AUTH_NONCE_HEADER, AUTH_SIGNATURE_HEADER,
    AUTH_TIMESTAMP_HEADER,
};

use crate::manager::JobManager;

pub struct SupervisorRpcState {
    pub manager: Arc<JobManager>,
    /// 分组 → 签名令牌
    pub group_tokens: HashMap<String, String>,
}

pub fn supervisor_router(state: Arc<SupervisorRpcState>) -> Router {
    Router::new()
        .route("/supervisor/rpc/start_task", post(start_task))
        .route("/supervisor/rpc/get_task", post(get_task))
        .route("/supervisor/rpc/terminate_task", post(terminate_task))
        .route("/supervisor/rpc/update_task_worker", post(update_task_worker))
        .route("/supervisor/rpc/checkpoint", post(checkpoint))
        .route("/supervisor/rpc/pause_instance", post(pause_instance))
        .route("/supervisor/rpc/cancel_instance", post(cancel_instance))
        .route("/supervisor/rpc/subscribe_event", post(subscribe_event))
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
            SchedError::Authentication(_) => StatusCode::UNAUTHORIZED,
            SchedError::JobNotFound { .. }
            | SchedError::InstanceNotFound { .. }
            | SchedError::TaskNotFound { .. } => StatusCode::NOT_FOUND,
            SchedError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!("RPC处理失败: {}", self.0);
        (status, self.0.to_string()).into_response()
    }
}

fn authenticate(state: &SupervisorRpcState, headers: &HeaderMap) -> Result<(), RpcError> {
    let get = |name: &str| -> Result<String, RpcError> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RpcError(SchedError::Authentication(format!("缺少鉴权头: {name}"))))
    };
    let group = get(AUTH_GROUP_HEADER)?;
    let timestamp = get(AUTH_TIMESTAMP_HEADER)?;
    let nonce = get(AUTH_NONCE_HEADER)?;
    let signature = get(AUTH_SIGNATURE_HEADER)?;
    // 未登记令牌的分组按空令牌校验
    let token = state.group_tokens.get(&group).map(String::as_str).unwrap_or("");
    verify_signature(token, &group, &timestamp, &nonce, &signature)?;
    Ok(())
}

async fn start_task(
    State(state): State<Arc<SupervisorRpcState>>,
    headers: HeaderMap,
    Json(param): Json<StartTaskParam>,
) -> Result<Json<bool>, RpcError> {
    authenticate(&state, &headers)?;
    debug!("startTask回调: task={} instance={}", param.task_id, param.instance_id);
    Ok(Json(state.manager.start_task(param).await?))
}

async fn get_task(
    State(state): State<Arc<SupervisorRpcState>>,
    headers: HeaderMap,
    Json(param): Json<GetTaskParam>,
) -> Result<Json<Option<SchedTask>>, RpcError> {
    authenticate(&state, &headers)?;
    Ok(Json(state.manager.get_task(param.task_id).await?))
}

async fn terminate_task(
    State(state): State<Arc<SupervisorRpcState>>,
    headers: HeaderMap,
    Json(param): Json<TerminateTaskParam>,
) -> Result<Json<bool>, RpcError> {
    authenticate(&state, &headers)?;
    debug!(
        "terminateTask回调: task={} to={:?}",
        param.task_id, param.to_state
    );
    Ok(Json(state.manager.terminate_task(param).await?))
}

async fn update_task_worker(
    State(state): State<Arc<SupervisorRpcState>>,
    headers: HeaderMap,
    Json(params): Json<Vec<TaskWorkerParam>>,
) -> Result<Json<bool>, RpcError> {
    authenticate(&state, &headers)?;
    state.manager.update_task_worker(params).await?;
    Ok(Json(true))
}

async fn checkpoint(
    State(state): State<Arc<SupervisorRpcState>>,
    headers: HeaderMap,
    Json(param): Json<CheckpointParam>,
) -> Result<Json<bool>, RpcError> {
    authenticate(&state, &headers)?;
    Ok(Json(
        state
            .manager
            .checkpoint_task(param.task_id, &param.execute_snapshot)
            .await?,
    ))
}

async fn pause_instance(
    State(state): State<Arc<SupervisorRpcState>>,
    headers: HeaderMap,
    Json(param): Json<InstanceOperationParam>,
) -> Result<Json<bool>, RpcError> {
    authenticate(&state, &headers)?;
    Ok(Json(
        state
            .manager
            .pause_instance(param.instance_id, param.wnstance_id)
            .await?,
    ))
}

async fn cancel_instance(
    State(state): State<Arc<SupervisorRpcState>>,
    headers: HeaderMap,
    Json(param): Json<InstanceOperationParam>,
) -> Result<Json<bool>, RpcError> {
    authenticate(&state, &headers)?;
    if param.operation != Operation::Cancel {
        return Err(RpcError(SchedError::conflict(format!(
            "不支持的取消操作: {:?}",
            param.operation
        ))));
    }
    Ok(Json(
        state
            .manager
            .cancel_instance(param.instance_id, param.wnstance_id, param.operation)
            .await?,
    ))
}

async fn subscribe_event(
    State(state): State<Arc<SupervisorRpcState>>,
    headers: HeaderMap,
    Json(param): Json<SubscribeEventParam>,
) -> Result<Json<bool>, RpcError> {
    authenticate(&state, &headers)?;
    debug!("订阅事件通知: {} | {}", param.event, param.server);
    // 提示性事件，触发一次发现刷新即可
    state.manager.discovered().await?;
    Ok(Json(true))
}
