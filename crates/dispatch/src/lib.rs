//! flowjob 任务派发
//!
//! Supervisor 侧的路由选择与 receive 调用。路由策略对分组内的
//! 存活 Worker 生效；广播任务在创建时即按 Worker 固定，不经路由。

pub mod dispatcher;
pub mod route;

pub use dispatcher::{DispatchEventListener, TaskDispatcher, RECEIVE_PATH};
pub use route::{ExecutionRouter, RouterRegistry};
