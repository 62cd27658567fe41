//! flowjob 核心模型与纯逻辑
//!
//! 任务/实例/Task/工作流实体、整型编码枚举、触发时间计算、DAG 图、
//! 节点端点、RPC 参数、id 生成与应用配置。不含任何 I/O。

pub mod config;
pub mod dag;
pub mod enums;
pub mod error;
pub mod id;
pub mod models;
pub mod param;
pub mod server;
pub mod trigger;

pub use enums::{
    CollisionStrategy, ExecuteState, JobState, JobType, Operation, RetryType, RouteStrategy,
    RunState, RunType, TriggerType,
};
pub use error::{SchedError, SchedResult};
pub use models::{derive_run_state, InstanceAttach, SchedDepend, SchedInstance, SchedJob, SchedTask, SchedWorkflow};
pub use server::{Supervisor, Worker};
