//! flowjob Supervisor
//!
//! 调度状态机（实例/Task 生命周期、工作流推进、重试与依赖级联）、
//! 三个扫描器心跳、sched_* 表数据访问与 Worker 回调 RPC 服务端。

pub mod dao;
pub mod heartbeat;
pub mod instance;
pub mod lock;
pub mod manager;
pub mod rpc;
pub mod scanner;
pub mod startup;
mod workflow;

pub use manager::JobManager;
pub use startup::{SupervisorStartup, MIGRATOR};
