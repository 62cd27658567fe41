use serde::{Deserialize, Serialize};

use crate::enums::RunState;

/// 工作流边，(pre_node → cur_node) 一条记录
///
/// 同一工作流实例的所有边共享 wnstance_id；节点实例创建后回填 instance_id。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedWorkflow {
    pub wnstance_id: i64,
    pub pre_node: String,
    pub cur_node: String,
    /// 建图时的边序号，同时用作依赖触发时间的偏移
    pub sequence: i32,
    pub run_state: RunState,
    pub instance_id: Option<i64>,
}

impl SchedWorkflow {
    pub fn new<P, C>(wnstance_id: i64, pre_node: P, cur_node: C, sequence: i32) -> Self
    where
        P: Into<String>,
        C: Into<String>,
    {
        Self {
            wnstance_id,
            pre_node: pre_node.into(),
            cur_node: cur_node.into(),
            sequence,
            run_state: RunState::Waiting,
            instance_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.run_state.is_terminal()
    }

    pub fn is_failure(&self) -> bool {
        self.run_state.is_failure()
    }
}

/// 父子任务依赖，父任务 FINISHED 后触发子任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedDepend {
    pub parent_job_id: i64,
    pub child_job_id: i64,
    /// 同一子任务多个父依赖时的次序，用于错开触发时间
    pub sequence: i32,
}

impl SchedDepend {
    pub fn new(parent_job_id: i64, child_job_id: i64, sequence: i32) -> Self {
        Self {
            parent_job_id,
            child_job_id,
            sequence,
        }
    }
}
