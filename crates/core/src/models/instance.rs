use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{RunState, RunType};
use crate::error::SchedResult;

/// 任务实例，任务的一次触发
///
/// `rnstance_id` 指向 RETRY/DEPEND 链的根实例；`pnstance_id` 指向直接父实例；
/// `wnstance_id` 指向工作流主实例（主实例自身的 wnstance_id 等于 instance_id）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedInstance {
    pub instance_id: i64,
    /// 根实例 id（RETRY/DEPEND 链不变量）
    pub rnstance_id: Option<i64>,
    /// 父实例 id
    pub pnstance_id: Option<i64>,
    /// 工作流主实例 id
    pub wnstance_id: Option<i64>,
    pub job_id: i64,
    /// 计划触发时间，epoch 毫秒
    pub trigger_time: i64,
    pub run_type: RunType,
    pub run_state: RunState,
    pub run_start_time: Option<DateTime<Utc>>,
    pub run_end_time: Option<DateTime<Utc>>,
    pub retried_count: i32,
    /// 附加信息 JSON，工作流节点在此记录 cur_node
    pub attach: Option<String>,
    /// 乐观锁版本号
    pub version: i32,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// 实例附加信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceAttach {
    pub cur_node: String,
}

impl SchedInstance {
    pub fn create(
        instance_id: i64,
        job_id: i64,
        run_type: RunType,
        trigger_time: i64,
        retried_count: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id,
            rnstance_id: None,
            pnstance_id: None,
            wnstance_id: None,
            job_id,
            trigger_time,
            run_type,
            run_state: RunState::Waiting,
            run_start_time: None,
            run_end_time: None,
            retried_count,
            attach: None,
            version: 0,
            updated_at: now,
            created_at: now,
        }
    }

    pub fn is_workflow(&self) -> bool {
        self.wnstance_id.is_some()
    }

    pub fn is_workflow_lead(&self) -> bool {
        self.wnstance_id == Some(self.instance_id)
    }

    pub fn is_workflow_node(&self) -> bool {
        matches!(self.wnstance_id, Some(w) if w != self.instance_id)
    }

    /// 链根 id：未设置 rnstance_id 时即自身
    pub fn obtain_rnstance_id(&self) -> i64 {
        self.rnstance_id.unwrap_or(self.instance_id)
    }

    /// 状态机的串行化 key：工作流取主实例 id，否则取自身 id
    pub fn lock_key(&self) -> i64 {
        self.wnstance_id.unwrap_or(self.instance_id)
    }

    pub fn parse_attach(&self) -> SchedResult<InstanceAttach> {
        let text = self.attach.as_deref().unwrap_or("{}");
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_role_detection() {
        let mut inst = SchedInstance::create(100, 1, RunType::Schedule, 0, 0, Utc::now());
        assert!(!inst.is_workflow());

        inst.wnstance_id = Some(100);
        assert!(inst.is_workflow_lead());
        assert!(!inst.is_workflow_node());

        inst.wnstance_id = Some(99);
        assert!(inst.is_workflow_node());
        assert!(!inst.is_workflow_lead());
        assert_eq!(inst.lock_key(), 99);
    }

    #[test]
    fn test_obtain_rnstance_id_defaults_to_self() {
        let mut inst = SchedInstance::create(7, 1, RunType::Retry, 0, 1, Utc::now());
        assert_eq!(inst.obtain_rnstance_id(), 7);
        inst.rnstance_id = Some(3);
        assert_eq!(inst.obtain_rnstance_id(), 3);
    }

    #[test]
    fn test_parse_attach() {
        let mut inst = SchedInstance::create(1, 1, RunType::Schedule, 0, 0, Utc::now());
        inst.attach = Some(r#"{"cur_node":"A"}"#.to_string());
        assert_eq!(inst.parse_attach().unwrap().cur_node, "A");
    }
}
