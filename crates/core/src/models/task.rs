use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::ExecuteState;
use crate::server::Worker;

/// 执行单元，实例拆分后的最小派发粒度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedTask {
    pub task_id: i64,
    pub instance_id: i64,
    /// 序号，1 起始
    pub task_no: i32,
    /// 同一实例的 Task 总数
    pub task_count: i32,
    pub task_param: String,
    pub execute_state: ExecuteState,
    /// 执行方的序列化端点，startTask 确认后才会落库
    pub worker: Option<String>,
    pub execute_start_time: Option<DateTime<Utc>>,
    pub execute_end_time: Option<DateTime<Utc>>,
    /// Worker 上报的检查点快照
    pub execute_snapshot: Option<String>,
    pub dispatch_failed_count: i32,
    pub error_msg: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SchedTask {
    pub fn create(
        task_id: i64,
        instance_id: i64,
        task_no: i32,
        task_count: i32,
        task_param: String,
        worker: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            instance_id,
            task_no,
            task_count,
            task_param,
            execute_state: ExecuteState::Waiting,
            worker,
            execute_start_time: None,
            execute_end_time: None,
            execute_snapshot: None,
            dispatch_failed_count: 0,
            error_msg: None,
            updated_at: now,
            created_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.execute_state.is_terminal()
    }

    pub fn is_waiting(&self) -> bool {
        self.execute_state == ExecuteState::Waiting
    }

    pub fn is_executing(&self) -> bool {
        self.execute_state == ExecuteState::Executing
    }

    /// 已落库的 Worker 端点（反序列化失败视为未分配）
    pub fn assigned_worker(&self) -> Option<Worker> {
        self.worker
            .as_deref()
            .and_then(|w| Worker::deserialize(w).ok())
    }
}

/// 由当前所有 Task 的执行状态推导实例运行状态
///
/// - 全部终态：任一失败则 CANCELED，否则 FINISHED，结束时间取 max(execute_end_time)；
/// - 存在 WAITING/EXECUTING：返回 None（实例保持原状态）；
/// - 其余（终态与暂停混合）：PAUSED。
pub fn derive_run_state(
    tasks: &[SchedTask],
    now: DateTime<Utc>,
) -> Option<(crate::enums::RunState, Option<DateTime<Utc>>)> {
    use crate::enums::RunState;

    if tasks.iter().all(SchedTask::is_terminal) {
        let state = if tasks.iter().any(|t| t.execute_state.is_failure()) {
            RunState::Canceled
        } else {
            RunState::Finished
        };
        // 取消的 Task 可能从未开始执行，execute_end_time 为空
        let end_time = tasks
            .iter()
            .filter_map(|t| t.execute_end_time)
            .max()
            .unwrap_or(now);
        return Some((state, Some(end_time)));
    }

    if tasks
        .iter()
        .any(|t| ExecuteState::PAUSABLE.contains(&t.execute_state))
    {
        None
    } else {
        Some((crate::enums::RunState::Paused, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::RunState;

    fn task(state: ExecuteState) -> SchedTask {
        let mut t = SchedTask::create(1, 1, 1, 1, String::new(), None, Utc::now());
        t.execute_state = state;
        t
    }

    #[test]
    fn test_derive_all_completed() {
        let tasks = vec![task(ExecuteState::Completed), task(ExecuteState::Completed)];
        let (state, end) = derive_run_state(&tasks, Utc::now()).unwrap();
        assert_eq!(state, RunState::Finished);
        assert!(end.is_some());
    }

    #[test]
    fn test_derive_any_failure_cancels() {
        let tasks = vec![
            task(ExecuteState::Completed),
            task(ExecuteState::ExecuteFailed),
        ];
        let (state, _) = derive_run_state(&tasks, Utc::now()).unwrap();
        assert_eq!(state, RunState::Canceled);
    }

    #[test]
    fn test_derive_in_flight_returns_none() {
        let tasks = vec![task(ExecuteState::Completed), task(ExecuteState::Executing)];
        assert!(derive_run_state(&tasks, Utc::now()).is_none());
        let tasks = vec![task(ExecuteState::Waiting)];
        assert!(derive_run_state(&tasks, Utc::now()).is_none());
    }

    #[test]
    fn test_derive_paused_mixture() {
        let tasks = vec![task(ExecuteState::Paused), task(ExecuteState::Completed)];
        let (state, end) = derive_run_state(&tasks, Utc::now()).unwrap();
        assert_eq!(state, RunState::Paused);
        assert!(end.is_none());
    }

    #[test]
    fn test_end_time_is_max_of_tasks() {
        let now = Utc::now();
        let mut a = task(ExecuteState::Completed);
        let mut b = task(ExecuteState::Completed);
        a.execute_end_time = Some(now - chrono::Duration::seconds(10));
        b.execute_end_time = Some(now - chrono::Duration::seconds(5));
        let (_, end) = derive_run_state(&[a, b.clone()], now).unwrap();
        assert_eq!(end, b.execute_end_time);
    }
}
