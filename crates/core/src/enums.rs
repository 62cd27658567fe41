use serde::{Deserialize, Serialize};

use crate::error::SchedError;

macro_rules! int_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $( $(#[$vmeta:meta])* $variant:ident = $value:expr ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(into = "i32", try_from = "i32")]
        #[repr(i32)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )+
        }

        impl $name {
            pub const fn value(self) -> i32 {
                self as i32
            }
        }

        impl TryFrom<i32> for $name {
            type Error = SchedError;

            fn try_from(value: i32) -> Result<Self, Self::Error> {
                match value {
                    $( $value => Ok(Self::$variant), )+
                    other => Err(SchedError::internal(format!(
                        "无效的{}枚举值: {}", stringify!($name), other
                    ))),
                }
            }
        }

        impl From<$name> for i32 {
            fn from(v: $name) -> i32 {
                v.value()
            }
        }
    };
}

int_enum! {
    /// 任务状态
    JobState {
        Disable = 0,
        Enable = 1,
    }
}

int_enum! {
    /// 任务类型
    JobType {
        Normal = 1,
        Workflow = 2,
        Broadcast = 3,
    }
}

int_enum! {
    /// 触发器类型，trigger_value 按类型解释
    TriggerType {
        /// cron 表达式，如 "0/10 * * * * *"
        Cron = 1,
        /// 指定时刻执行一次，如 "2025-06-01 00:00:00"
        Once = 2,
        /// 周期性执行，JSON 格式 {"start":"...","step_seconds":n}
        Period = 3,
        /// 固定频率（秒），基于上一次计划触发时间
        FixedRate = 4,
        /// 固定间隔（秒），基于上一次执行结束时间
        FixedDelay = 5,
        /// 依赖触发，trigger_value 为父任务 id 列表
        Depend = 6,
    }
}

int_enum! {
    /// 实例运行类型
    RunType {
        Schedule = 1,
        Depend = 2,
        Retry = 3,
        Manual = 4,
    }
}

int_enum! {
    /// 实例运行状态
    RunState {
        Waiting = 10,
        Running = 20,
        Paused = 30,
        Finished = 40,
        Canceled = 50,
    }
}

impl RunState {
    /// 可终止状态集合（终态迁移的 CAS from 集合）
    pub const TERMINABLE: [RunState; 3] = [RunState::Waiting, RunState::Running, RunState::Paused];
    /// 可暂停状态集合
    pub const PAUSABLE: [RunState; 2] = [RunState::Waiting, RunState::Running];

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Finished | RunState::Canceled)
    }

    pub fn is_failure(self) -> bool {
        self == RunState::Canceled
    }
}

int_enum! {
    /// Task 执行状态
    ExecuteState {
        Waiting = 10,
        Executing = 20,
        Paused = 30,
        Completed = 40,
        /// 派发失败次数超限
        DispatchFailed = 50,
        /// 执行器初始化异常（含认证失败）
        InitException = 51,
        ExecuteFailed = 52,
        ExecuteException = 53,
        ExecuteTimeout = 54,
        /// 同一 task 在 Worker 上撞车
        ExecuteCollision = 55,
        BroadcastAborted = 56,
        ExecuteAborted = 57,
        /// Worker 停机导致取消
        ShutdownCanceled = 58,
        ManualCanceled = 59,
        /// 未派发即被取消
        WaitingCanceled = 60,
    }
}

impl ExecuteState {
    /// 可执行状态集合（批量取消的 CAS from 集合）
    pub const EXECUTABLE: [ExecuteState; 2] = [ExecuteState::Waiting, ExecuteState::Paused];
    /// 可暂停状态集合
    pub const PAUSABLE: [ExecuteState; 2] = [ExecuteState::Waiting, ExecuteState::Executing];

    pub fn is_terminal(self) -> bool {
        self.value() >= ExecuteState::Completed.value()
    }

    pub fn is_failure(self) -> bool {
        self.is_terminal() && self != ExecuteState::Completed
    }

    /// 该执行状态所蕴含的实例运行状态
    pub fn run_state(self) -> RunState {
        match self {
            ExecuteState::Waiting => RunState::Waiting,
            ExecuteState::Executing => RunState::Running,
            ExecuteState::Paused => RunState::Paused,
            ExecuteState::Completed => RunState::Finished,
            _ => RunState::Canceled,
        }
    }
}

int_enum! {
    /// 路由策略
    RouteStrategy {
        RoundRobin = 1,
        Random = 2,
        LeastRecentlyUsed = 3,
        ConsistentHash = 4,
        LocalPriority = 5,
        Broadcast = 6,
    }
}

int_enum! {
    /// 重试类型
    RetryType {
        None = 0,
        All = 1,
        Failed = 2,
    }
}

int_enum! {
    /// 同一任务多个实例并发时的冲突策略
    CollisionStrategy {
        Concurrent = 1,
        Serial = 2,
        Override = 3,
        Discard = 4,
    }
}

int_enum! {
    /// 状态机操作
    Operation {
        Trigger = 1,
        Pause = 2,
        Cancel = 3,
        Resume = 4,
        Delete = 5,
        StartTask = 6,
        TerminateTask = 7,
        Purge = 8,
        /// OVERRIDE 冲突策略对上一实例的取消
        CollisionCancel = 9,
    }
}

impl Operation {
    /// 带外操作对应的 Task 目标状态
    pub fn target_execute_state(self) -> Option<ExecuteState> {
        match self {
            Operation::Pause => Some(ExecuteState::Paused),
            Operation::Cancel => Some(ExecuteState::ManualCanceled),
            Operation::Purge => Some(ExecuteState::ExecuteTimeout),
            Operation::CollisionCancel => Some(ExecuteState::ExecuteCollision),
            _ => None,
        }
    }
}

macro_rules! sqlx_int_enum {
    ($name:ident) => {
        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <i32 as sqlx::Type<sqlx::Postgres>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let v = <i32 as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
                $name::try_from(v).map_err(|e| e.to_string().into())
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                <i32 as sqlx::Encode<'q, sqlx::Postgres>>::encode(self.value(), buf)
            }
        }
    };
}

sqlx_int_enum!(JobState);
sqlx_int_enum!(JobType);
sqlx_int_enum!(TriggerType);
sqlx_int_enum!(RunType);
sqlx_int_enum!(RunState);
sqlx_int_enum!(ExecuteState);
sqlx_int_enum!(RouteStrategy);
sqlx_int_enum!(RetryType);
sqlx_int_enum!(CollisionStrategy);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_terminal() {
        assert!(RunState::Finished.is_terminal());
        assert!(RunState::Canceled.is_terminal());
        assert!(!RunState::Paused.is_terminal());
        assert!(RunState::Canceled.is_failure());
        assert!(!RunState::Finished.is_failure());
    }

    #[test]
    fn test_execute_state_partition() {
        assert_eq!(ExecuteState::Waiting.run_state(), RunState::Waiting);
        assert_eq!(ExecuteState::Executing.run_state(), RunState::Running);
        assert_eq!(ExecuteState::Completed.run_state(), RunState::Finished);
        assert_eq!(ExecuteState::ExecuteTimeout.run_state(), RunState::Canceled);
        assert_eq!(ExecuteState::ManualCanceled.run_state(), RunState::Canceled);
    }

    #[test]
    fn test_execute_state_failure() {
        assert!(!ExecuteState::Completed.is_failure());
        assert!(ExecuteState::DispatchFailed.is_failure());
        assert!(ExecuteState::WaitingCanceled.is_failure());
        assert!(!ExecuteState::Executing.is_failure());
    }

    #[test]
    fn test_int_round_trip() {
        for state in [10, 20, 30, 40, 50] {
            assert_eq!(RunState::try_from(state).unwrap().value(), state);
        }
        assert!(RunState::try_from(99).is_err());
    }

    #[test]
    fn test_serde_numeric_codes() {
        let json = serde_json::to_string(&RunState::Paused).unwrap();
        assert_eq!(json, "30");
        let back: ExecuteState = serde_json::from_str("55").unwrap();
        assert_eq!(back, ExecuteState::ExecuteCollision);
    }

    #[test]
    fn test_operation_target_state() {
        assert_eq!(
            Operation::Cancel.target_execute_state(),
            Some(ExecuteState::ManualCanceled)
        );
        assert_eq!(
            Operation::Pause.target_execute_state(),
            Some(ExecuteState::Paused)
        );
        assert_eq!(Operation::Trigger.target_execute_state(), None);
    }
}
