use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{CollisionStrategy, JobState, JobType, RetryType, RouteStrategy, TriggerType};

/// 任务定义
///
/// 调度的静态配置，一行对应 `sched_job` 表的一条记录。实例与 Task 均由此派生。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedJob {
    pub job_id: i64,
    /// 所属分组，路由时只在该分组的 Worker 中选择
    pub job_group: String,
    pub job_name: String,
    pub job_type: JobType,
    pub job_state: JobState,
    pub trigger_type: TriggerType,
    /// 按 trigger_type 解释的触发配置
    pub trigger_value: String,
    /// 执行器标识（命令/内置执行器名，由 Worker 解析）
    pub executor: String,
    pub job_param: String,
    pub route_strategy: RouteStrategy,
    pub collision_strategy: CollisionStrategy,
    pub retry_type: RetryType,
    pub retry_count: i32,
    /// 重试基准间隔（毫秒），实际间隔随已重试次数线性放大
    pub retry_interval: i64,
    /// 单个 Task 的执行超时（毫秒），0 表示不限
    pub execute_timeout_ms: i64,
    /// epoch 毫秒
    pub next_trigger_time: Option<i64>,
    pub last_trigger_time: Option<i64>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SchedJob {
    pub fn is_enabled(&self) -> bool {
        self.job_state == JobState::Enable
    }

    pub fn is_broadcast(&self) -> bool {
        self.job_type == JobType::Broadcast || self.route_strategy == RouteStrategy::Broadcast
    }

    /// 第 retried_count 次重试的触发时间：now + retry_interval × retried_count
    pub fn compute_retry_trigger_time(&self, retried_count: i32, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis() + self.retry_interval * i64::from(retried_count.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> SchedJob {
        let now = Utc::now();
        SchedJob {
            job_id: 1,
            job_group: "default".to_string(),
            job_name: "demo".to_string(),
            job_type: JobType::Normal,
            job_state: JobState::Enable,
            trigger_type: TriggerType::Cron,
            trigger_value: "0/5 * * * * *".to_string(),
            executor: "noop".to_string(),
            job_param: String::new(),
            route_strategy: RouteStrategy::RoundRobin,
            collision_strategy: CollisionStrategy::Concurrent,
            retry_type: RetryType::Failed,
            retry_count: 3,
            retry_interval: 1000,
            execute_timeout_ms: 0,
            next_trigger_time: None,
            last_trigger_time: None,
            updated_at: now,
            created_at: now,
        }
    }

    #[test]
    fn test_retry_trigger_time_scales_linearly() {
        let j = job();
        let now = Utc::now();
        let base = now.timestamp_millis();
        assert_eq!(j.compute_retry_trigger_time(1, now), base + 1000);
        assert_eq!(j.compute_retry_trigger_time(3, now), base + 3000);
        // retried_count 最小按 1 计
        assert_eq!(j.compute_retry_trigger_time(0, now), base + 1000);
    }

    #[test]
    fn test_broadcast_detection() {
        let mut j = job();
        assert!(!j.is_broadcast());
        j.route_strategy = RouteStrategy::Broadcast;
        assert!(j.is_broadcast());
        j.route_strategy = RouteStrategy::Random;
        j.job_type = JobType::Broadcast;
        assert!(j.is_broadcast());
    }
}
