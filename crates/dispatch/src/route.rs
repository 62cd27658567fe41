use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Instant;

use rand::Rng;
use tracing::debug;

use flowjob_core::{RouteStrategy, Worker};

/// 路由器：从分组的存活 Worker 中为一个 Task 选出目标节点
///
/// `seed` 是稳定路由键（job_id），仅一致性哈希使用。
pub trait ExecutionRouter: Send + Sync {
    fn name(&self) -> &'static str;

    fn route(&self, group: &str, seed: i64, workers: &[Worker]) -> Option<Worker>;
}

/// 按分组维护计数器的轮询路由
#[derive(Default)]
pub struct RoundRobinRouter {
    counters: Mutex<HashMap<String, usize>>,
}

impl ExecutionRouter for RoundRobinRouter {
    fn name(&self) -> &'static str {
        "ROUND_ROBIN"
    }

    fn route(&self, group: &str, _seed: i64, workers: &[Worker]) -> Option<Worker> {
        if workers.is_empty() {
            return None;
        }
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters.entry(group.to_string()).or_insert(0);
        let selected = workers[*counter % workers.len()].clone();
        *counter = counter.wrapping_add(1);
        Some(selected)
    }
}

#[derive(Default)]
pub struct RandomRouter;

impl ExecutionRouter for RandomRouter {
    fn name(&self) -> &'static str {
        "RANDOM"
    }

    fn route(&self, _group: &str, _seed: i64, workers: &[Worker]) -> Option<Worker> {
        if workers.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..workers.len());
        Some(workers[index].clone())
    }
}

/// 最久未使用路由：挑选上次被选中时间最早的 Worker
#[derive(Default)]
pub struct LeastRecentlyUsedRouter {
    last_used: Mutex<HashMap<String, Instant>>,
}

impl ExecutionRouter for LeastRecentlyUsedRouter {
    fn name(&self) -> &'static str {
        "LEAST_RECENTLY_USED"
    }

    fn route(&self, _group: &str, _seed: i64, workers: &[Worker]) -> Option<Worker> {
        if workers.is_empty() {
            return None;
        }
        let mut last_used = self.last_used.lock().unwrap_or_else(|e| e.into_inner());
        let selected = workers
            .iter()
            .min_by_key(|w| last_used.get(&w.serialize()).copied())
            .cloned()?;
        last_used.insert(selected.serialize(), Instant::now());
        Some(selected)
    }
}

/// 一致性哈希路由，虚拟节点平滑分布
pub struct ConsistentHashRouter {
    virtual_count: u32,
}

impl Default for ConsistentHashRouter {
    fn default() -> Self {
        Self { virtual_count: 17 }
    }
}

impl ConsistentHashRouter {
    fn hash<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }
}

impl ExecutionRouter for ConsistentHashRouter {
    fn name(&self) -> &'static str {
        "CONSISTENT_HASH"
    }

    fn route(&self, _group: &str, seed: i64, workers: &[Worker]) -> Option<Worker> {
        if workers.is_empty() {
            return None;
        }
        let mut ring: Vec<(u64, &Worker)> = Vec::with_capacity(workers.len() * self.virtual_count as usize);
        for worker in workers {
            for replica in 0..self.virtual_count {
                ring.push((Self::hash(&(worker.serialize(), replica)), worker));
            }
        }
        ring.sort_by_key(|(h, _)| *h);
        let key = Self::hash(&seed);
        let index = ring.partition_point(|(h, _)| *h < key) % ring.len();
        Some(ring[index].1.clone())
    }
}

/// 本机优先路由：Supervisor 与 Worker 同机部署时优先派给本机，否则回退内部路由
pub struct LocalPriorityRouter {
    local: Option<Worker>,
    fallback: RoundRobinRouter,
}

impl LocalPriorityRouter {
    pub fn new(local: Option<Worker>) -> Self {
        Self {
            local,
            fallback: RoundRobinRouter::default(),
        }
    }
}

impl ExecutionRouter for LocalPriorityRouter {
    fn name(&self) -> &'static str {
        "LOCAL_PRIORITY"
    }

    fn route(&self, group: &str, seed: i64, workers: &[Worker]) -> Option<Worker> {
        if let Some(local) = &self.local {
            if let Some(matched) = workers.iter().find(|w| w.same_server(local)) {
                debug!("本机优先路由命中本地Worker: {}", matched);
                return Some(matched.clone());
            }
        }
        self.fallback.route(group, seed, workers)
    }
}

/// 策略到路由器实例的注册表
pub struct RouterRegistry {
    round_robin: RoundRobinRouter,
    random: RandomRouter,
    least_recently_used: LeastRecentlyUsedRouter,
    consistent_hash: ConsistentHashRouter,
    local_priority: LocalPriorityRouter,
}

impl RouterRegistry {
    pub fn new(local_worker: Option<Worker>) -> Self {
        Self {
            round_robin: RoundRobinRouter::default(),
            random: RandomRouter,
            least_recently_used: LeastRecentlyUsedRouter::default(),
            consistent_hash: ConsistentHashRouter::default(),
            local_priority: LocalPriorityRouter::new(local_worker),
        }
    }

    /// BROADCAST 不经路由（Task 创建时已固定 worker），调用方不应传入
    pub fn router(&self, strategy: RouteStrategy) -> Option<&dyn ExecutionRouter> {
        match strategy {
            RouteStrategy::RoundRobin => Some(&self.round_robin),
            RouteStrategy::Random => Some(&self.random),
            RouteStrategy::LeastRecentlyUsed => Some(&self.least_recently_used),
            RouteStrategy::ConsistentHash => Some(&self.consistent_hash),
            RouteStrategy::LocalPriority => Some(&self.local_priority),
            RouteStrategy::Broadcast => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers(n: usize) -> Vec<Worker> {
        (0..n)
            .map(|i| Worker::new("g", format!("w{i}"), format!("host{i}"), 8080))
            .collect()
    }

    #[test]
    fn test_round_robin_cycles() {
        let router = RoundRobinRouter::default();
        let list = workers(3);
        let picks: Vec<String> = (0..6)
            .map(|_| router.route("g", 0, &list).unwrap().worker_id)
            .collect();
        assert_eq!(picks, vec!["w0", "w1", "w2", "w0", "w1", "w2"]);
    }

    #[test]
    fn test_round_robin_counters_independent_per_group() {
        let router = RoundRobinRouter::default();
        let list = workers(2);
        assert_eq!(router.route("g1", 0, &list).unwrap().worker_id, "w0");
        assert_eq!(router.route("g2", 0, &list).unwrap().worker_id, "w0");
        assert_eq!(router.route("g1", 0, &list).unwrap().worker_id, "w1");
    }

    #[test]
    fn test_empty_workers_returns_none() {
        assert!(RoundRobinRouter::default().route("g", 0, &[]).is_none());
        assert!(RandomRouter.route("g", 0, &[]).is_none());
        assert!(ConsistentHashRouter::default().route("g", 0, &[]).is_none());
    }

    #[test]
    fn test_consistent_hash_stable_for_same_seed() {
        let router = ConsistentHashRouter::default();
        let list = workers(5);
        let first = router.route("g", 42, &list).unwrap();
        for _ in 0..10 {
            assert_eq!(router.route("g", 42, &list).unwrap(), first);
        }
        // 节点减少时非命中节点的映射大多保持稳定，这里只验证仍能路由
        assert!(router.route("g", 42, &list[..4]).is_some());
    }

    #[test]
    fn test_lru_prefers_untouched_worker() {
        let router = LeastRecentlyUsedRouter::default();
        let list = workers(3);
        let first = router.route("g", 0, &list).unwrap();
        let second = router.route("g", 0, &list).unwrap();
        assert_ne!(first, second);
        let third = router.route("g", 0, &list).unwrap();
        assert_ne!(third, first);
        assert_ne!(third, second);
    }

    #[test]
    fn test_local_priority_prefers_colocated() {
        let local = Worker::new("g", "ignored", "host1", 8080);
        let router = LocalPriorityRouter::new(Some(local));
        let list = workers(3);
        assert_eq!(router.route("g", 0, &list).unwrap().worker_id, "w1");

        // 本地不在分组内则回退轮询
        let router = LocalPriorityRouter::new(Some(Worker::new("g", "x", "elsewhere", 1)));
        assert!(router.route("g", 0, &list).is_some());
    }
}
