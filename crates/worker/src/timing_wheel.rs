use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, warn};

use flowjob_core::param::ExecuteTaskParam;
use flowjob_core::Worker;

/// 有界延迟 FIFO 时间轮
///
/// 按 `trigger_time / tick` 取模落槽；轮询线程每个 tick 推进一个槽，
/// 把到期条目移交执行线程池。每个槽独立加锁，轮询只在搬运时短暂持锁。
/// 过去时刻的任务落入下一个 tick 的槽位，保证一个 tick 内被弹出。
pub struct TimingWheel {
    tick_ms: i64,
    ring_size: usize,
    capacity: usize,
    buckets: Vec<Mutex<VecDeque<ExecuteTaskParam>>>,
    queued_ids: Mutex<HashSet<i64>>,
    size: AtomicUsize,
}

impl TimingWheel {
    pub fn new(tick_ms: u64, ring_size: usize) -> Self {
        let ring_size = ring_size.max(1);
        Self {
            tick_ms: tick_ms.max(1) as i64,
            ring_size,
            // 有界：平均每槽 64 个在途任务
            capacity: ring_size * 64,
            buckets: (0..ring_size).map(|_| Mutex::new(VecDeque::new())).collect(),
            queued_ids: Mutex::new(HashSet::new()),
            size: AtomicUsize::new(0),
        }
    }

    pub fn tick_ms(&self) -> u64 {
        self.tick_ms as u64
    }

    /// 当前排队数
    pub fn queued_count(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// 投放任务
    ///
    /// 拒收条件：目标 worker 不是本节点、轮已满、同一 task 已在轮中。
    pub fn offer(&self, param: ExecuteTaskParam, self_worker: &Worker) -> bool {
        match &param.worker {
            Some(worker) if worker.same_server(self_worker) => {}
            other => {
                warn!("拒收目标Worker不匹配的任务: task={} worker={:?}", param.task_id, other);
                return false;
            }
        }
        if self.size.load(Ordering::Acquire) >= self.capacity {
            warn!("时间轮已满，拒收 task {}", param.task_id);
            return false;
        }
        {
            let mut queued = self.queued_ids.lock().unwrap_or_else(|e| e.into_inner());
            if !queued.insert(param.task_id) {
                debug!("task {} 已在时间轮中，按重复投放拒收", param.task_id);
                return false;
            }
        }

        let now = Utc::now().timestamp_millis();
        // 过去或当前时刻进下一个槽
        let effective = param.trigger_time.max(now + self.tick_ms);
        let index = ((effective / self.tick_ms) as usize) % self.ring_size;
        self.buckets[index]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(param);
        self.size.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// 弹出当前 tick 到期的任务
    ///
    /// 同槽但属于更远圈数（trigger_time 超出一个 tick 窗口）的条目回插原槽。
    pub fn poll(&self, now_ms: i64) -> Vec<ExecuteTaskParam> {
        let index = ((now_ms / self.tick_ms) as usize) % self.ring_size;
        let mut due = Vec::new();
        {
            let mut bucket = self.buckets[index].lock().unwrap_or_else(|e| e.into_inner());
            let mut remain = VecDeque::with_capacity(bucket.len());
            while let Some(param) = bucket.pop_front() {
                if param.trigger_time <= now_ms + self.tick_ms {
                    due.push(param);
                } else {
                    remain.push_back(param);
                }
            }
            *bucket = remain;
        }
        if !due.is_empty() {
            let mut queued = self.queued_ids.lock().unwrap_or_else(|e| e.into_inner());
            for param in &due {
                queued.remove(&param.task_id);
            }
            self.size.fetch_sub(due.len(), Ordering::AcqRel);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowjob_core::{JobType, Operation, RouteStrategy};

    fn worker() -> Worker {
        Worker::new("g", "w1", "127.0.0.1", 8082)
    }

    fn param(task_id: i64, trigger_time: i64, target: Option<Worker>) -> ExecuteTaskParam {
        ExecuteTaskParam {
            operation: Operation::Trigger,
            task_id,
            instance_id: 1,
            wnstance_id: None,
            job_id: 1,
            job_type: JobType::Normal,
            group: "g".to_string(),
            route_strategy: RouteStrategy::RoundRobin,
            trigger_time,
            execute_timeout_ms: 0,
            executor: "noop".to_string(),
            job_param: String::new(),
            worker: target,
        }
    }

    #[test]
    fn test_rejects_foreign_worker() {
        let wheel = TimingWheel::new(100, 60);
        let me = worker();
        assert!(!wheel.offer(param(1, 0, None), &me));
        let other = Worker::new("g", "w2", "10.9.9.9", 1);
        assert!(!wheel.offer(param(1, 0, Some(other)), &me));
        assert!(wheel.offer(param(1, 0, Some(me.clone())), &me));
    }

    #[test]
    fn test_dedup_by_task_id() {
        let wheel = TimingWheel::new(100, 60);
        let me = worker();
        assert!(wheel.offer(param(7, 0, Some(me.clone())), &me));
        assert!(!wheel.offer(param(7, 0, Some(me.clone())), &me));
        assert_eq!(wheel.queued_count(), 1);
    }

    #[test]
    fn test_past_trigger_pops_within_one_tick() {
        let wheel = TimingWheel::new(100, 60);
        let me = worker();
        let now = Utc::now().timestamp_millis();
        // trigger_time 已经过去
        assert!(wheel.offer(param(1, now - 5, Some(me.clone())), &me));

        let mut popped = Vec::new();
        for offset in 0..=1 {
            popped.extend(wheel.poll(now + offset * 100));
        }
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].task_id, 1);
        assert_eq!(wheel.queued_count(), 0);
    }

    #[test]
    fn test_far_future_stays_in_ring() {
        let wheel = TimingWheel::new(100, 10);
        let me = worker();
        let now = Utc::now().timestamp_millis();
        // 一整圈之后才到期（同槽不同圈）
        let far = now + 100 * 10 + 50;
        assert!(wheel.offer(param(1, far, Some(me.clone())), &me));
        assert!(wheel.poll(far - 100 * 10).is_empty());
        assert_eq!(wheel.queued_count(), 1);
        assert_eq!(wheel.poll(far).len(), 1);
    }

    #[test]
    fn test_overflow_rejects() {
        let wheel = TimingWheel::new(100, 1);
        let me = worker();
        let capacity = 64;
        for task_id in 0..capacity {
            assert!(wheel.offer(param(task_id, 0, Some(me.clone())), &me));
        }
        assert!(!wheel.offer(param(capacity, 0, Some(me.clone())), &me));
    }

    #[test]
    fn test_offer_after_poll_allows_same_id() {
        let wheel = TimingWheel::new(100, 60);
        let me = worker();
        let now = Utc::now().timestamp_millis();
        assert!(wheel.offer(param(1, now, Some(me.clone())), &me));
        let mut drained = 0;
        for offset in 0..=1 {
            drained += wheel.poll(now + offset * 100).len();
        }
        assert_eq!(drained, 1);
        // 弹出后重新投放同 id 应被接受（重试场景）
        assert!(wheel.offer(param(1, now, Some(me.clone())), &me));
    }
}
