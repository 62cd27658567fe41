use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use flowjob_core::SchedResult;

/// 心跳动作：返回 true 表示本轮空闲（睡到下一个对齐刻度），
/// false 表示批量打满（立即再跑一轮）。
#[async_trait]
pub trait HeartbeatAction: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn heartbeat(&self) -> SchedResult<bool>;
}

/// 心跳循环
///
/// 协作式停止：每轮迭代检查 stopped 标志；空闲时睡眠对齐到
/// `period - (now mod period)`，保持各副本的扫描相位大致错开。
pub struct HeartbeatThread {
    period_ms: u64,
    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatThread {
    pub fn start(period_ms: u64, action: Arc<dyn HeartbeatAction>) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let period = period_ms.max(1);
        info!("心跳线程启动: {} 周期{}ms", action.name(), period);

        let handle = tokio::spawn(async move {
            while !flag.load(Ordering::Acquire) {
                let start = Utc::now().timestamp_millis();
                let idle = match action.heartbeat().await {
                    Ok(idle) => idle,
                    Err(e) => {
                        error!("心跳执行出错: {} | {}", action.name(), e);
                        true
                    }
                };
                let end = Utc::now().timestamp_millis();
                debug!("心跳 {} 本轮耗时 {}ms", action.name(), end - start);

                if idle {
                    let gap = period as i64 - (end % period as i64);
                    tokio::time::sleep(Duration::from_millis(gap as u64)).await;
                }
            }
            info!("心跳线程退出: {}", action.name());
        });

        Self {
            period_ms: period,
            stopped,
            handle: Some(handle),
        }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    /// 置停止标志，循环在当前轮结束后退出
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// 停止并等待退出，超时后强制中止
    pub async fn shutdown(mut self, join_timeout: Duration) {
        self.stop();
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(join_timeout, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

impl Drop for HeartbeatThread {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingAction {
        count: AtomicU32,
    }

    #[async_trait]
    impl HeartbeatAction for CountingAction {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn heartbeat(&self) -> SchedResult<bool> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_heartbeat_runs_and_stops() {
        let action = Arc::new(CountingAction {
            count: AtomicU32::new(0),
        });
        let thread = HeartbeatThread::start(20, Arc::clone(&action) as Arc<dyn HeartbeatAction>);
        tokio::time::sleep(Duration::from_millis(90)).await;
        thread.shutdown(Duration::from_millis(200)).await;
        let count = action.count.load(Ordering::SeqCst);
        assert!(count >= 2, "expected at least 2 beats, got {count}");
    }

    struct BusyThenIdle {
        count: AtomicU32,
    }

    #[async_trait]
    impl HeartbeatAction for BusyThenIdle {
        fn name(&self) -> &'static str {
            "busy"
        }

        async fn heartbeat(&self) -> SchedResult<bool> {
            let n = self.count.fetch_add(1, Ordering::SeqCst);
            // 前几轮返回 busy，应当背靠背执行
            Ok(n >= 3)
        }
    }

    #[tokio::test]
    async fn test_busy_rounds_run_back_to_back() {
        let action = Arc::new(BusyThenIdle {
            count: AtomicU32::new(0),
        });
        let thread =
            HeartbeatThread::start(10_000, Arc::clone(&action) as Arc<dyn HeartbeatAction>);
        tokio::time::sleep(Duration::from_millis(100)).await;
        // 周期高达 10s，但 busy 轮不受周期限制
        assert!(action.count.load(Ordering::SeqCst) >= 4);
        thread.shutdown(Duration::from_millis(100)).await;
    }
}
