use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowjob_core::param::{ExecuteTaskParam, TerminateTaskParam, WorkerMetrics};
use flowjob_core::{ExecuteState, Operation, SchedResult};

use crate::client::SupervisorClient;
use crate::executor::{ExecutionContext, ExecutorRegistry};
use crate::timing_wheel::TimingWheel;

/// Worker 执行端
///
/// 单线程轮询时间轮，到期任务进有界执行池（信号量限并发）；
/// 带外 pause/cancel 同样经时间轮投递（trigger_time=0，下个 tick 生效）。
pub struct WorkerRunner {
    wheel: Arc<TimingWheel>,
    executors: Arc<ExecutorRegistry>,
    client: Arc<SupervisorClient>,
    semaphore: Arc<Semaphore>,
    max_pool_size: AtomicUsize,
    executing: Arc<Mutex<HashMap<i64, JoinHandle<()>>>>,
    stopped: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl WorkerRunner {
    pub fn new(
        wheel: Arc<TimingWheel>,
        executors: Arc<ExecutorRegistry>,
        client: Arc<SupervisorClient>,
        max_pool_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            wheel,
            executors,
            client,
            semaphore: Arc::new(Semaphore::new(max_pool_size.max(1))),
            max_pool_size: AtomicUsize::new(max_pool_size.max(1)),
            executing: Arc::new(Mutex::new(HashMap::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
            started_at: Instant::now(),
        })
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn wheel(&self) -> &TimingWheel {
        &self.wheel
    }

    pub fn metrics(&self) -> WorkerMetrics {
        let worker = self.client.self_worker();
        WorkerMetrics {
            worker_id: worker.worker_id.clone(),
            group: worker.group.clone(),
            queued_task_count: self.wheel.queued_count(),
            executing_task_count: self.executing.lock().unwrap_or_else(|e| e.into_inner()).len(),
            max_pool_size: self.max_pool_size.load(Ordering::Acquire),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// 执行池只支持扩容（信号量无法安全回收在途许可）
    pub fn grow_pool(&self, new_size: usize) -> bool {
        let current = self.max_pool_size.load(Ordering::Acquire);
        if new_size <= current {
            return false;
        }
        self.semaphore.add_permits(new_size - current);
        self.max_pool_size.store(new_size, Ordering::Release);
        info!("执行池扩容: {} -> {}", current, new_size);
        true
    }

    /// 拉起时间轮轮询
    pub fn start(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        let tick = Duration::from_millis(self.wheel.tick_ms());
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if runner.stopped.load(Ordering::Acquire) {
                    break;
                }
                let due = runner.wheel.poll(Utc::now().timestamp_millis());
                for param in due {
                    runner.launch(param);
                }
            }
            info!("时间轮轮询退出");
        });
        *self.poller.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn launch(self: &Arc<Self>, param: ExecuteTaskParam) {
        match param.operation {
            Operation::Trigger => self.launch_trigger(param),
            Operation::Pause | Operation::Cancel | Operation::CollisionCancel => {
                self.handle_out_of_band(param)
            }
            other => warn!("忽略不支持的派发操作: {:?}", other),
        }
    }

    fn launch_trigger(self: &Arc<Self>, param: ExecuteTaskParam) {
        {
            // 已完成但还没来得及清理的句柄不算在执行
            let executing = self.executing.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = executing.get(&param.task_id) {
                if !handle.is_finished() {
                    warn!("task {} 已在执行，丢弃重复派发", param.task_id);
                    return;
                }
            }
        }
        let runner = Arc::clone(self);
        let task_id = param.task_id;
        let handle = tokio::spawn(async move {
            let permit = match runner.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            runner.run_task(param).await;
            drop(permit);
        });
        self.executing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id, handle);
    }

    /// 带外暂停/取消：中止执行中的任务并按操作上报
    fn handle_out_of_band(self: &Arc<Self>, param: ExecuteTaskParam) {
        let handle = self
            .executing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&param.task_id);
        let Some(handle) = handle else {
            // 任务不在执行中：WAITING 的那份已被 Supervisor 批量迁移
            debug!("带外操作的任务不在执行中: {}", param.task_id);
            return;
        };
        if handle.is_finished() {
            debug!("带外操作的任务已自行终态: {}", param.task_id);
            return;
        }
        handle.abort();

        let Some(to_state) = param.operation.target_execute_state() else {
            return;
        };
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let report = TerminateTaskParam {
                operation: param.operation,
                instance_id: param.instance_id,
                wnstance_id: param.wnstance_id,
                task_id: param.task_id,
                to_state,
                error_msg: None,
            };
            if let Err(e) = runner.client.terminate_task(&report).await {
                error!("带外操作上报失败: task={} | {}", param.task_id, e);
            }
        });
    }

    async fn run_task(self: &Arc<Self>, param: ExecuteTaskParam) {
        let task_id = param.task_id;
        let finished = self.execute_and_report(&param).await;
        self.executing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
        if let Err(e) = finished {
            error!("task {} 执行流程异常: {}", task_id, e);
        }
    }

    async fn execute_and_report(&self, param: &ExecuteTaskParam) -> SchedResult<()> {
        // 1、startTask 确权；false 表示实例已不可运行
        match self.client.start_task(param.task_id, param.instance_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("startTask被拒，放弃执行: {}", param.task_id);
                return Ok(());
            }
            Err(e) => {
                // Supervisor 不可达，放弃执行，交给扫描器恢复
                warn!("startTask调用失败，放弃执行: {} | {}", param.task_id, e);
                return Ok(());
            }
        }

        // 2、解析执行器并拉取 Task 详情（拆分参数）
        let executor = match self.executors.resolve(&param.executor) {
            Ok(executor) => executor,
            Err(e) => {
                return self
                    .report_terminate(param, ExecuteState::InitException, Some(e.to_string()))
                    .await;
            }
        };
        let task = match self.client.get_task(param.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                return self
                    .report_terminate(param, ExecuteState::InitException, Some("task缺失".to_string()))
                    .await;
            }
            Err(e) => {
                return self
                    .report_terminate(param, ExecuteState::ExecuteException, Some(e.to_string()))
                    .await;
            }
        };

        let context = ExecutionContext {
            task_id: param.task_id,
            instance_id: param.instance_id,
            task_no: Some(task.task_no),
            task_param: task.task_param.clone(),
            execute_timeout_ms: param.execute_timeout_ms,
        };

        // 3、执行（可选超时）
        let outcome = if param.execute_timeout_ms > 0 {
            match tokio::time::timeout(
                Duration::from_millis(param.execute_timeout_ms as u64),
                executor.execute(&context),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    return self
                        .report_terminate(param, ExecuteState::ExecuteTimeout, Some("执行超时".to_string()))
                        .await;
                }
            }
        } else {
            executor.execute(&context).await
        };

        // 4、上报终态；输出先以检查点形式保存
        match outcome {
            Ok(result) if result.success => {
                if let Some(output) = result.output {
                    if !output.is_empty() {
                        let _ = self.client.checkpoint(param.task_id, output).await;
                    }
                }
                self.report_terminate(param, ExecuteState::Completed, None).await
            }
            Ok(result) => {
                self.report_terminate(param, ExecuteState::ExecuteFailed, result.error_message)
                    .await
            }
            Err(e) => {
                self.report_terminate(param, ExecuteState::ExecuteException, Some(e.to_string()))
                    .await
            }
        }
    }

    async fn report_terminate(
        &self,
        param: &ExecuteTaskParam,
        to_state: ExecuteState,
        error_msg: Option<String>,
    ) -> SchedResult<()> {
        let report = TerminateTaskParam {
            operation: Operation::Trigger,
            instance_id: param.instance_id,
            wnstance_id: param.wnstance_id,
            task_id: param.task_id,
            to_state,
            error_msg,
        };
        self.client.terminate_task(&report).await?;
        Ok(())
    }

    /// 协作式关停：停轮询 → 给在途任务一个排空窗口 → 余下的中止并上报
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }

        let deadline = Instant::now() + drain_timeout;
        loop {
            let executing_count = self
                .executing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len();
            if executing_count == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let leftover: Vec<(i64, JoinHandle<()>)> = self
            .executing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (task_id, handle) in leftover {
            handle.abort();
            warn!("停机中止在途任务: {}", task_id);
        }
        info!("Worker 执行端已关停");
    }
}
