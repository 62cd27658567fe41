//! Worker 执行端链路验证：receive → 时间轮 → startTask → 执行 → terminateTask
//! （Supervisor 用本地 axum 桩代替）

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use tokio::sync::broadcast;

use flowjob_core::config::HttpConfig;
use flowjob_core::param::{
    ExecuteTaskParam, GetTaskParam, StartTaskParam, TerminateTaskParam,
};
use flowjob_core::{
    ExecuteState, JobType, Operation, RouteStrategy, SchedResult, SchedTask, Supervisor, Worker,
};
use flowjob_registry::{DiscoveredServers, RegistryEvent, RegistryServer, ServerRegistry};
use flowjob_worker::{ExecutorRegistry, SupervisorClient, TimingWheel, WorkerRunner};

struct StaticRegistry {
    snapshot: Arc<DiscoveredServers>,
    events: broadcast::Sender<RegistryEvent>,
}

#[async_trait::async_trait]
impl ServerRegistry for StaticRegistry {
    async fn register(&self) -> SchedResult<()> {
        Ok(())
    }

    async fn deregister(&self) -> SchedResult<()> {
        Ok(())
    }

    async fn discovered(&self) -> SchedResult<Arc<DiscoveredServers>> {
        Ok(Arc::clone(&self.snapshot))
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {}
}

#[derive(Default)]
struct StubSupervisor {
    started: AtomicUsize,
    terminated: Mutex<Vec<(i64, ExecuteState)>>,
    checkpoints: Mutex<Vec<String>>,
}

async fn spawn_stub_supervisor(stub: Arc<StubSupervisor>) -> SocketAddr {
    async fn start_task(
        State(stub): State<Arc<StubSupervisor>>,
        Json(_param): Json<StartTaskParam>,
    ) -> Json<bool> {
        stub.started.fetch_add(1, Ordering::SeqCst);
        Json(true)
    }

    async fn get_task(
        State(_stub): State<Arc<StubSupervisor>>,
        Json(param): Json<GetTaskParam>,
    ) -> Json<Option<SchedTask>> {
        Json(Some(SchedTask::create(
            param.task_id,
            1,
            1,
            1,
            r#"{"cmd":"echo","args":["checkpointed"]}"#.to_string(),
            None,
            Utc::now(),
        )))
    }

    async fn terminate_task(
        State(stub): State<Arc<StubSupervisor>>,
        Json(param): Json<TerminateTaskParam>,
    ) -> Json<bool> {
        stub.terminated
            .lock()
            .unwrap()
            .push((param.task_id, param.to_state));
        Json(true)
    }

    async fn checkpoint(
        State(stub): State<Arc<StubSupervisor>>,
        Json(param): Json<flowjob_core::param::CheckpointParam>,
    ) -> Json<bool> {
        stub.checkpoints.lock().unwrap().push(param.execute_snapshot);
        Json(true)
    }

    async fn update_task_worker(
        State(_stub): State<Arc<StubSupervisor>>,
        Json(_params): Json<Vec<flowjob_core::param::TaskWorkerParam>>,
    ) -> Json<bool> {
        Json(true)
    }

    let router = Router::new()
        .route("/supervisor/rpc/start_task", post(start_task))
        .route("/supervisor/rpc/get_task", post(get_task))
        .route("/supervisor/rpc/terminate_task", post(terminate_task))
        .route("/supervisor/rpc/checkpoint", post(checkpoint))
        .route("/supervisor/rpc/update_task_worker", post(update_task_worker))
        .with_state(stub);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn trigger_param(task_id: i64, executor: &str, worker: &Worker) -> ExecuteTaskParam {
    ExecuteTaskParam {
        operation: Operation::Trigger,
        task_id,
        instance_id: 1,
        wnstance_id: None,
        job_id: 1,
        job_type: JobType::Normal,
        group: worker.group.clone(),
        route_strategy: RouteStrategy::RoundRobin,
        trigger_time: Utc::now().timestamp_millis(),
        execute_timeout_ms: 0,
        executor: executor.to_string(),
        job_param: String::new(),
        worker: Some(worker.clone()),
    }
}

async fn build_runner(addr: SocketAddr) -> (Arc<WorkerRunner>, Worker) {
    let worker = Worker::new("default", "w-test", "127.0.0.1", 18082);
    let (events, _) = broadcast::channel(4);
    let registry = Arc::new(StaticRegistry {
        snapshot: Arc::new(DiscoveredServers::from_servers(vec![
            RegistryServer::Supervisor(Supervisor::new(addr.ip().to_string(), addr.port())),
        ])),
        events,
    });
    let http = HttpConfig {
        connect_timeout_ms: 500,
        read_timeout_ms: 1_000,
        max_retry_times: 1,
        retry_backoff_ms: 10,
    };
    let client = Arc::new(
        SupervisorClient::new(registry, &http, worker.clone(), "").unwrap(),
    );
    let wheel = Arc::new(TimingWheel::new(20, 16));
    let runner = WorkerRunner::new(wheel, Arc::new(ExecutorRegistry::with_builtins()), client, 4);
    (runner, worker)
}

async fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

#[tokio::test]
async fn test_noop_task_completes_end_to_end() {
    let stub = Arc::new(StubSupervisor::default());
    let addr = spawn_stub_supervisor(Arc::clone(&stub)).await;
    let (runner, worker) = build_runner(addr).await;
    runner.start();

    assert!(runner.wheel().offer(trigger_param(100, "noop", &worker), &worker));

    let done = wait_for(
        || !stub.terminated.lock().unwrap().is_empty(),
        Duration::from_secs(3),
    )
    .await;
    assert!(done, "任务未在期限内上报终态");
    assert_eq!(stub.started.load(Ordering::SeqCst), 1);
    let terminated = stub.terminated.lock().unwrap();
    assert_eq!(terminated[0], (100, ExecuteState::Completed));

    runner.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_unknown_executor_reports_init_exception() {
    let stub = Arc::new(StubSupervisor::default());
    let addr = spawn_stub_supervisor(Arc::clone(&stub)).await;
    let (runner, worker) = build_runner(addr).await;
    runner.start();

    assert!(runner
        .wheel()
        .offer(trigger_param(200, "not-registered", &worker), &worker));

    let done = wait_for(
        || !stub.terminated.lock().unwrap().is_empty(),
        Duration::from_secs(3),
    )
    .await;
    assert!(done);
    let terminated = stub.terminated.lock().unwrap();
    assert_eq!(terminated[0].0, 200);
    assert_eq!(terminated[0].1, ExecuteState::InitException);

    runner.shutdown(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_command_output_saved_as_checkpoint() {
    let stub = Arc::new(StubSupervisor::default());
    let addr = spawn_stub_supervisor(Arc::clone(&stub)).await;
    let (runner, worker) = build_runner(addr).await;
    runner.start();

    assert!(runner
        .wheel()
        .offer(trigger_param(300, "command", &worker), &worker));

    let done = wait_for(
        || !stub.terminated.lock().unwrap().is_empty(),
        Duration::from_secs(3),
    )
    .await;
    assert!(done);
    let terminated = stub.terminated.lock().unwrap();
    assert_eq!(terminated[0], (300, ExecuteState::Completed));
    let checkpoints = stub.checkpoints.lock().unwrap();
    assert!(checkpoints.iter().any(|s| s.contains("checkpointed")));

    runner.shutdown(Duration::from_millis(200)).await;
}
