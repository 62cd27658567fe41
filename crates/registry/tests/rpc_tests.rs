//! DiscoveryClient 负载均衡与重试行为验证（本地 axum 桩服务）

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::broadcast;

use flowjob_core::config::HttpConfig;
use flowjob_core::{SchedResult, Supervisor, Worker};
use flowjob_registry::rpc::{DiscoveryClient, WorkerAuth, AUTH_SIGNATURE_HEADER};
use flowjob_registry::{DiscoveredServers, RegistryEvent, RegistryServer, ServerRegistry};

/// 固定快照的注册中心桩
struct StaticRegistry {
    snapshot: Arc<DiscoveredServers>,
    events: broadcast::Sender<RegistryEvent>,
}

impl StaticRegistry {
    fn new(servers: Vec<RegistryServer>) -> Arc<Self> {
        let (events, _) = broadcast::channel(4);
        Arc::new(Self {
            snapshot: Arc::new(DiscoveredServers::from_servers(servers)),
            events,
        })
    }
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

async fn spawn_stub(counter: Arc<AtomicUsize>, ok: bool) -> SocketAddr {
    let router = Router::new().route(
        "/supervisor/rpc/echo",
        post(move |Json(value): Json<i64>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if ok {
                    Ok(Json(value * 2))
                } else {
                    Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn http_config() -> HttpConfig {
    HttpConfig {
        connect_timeout_ms: 500,
        read_timeout_ms: 1_000,
        max_retry_times: 3,
        retry_backoff_ms: 10,
    }
}

#[tokio::test]
async fn test_discovery_client_invokes_supervisor() {
    let counter = Arc::new(AtomicUsize::new(0));
    let addr = spawn_stub(Arc::clone(&counter), true).await;

    let registry = StaticRegistry::new(vec![RegistryServer::Supervisor(Supervisor::new(
        addr.ip().to_string(),
        addr.port(),
    ))]);
    let client = DiscoveryClient::new(registry, &http_config(), None).unwrap();

    let doubled: i64 = client
        .post_supervisor("/supervisor/rpc/echo", &21i64)
        .await
        .unwrap();
    assert_eq!(doubled, 42);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_discovery_client_rotates_past_failing_server() {
    let good_counter = Arc::new(AtomicUsize::new(0));
    let bad_counter = Arc::new(AtomicUsize::new(0));
    let good = spawn_stub(Arc::clone(&good_counter), true).await;
    let bad = spawn_stub(Arc::clone(&bad_counter), false).await;

    let registry = StaticRegistry::new(vec![
        RegistryServer::Supervisor(Supervisor::new(good.ip().to_string(), good.port())),
        RegistryServer::Supervisor(Supervisor::new(bad.ip().to_string(), bad.port())),
    ]);
    let client = DiscoveryClient::new(registry, &http_config(), None).unwrap();

    // 随机起点 + 轮转，最终必然落到健康节点
    for _ in 0..4 {
        let result: i64 = client
            .post_supervisor("/supervisor/rpc/echo", &1i64)
            .await
            .unwrap();
        assert_eq!(result, 2);
    }
    assert!(good_counter.load(Ordering::SeqCst) >= 4);
}

#[tokio::test]
async fn test_discovery_client_fails_without_servers() {
    let registry = StaticRegistry::new(Vec::new());
    let client = DiscoveryClient::new(registry, &http_config(), None).unwrap();
    let result: SchedResult<i64> = client.post_supervisor("/supervisor/rpc/echo", &1i64).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_worker_auth_headers_attached() {
    let seen_signature = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&seen_signature);
    let router = Router::new().route(
        "/supervisor/rpc/echo",
        post(move |headers: axum::http::HeaderMap, Json(value): Json<i64>| {
            let seen = Arc::clone(&seen);
            async move {
                if headers.contains_key(AUTH_SIGNATURE_HEADER) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                Json(value)
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let registry = StaticRegistry::new(vec![RegistryServer::Supervisor(Supervisor::new(
        addr.ip().to_string(),
        addr.port(),
    ))]);
    let auth = WorkerAuth::new("g1", "token");
    let client = DiscoveryClient::new(registry, &http_config(), Some(auth)).unwrap();
    let _: i64 = client
        .post_supervisor("/supervisor/rpc/echo", &7i64)
        .await
        .unwrap();
    assert_eq!(seen_signature.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_snapshot_group_isolation() {
    let registry = StaticRegistry::new(vec![
        RegistryServer::Worker(Worker::new("g1", "a", "h1", 1)),
        RegistryServer::Worker(Worker::new("g2", "b", "h2", 2)),
    ]);
    let snapshot = registry.discovered().await.unwrap();
    assert_eq!(snapshot.workers_of_group("g1").len(), 1);
    assert_eq!(snapshot.workers_of_group("g3").len(), 0);
}
