use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use flowjob_core::config::RegistryConfig;
use flowjob_core::{SchedError, SchedResult};

use crate::{
    DiscoveredServers, EventType, RegistryEvent, RegistryServer, ServerRegistry, ServerRole,
};

/// 阻塞查询的等待窗口
const BLOCKING_WAIT: &str = "55s";
/// TTL check 的续约周期
const CHECK_PASS_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
}

/// 基于 Consul 的注册中心
///
/// 注册为带 TTL check 的服务，agent 侧每 2 秒 check-pass 一次续活；
/// 发现走 `/v1/health/service` 阻塞查询，X-Consul-Index 变化即驱动刷新。
pub struct ConsulServerRegistry {
    base_url: String,
    namespace: String,
    self_server: RegistryServer,
    discovery_role: ServerRole,
    session_timeout_ms: u64,
    refresh_period_ms: i64,
    http: reqwest::Client,
    snapshot: RwLock<Arc<DiscoveredServers>>,
    next_refresh_ms: AtomicI64,
    events_tx: broadcast::Sender<RegistryEvent>,
    closed: AtomicBool,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsulServerRegistry {
    pub async fn new(
        config: &RegistryConfig,
        self_server: RegistryServer,
        discovery_role: ServerRole,
    ) -> SchedResult<Arc<Self>> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .map_err(|e| SchedError::registry(format!("创建Consul客户端失败: {e}")))?;

        let (events_tx, _) = broadcast::channel(64);
        let registry = Arc::new(Self {
            base_url: config.consul_addr.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            self_server,
            discovery_role,
            session_timeout_ms: config.session_timeout_ms,
            refresh_period_ms: config.effective_refresh_period_ms() as i64,
            http,
            snapshot: RwLock::new(Arc::new(DiscoveredServers::default())),
            next_refresh_ms: AtomicI64::new(0),
            events_tx,
            closed: AtomicBool::new(false),
            background_tasks: Mutex::new(Vec::new()),
        });

        registry.refresh_once().await?;

        let pass = tokio::spawn(Self::check_pass_loop(Arc::clone(&registry)));
        let watch = tokio::spawn(Self::watch_loop(Arc::clone(&registry)));
        registry.background_tasks.lock().await.extend([pass, watch]);

        Ok(registry)
    }

    fn service_name(&self, role: ServerRole) -> String {
        format!("{}-{}", self.namespace, role.name())
    }

    fn service_id(&self) -> String {
        format!(
            "{}-{}",
            self.service_name(self.self_server.role()),
            self.self_server.serialize().replace(':', "-")
        )
    }

    async fn check_pass_loop(registry: Arc<Self>) {
        let url = format!(
            "{}/v1/agent/check/pass/service:{}",
            registry.base_url,
            registry.service_id()
        );
        let mut ticker = tokio::time::interval(CHECK_PASS_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if registry.closed.load(Ordering::Acquire) {
                return;
            }
            match registry.http.put(&url).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => warn!("Consul check-pass 返回 {}", response.status()),
                Err(e) => warn!("Consul check-pass 失败: {}", e),
            }
        }
    }

    /// 长轮询健康服务列表，索引变化即全量替换快照
    async fn watch_loop(registry: Arc<Self>) {
        let mut index: u64 = 0;
        loop {
            if registry.closed.load(Ordering::Acquire) {
                return;
            }
            match registry.blocking_query(index).await {
                Ok((servers, next_index)) => {
                    index = next_index;
                    registry.replace_snapshot(servers).await;
                }
                Err(e) => {
                    warn!("Consul 阻塞查询失败: {}", e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    async fn blocking_query(&self, index: u64) -> SchedResult<(Vec<RegistryServer>, u64)> {
        let url = format!(
            "{}/v1/health/service/{}?passing=true&index={}&wait={}",
            self.base_url,
            self.service_name(self.discovery_role),
            index,
            BLOCKING_WAIT
        );
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(70))
            .send()
            .await
            .map_err(|e| SchedError::registry(format!("Consul 查询失败: {e}")))?;

        let next_index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(index);
        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| SchedError::registry(format!("Consul 响应解析失败: {e}")))?;

        let mut servers = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(tag) = entry.service.tags.first() else {
                continue;
            };
            match RegistryServer::deserialize(self.discovery_role, tag) {
                Ok(server) => servers.push(server),
                Err(e) => warn!("忽略无法解析的Consul服务标签 {}: {}", tag, e),
            }
        }
        Ok((servers, next_index))
    }

    async fn replace_snapshot(&self, servers: Vec<RegistryServer>) {
        let previous = Arc::clone(&*self.snapshot.read().await);
        let next = Arc::new(DiscoveredServers::from_servers(servers.clone()));
        *self.snapshot.write().await = Arc::clone(&next);
        self.next_refresh_ms.store(
            Utc::now().timestamp_millis() + self.refresh_period_ms,
            Ordering::Release,
        );

        // 对比新旧快照，把差量转成提示事件
        let old_set: HashSet<String> = previous
            .workers()
            .iter()
            .map(|w| w.serialize())
            .chain(previous.supervisors().iter().map(|s| s.serialize()))
            .collect();
        let new_set: HashSet<String> = servers.iter().map(|s| s.serialize()).collect();
        for server in &servers {
            if !old_set.contains(&server.serialize()) {
                let _ = self.events_tx.send(RegistryEvent {
                    event_type: EventType::Register,
                    server: server.clone(),
                });
            }
        }
        for gone in old_set.difference(&new_set) {
            if let Ok(server) = RegistryServer::deserialize(self.discovery_role, gone) {
                let _ = self.events_tx.send(RegistryEvent {
                    event_type: EventType::Deregister,
                    server,
                });
            }
        }
    }

    /// 一次性非阻塞查询，用于启动和兜底刷新
    async fn refresh_once(&self) -> SchedResult<()> {
        let (servers, _) = self.blocking_query_immediate().await?;
        self.replace_snapshot(servers).await;
        Ok(())
    }

    async fn blocking_query_immediate(&self) -> SchedResult<(Vec<RegistryServer>, u64)> {
        let url = format!(
            "{}/v1/health/service/{}?passing=true",
            self.base_url,
            self.service_name(self.discovery_role)
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SchedError::registry(format!("Consul 查询失败: {e}")))?;
        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| SchedError::registry(format!("Consul 响应解析失败: {e}")))?;
        let mut servers = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(tag) = entry.service.tags.first() {
                if let Ok(server) = RegistryServer::deserialize(self.discovery_role, tag) {
                    servers.push(server);
                }
            }
        }
        Ok((servers, 0))
    }
}

#[async_trait::async_trait]
impl ServerRegistry for ConsulServerRegistry {
    async fn register(&self) -> SchedResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let (address, port) = match &self.self_server {
            RegistryServer::Supervisor(s) => (s.host.clone(), s.port),
            RegistryServer::Worker(w) => (w.host.clone(), w.port),
        };
        let body = json!({
            "ID": self.service_id(),
            "Name": self.service_name(self.self_server.role()),
            "Tags": [self.self_server.serialize()],
            "Address": address,
            "Port": port,
            "Check": {
                "CheckID": format!("service:{}", self.service_id()),
                "TTL": format!("{}s", self.session_timeout_ms / 1000),
                "DeregisterCriticalServiceAfter": "1m",
            },
        });
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let response = self
            .http
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SchedError::registry(format!("Consul 注册失败: {e}")))?;
        if !response.status().is_success() {
            return Err(SchedError::registry(format!(
                "Consul 注册返回 {}",
                response.status()
            )));
        }
        info!(
            "节点注册成功: {} | {}",
            self.self_server.role().name(),
            self.self_server
        );
        Ok(())
    }

    async fn deregister(&self) -> SchedResult<()> {
        let url = format!(
            "{}/v1/agent/service/deregister/{}",
            self.base_url,
            self.service_id()
        );
        let response = self
            .http
            .put(&url)
            .send()
            .await
            .map_err(|e| SchedError::registry(format!("Consul 注销失败: {e}")))?;
        if !response.status().is_success() {
            return Err(SchedError::registry(format!(
                "Consul 注销返回 {}",
                response.status()
            )));
        }
        info!(
            "节点注销成功: {} | {}",
            self.self_server.role().name(),
            self.self_server
        );
        Ok(())
    }

    async fn discovered(&self) -> SchedResult<Arc<DiscoveredServers>> {
        // 阻塞查询通常会持续推进 next_refresh；超期说明 watch 断链，做一次兜底拉取
        if self.next_refresh_ms.load(Ordering::Acquire) < Utc::now().timestamp_millis() {
            if let Err(e) = self.refresh_once().await {
                error!("Consul 兜底刷新失败: {}", e);
            }
        }
        Ok(Arc::clone(&*self.snapshot.read().await))
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events_tx.subscribe()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            warn!("重复关闭注册中心");
            return;
        }
        for task in self.background_tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Err(e) = self.deregister().await {
            error!("关闭时注销失败: {}", e);
        }
    }
}
