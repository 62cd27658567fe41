//! flowjob 服务注册与发现
//!
//! 节点以临时会话方式注册（TTL 续约），对端角色的节点列表通过
//! 推（pub/sub 或阻塞查询）加拉（周期刷新）两条通路维护。
//! 推送仅作提示，周期拉取才是权威数据源。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use flowjob_core::{SchedError, SchedResult, Supervisor, Worker};

pub mod consul;
pub mod redis;
pub mod rpc;

/// 节点角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    Supervisor,
    Worker,
}

impl ServerRole {
    pub fn name(self) -> &'static str {
        match self {
            ServerRole::Supervisor => "supervisor",
            ServerRole::Worker => "worker",
        }
    }

    /// 注册表键："{namespace}:registry:{role}"
    pub fn registry_key(self, namespace: &str) -> String {
        format!("{namespace}:registry:{}", self.name())
    }

    /// 变更通知通道："{namespace}:discovery:{role}:channel"
    pub fn channel(self, namespace: &str) -> String {
        format!("{namespace}:discovery:{}:channel", self.name())
    }
}

/// 注册中心中的节点，两种角色的统一包装
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryServer {
    Supervisor(Supervisor),
    Worker(Worker),
}

impl RegistryServer {
    pub fn role(&self) -> ServerRole {
        match self {
            RegistryServer::Supervisor(_) => ServerRole::Supervisor,
            RegistryServer::Worker(_) => ServerRole::Worker,
        }
    }

    pub fn serialize(&self) -> String {
        match self {
            RegistryServer::Supervisor(s) => s.serialize(),
            RegistryServer::Worker(w) => w.serialize(),
        }
    }

    pub fn deserialize(role: ServerRole, text: &str) -> SchedResult<Self> {
        match role {
            ServerRole::Supervisor => Ok(Self::Supervisor(Supervisor::deserialize(text)?)),
            ServerRole::Worker => Ok(Self::Worker(Worker::deserialize(text)?)),
        }
    }
}

impl fmt::Display for RegistryServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

/// 注册/注销事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Register,
    Deregister,
}

impl EventType {
    pub fn name(self) -> &'static str {
        match self {
            EventType::Register => "REGISTER",
            EventType::Deregister => "DEREGISTER",
        }
    }

    pub fn parse(text: &str) -> SchedResult<Self> {
        match text {
            "REGISTER" => Ok(EventType::Register),
            "DEREGISTER" => Ok(EventType::Deregister),
            other => Err(SchedError::registry(format!("未知的注册事件: {other}"))),
        }
    }
}

/// 推送到订阅方的变更事件
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub event_type: EventType,
    pub server: RegistryServer,
}

/// 已发现节点的不可变快照，读方无锁
#[derive(Debug, Default)]
pub struct DiscoveredServers {
    supervisors: Vec<Supervisor>,
    workers: Vec<Worker>,
}

impl DiscoveredServers {
    pub fn from_servers(servers: Vec<RegistryServer>) -> Self {
        let mut supervisors = Vec::new();
        let mut workers = Vec::new();
        for server in servers {
            match server {
                RegistryServer::Supervisor(s) => supervisors.push(s),
                RegistryServer::Worker(w) => workers.push(w),
            }
        }
        supervisors.sort();
        workers.sort();
        Self { supervisors, workers }
    }

    pub fn supervisors(&self) -> &[Supervisor] {
        &self.supervisors
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn workers_of_group(&self, group: &str) -> Vec<Worker> {
        self.workers
            .iter()
            .filter(|w| w.group == group)
            .cloned()
            .collect()
    }

    pub fn has_workers(&self, group: Option<&str>) -> bool {
        match group {
            Some(g) => self.workers.iter().any(|w| w.group == g),
            None => !self.workers.is_empty(),
        }
    }

    /// 快照成员判定，O(log n)
    pub fn is_alive_worker(&self, worker: &Worker) -> bool {
        self.workers.binary_search(worker).is_ok()
    }

    pub fn is_alive_supervisor(&self, supervisor: &Supervisor) -> bool {
        self.supervisors.binary_search(supervisor).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty() && self.workers.is_empty()
    }
}

/// 按配置选择注册中心实现
pub async fn build_registry(
    config: &flowjob_core::config::AppConfig,
    self_server: RegistryServer,
    discovery_role: ServerRole,
) -> SchedResult<Arc<dyn ServerRegistry>> {
    match config.registry.backend.as_str() {
        "redis" => {
            let registry =
                redis::RedisServerRegistry::new(&config.registry, self_server, discovery_role)
                    .await?;
            Ok(registry as Arc<dyn ServerRegistry>)
        }
        "consul" => {
            let registry =
                consul::ConsulServerRegistry::new(&config.registry, self_server, discovery_role)
                    .await?;
            Ok(registry as Arc<dyn ServerRegistry>)
        }
        other => Err(SchedError::config(format!("未知的注册中心类型: {other}"))),
    }
}

/// 注册到发现列表的地址：bind 是通配地址时取主机名
pub fn local_host(bind_host: &str) -> String {
    if bind_host == "0.0.0.0" || bind_host.is_empty() {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "127.0.0.1".to_string())
    } else {
        bind_host.to_string()
    }
}

/// 注册中心契约
///
/// 实现负责：自身注册的幂等续约、对端角色节点的惰性刷新
/// （任何一次 discovered() 读在 next_refresh_time 过期后都会触发拉取）、
/// 以及注销时的即刻广播。
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    /// 幂等注册自身
    async fn register(&self) -> SchedResult<()>;

    /// 幂等注销自身
    async fn deregister(&self) -> SchedResult<()>;

    /// 惰性刷新后的对端节点快照
    async fn discovered(&self) -> SchedResult<Arc<DiscoveredServers>>;

    /// 订阅对端节点的注册/注销事件（提示性，不保证送达）
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;

    /// 停止后台任务并注销
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_keys() {
        assert_eq!(
            ServerRole::Worker.registry_key("flowjob"),
            "flowjob:registry:worker"
        );
        assert_eq!(
            ServerRole::Supervisor.channel("flowjob"),
            "flowjob:discovery:supervisor:channel"
        );
    }

    #[test]
    fn test_event_type_round_trip() {
        assert_eq!(EventType::parse("REGISTER").unwrap(), EventType::Register);
        assert_eq!(EventType::parse("DEREGISTER").unwrap(), EventType::Deregister);
        assert!(EventType::parse("UNKNOWN").is_err());
    }

    #[test]
    fn test_registry_server_round_trip() {
        let worker = RegistryServer::Worker(Worker::new("g1", "w1", "10.0.0.1", 80));
        let text = worker.serialize();
        assert_eq!(
            RegistryServer::deserialize(ServerRole::Worker, &text).unwrap(),
            worker
        );
        assert!(RegistryServer::deserialize(ServerRole::Supervisor, &text).is_err());
    }

    #[test]
    fn test_discovered_servers_group_filter_and_liveness() {
        let w1 = Worker::new("g1", "a", "h1", 80);
        let w2 = Worker::new("g1", "b", "h2", 80);
        let w3 = Worker::new("g2", "c", "h3", 80);
        let snapshot = DiscoveredServers::from_servers(vec![
            RegistryServer::Worker(w3.clone()),
            RegistryServer::Worker(w1.clone()),
            RegistryServer::Worker(w2.clone()),
        ]);

        assert_eq!(snapshot.workers_of_group("g1"), vec![w1.clone(), w2.clone()]);
        assert!(snapshot.has_workers(Some("g2")));
        assert!(!snapshot.has_workers(Some("g9")));
        assert!(snapshot.is_alive_worker(&w2));
        assert!(!snapshot.is_alive_worker(&Worker::new("g1", "zz", "h9", 80)));
    }
}
