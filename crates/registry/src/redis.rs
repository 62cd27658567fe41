use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use flowjob_core::config::RegistryConfig;
use flowjob_core::{SchedError, SchedResult};

use crate::{
    DiscoveredServers, EventType, RegistryEvent, RegistryServer, ServerRegistry, ServerRole,
};

/// 注册键自身的兜底过期时间（30 天），防止残留
const REDIS_KEY_TTL_MS: i64 = 30 * 86_400 * 1000;

/// 注册：按 score = now + session_timeout 写入有序集合并续键
const REGISTER_SCRIPT: &str = r#"
redis.call('zadd', KEYS[1], ARGV[1], ARGV[3]);
redis.call('pexpire', KEYS[1], ARGV[2]);
"#;

/// 发现：先剔除过期成员，再取存活成员
const DISCOVER_SCRIPT: &str = r#"
redis.call('zremrangebyscore', KEYS[1], '-inf', ARGV[1]);
local ret = redis.call('zrangebyscore', KEYS[1], ARGV[1], '+inf');
redis.call('pexpire', KEYS[1], ARGV[2]);
return ret;
"#;

/// 基于 Redis 有序集合的注册中心
///
/// 会话活性由 score 表达：score = 注册时刻 + session_timeout，每个
/// registry_period 重新断言一次；任何发现读都会先删除过期成员。
/// pub/sub 通道只用来催促刷新，周期拉取才是权威。
pub struct RedisServerRegistry {
    namespace: String,
    self_server: RegistryServer,
    discovery_role: ServerRole,
    session_timeout_ms: i64,
    refresh_period_ms: i64,
    conn: ConnectionManager,
    snapshot: RwLock<Arc<DiscoveredServers>>,
    next_refresh_ms: AtomicI64,
    refresh_mutex: Mutex<()>,
    events_tx: broadcast::Sender<RegistryEvent>,
    closed: AtomicBool,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisServerRegistry {
    pub async fn new(
        config: &RegistryConfig,
        self_server: RegistryServer,
        discovery_role: ServerRole,
    ) -> SchedResult<Arc<Self>> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| SchedError::registry(format!("创建Redis客户端失败: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| SchedError::registry(format!("连接Redis失败: {e}")))?;

        let (events_tx, _) = broadcast::channel(64);
        let registry = Arc::new(Self {
            namespace: config.namespace.clone(),
            self_server,
            discovery_role,
            session_timeout_ms: config.session_timeout_ms as i64,
            refresh_period_ms: config.effective_refresh_period_ms() as i64,
            conn,
            snapshot: RwLock::new(Arc::new(DiscoveredServers::default())),
            next_refresh_ms: AtomicI64::new(0),
            refresh_mutex: Mutex::new(()),
            events_tx,
            closed: AtomicBool::new(false),
            background_tasks: Mutex::new(Vec::new()),
        });

        registry.refresh().await?;

        let renew = tokio::spawn(Self::renew_loop(
            Arc::clone(&registry),
            config.registry_period_ms,
        ));
        let listen = tokio::spawn(Self::subscribe_loop(Arc::clone(&registry), client));
        registry.background_tasks.lock().await.extend([renew, listen]);

        Ok(registry)
    }

    /// 周期性重新断言自身注册
    async fn renew_loop(registry: Arc<Self>, period_ms: u64) {
        let mut ticker = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if registry.closed.load(Ordering::Acquire) {
                return;
            }
            if let Err(e) = registry.do_register().await {
                error!("注册续约失败: {} | {}", registry.self_server, e);
            }
        }
    }

    /// 订阅对端角色的变更通道，收到消息即催促刷新
    async fn subscribe_loop(registry: Arc<Self>, client: redis::Client) {
        let channel = registry.discovery_role.channel(&registry.namespace);
        loop {
            if registry.closed.load(Ordering::Acquire) {
                return;
            }
            let mut pubsub = match client.get_async_connection().await {
                Ok(conn) => conn.into_pubsub(),
                Err(e) => {
                    warn!("建立Redis订阅连接失败: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if let Err(e) = pubsub.subscribe(&channel).await {
                warn!("订阅通道 {} 失败: {}", channel, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                if registry.closed.load(Ordering::Acquire) {
                    return;
                }
                let payload: String = match message.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("解析订阅消息失败: {}", e);
                        continue;
                    }
                };
                registry.handle_message(&payload).await;
            }
            warn!("Redis订阅连接中断，准备重连: {}", channel);
        }
    }

    async fn handle_message(&self, message: &str) {
        info!("收到注册变更消息: {}", message);
        match message.split_once(':') {
            Some((event, server)) => {
                match (
                    EventType::parse(event),
                    RegistryServer::deserialize(self.discovery_role, server),
                ) {
                    (Ok(event_type), Ok(server)) => {
                        let _ = self.events_tx.send(RegistryEvent { event_type, server });
                    }
                    _ => warn!("忽略无法解析的注册变更消息: {}", message),
                }
            }
            None => warn!("忽略格式错误的注册变更消息: {}", message),
        }
        // 推送只用于催促，立即做一次权威拉取
        self.next_refresh_ms.store(0, Ordering::Release);
        if let Err(e) = self.refresh().await {
            error!("订阅触发的发现刷新失败: {}", e);
        }
    }

    async fn do_register(&self) -> SchedResult<()> {
        let key = self.self_server.role().registry_key(&self.namespace);
        let score = Utc::now().timestamp_millis() + self.session_timeout_ms;
        let mut conn = self.conn.clone();
        Script::new(REGISTER_SCRIPT)
            .key(key)
            .arg(score)
            .arg(REDIS_KEY_TTL_MS)
            .arg(self.self_server.serialize())
            .invoke_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| SchedError::registry(format!("注册写入失败: {e}")))
    }

    async fn publish(&self, event_type: EventType) -> SchedResult<()> {
        let channel = self.self_server.role().channel(&self.namespace);
        let payload = format!("{}:{}", event_type.name(), self.self_server.serialize());
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| SchedError::registry(format!("发布注册事件失败: {e}")))
    }

    /// 权威拉取：删除过期成员后全量替换快照
    async fn refresh(&self) -> SchedResult<()> {
        let _guard = self.refresh_mutex.lock().await;
        let key = self.discovery_role.registry_key(&self.namespace);
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();
        let members: Vec<String> = Script::new(DISCOVER_SCRIPT)
            .key(key)
            .arg(now)
            .arg(REDIS_KEY_TTL_MS)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| SchedError::registry(format!("发现读取失败: {e}")))?;

        if members.is_empty() {
            warn!("未发现存活的{}节点", self.discovery_role.name());
        }

        let mut servers = Vec::with_capacity(members.len());
        for member in &members {
            match RegistryServer::deserialize(self.discovery_role, member) {
                Ok(server) => servers.push(server),
                Err(e) => warn!("忽略无法解析的注册成员 {}: {}", member, e),
            }
        }
        *self.snapshot.write().await = Arc::new(DiscoveredServers::from_servers(servers));
        self.next_refresh_ms
            .store(now + self.refresh_period_ms, Ordering::Release);
        Ok(())
    }

    async fn refresh_if_necessary(&self) -> SchedResult<()> {
        let now = Utc::now().timestamp_millis();
        if self.next_refresh_ms.load(Ordering::Acquire) < now {
            self.refresh().await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ServerRegistry for RedisServerRegistry {
    async fn register(&self) -> SchedResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.do_register().await?;
        self.publish(EventType::Register).await?;
        info!(
            "节点注册成功: {} | {}",
            self.self_server.role().name(),
            self.self_server
        );
        Ok(())
    }

    async fn deregister(&self) -> SchedResult<()> {
        let key = self.self_server.role().registry_key(&self.namespace);
        let mut conn = self.conn.clone();
        redis::cmd("ZREM")
            .arg(key)
            .arg(self.self_server.serialize())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| SchedError::registry(format!("注销失败: {e}")))?;
        if let Err(e) = self.publish(EventType::Deregister).await {
            warn!("注销事件发布失败: {}", e);
        }
        info!(
            "节点注销成功: {} | {}",
            self.self_server.role().name(),
            self.self_server
        );
        Ok(())
    }

    async fn discovered(&self) -> SchedResult<Arc<DiscoveredServers>> {
        self.refresh_if_necessary().await?;
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
