use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use rand::Rng;
use reqwest::StatusCode;
use ring::hmac;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use flowjob_core::config::HttpConfig;
use flowjob_core::{SchedError, SchedResult, Supervisor, Worker};

use crate::ServerRegistry;

pub const AUTH_GROUP_HEADER: &str = "X-Flowjob-Auth-Group";
pub const AUTH_TIMESTAMP_HEADER: &str = "X-Flowjob-Auth-Timestamp";
pub const AUTH_NONCE_HEADER: &str = "X-Flowjob-Auth-Nonce";
pub const AUTH_SIGNATURE_HEADER: &str = "X-Flowjob-Auth-Signature";

/// 签名的最大时钟偏移
const MAX_TIMESTAMP_SKEW_MS: i64 = 5 * 60 * 1000;

/// Worker → Supervisor 请求的签名器
///
/// Signature = base64(HMAC-SHA256(token, group || timestamp || nonce))。
/// 其余方向的调用不携带鉴权头。
#[derive(Debug, Clone)]
pub struct WorkerAuth {
    pub group: String,
    token: String,
}

impl WorkerAuth {
    pub fn new<G: Into<String>, T: Into<String>>(group: G, token: T) -> Self {
        Self {
            group: group.into(),
            token: token.into(),
        }
    }

    pub fn sign_headers(&self) -> Vec<(&'static str, String)> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let nonce = format!("{:016x}", rand::thread_rng().gen::<u64>());
        let signature = compute_signature(&self.token, &self.group, &timestamp, &nonce);
        vec![
            (AUTH_GROUP_HEADER, self.group.clone()),
            (AUTH_TIMESTAMP_HEADER, timestamp),
            (AUTH_NONCE_HEADER, nonce),
            (AUTH_SIGNATURE_HEADER, signature),
        ]
    }
}

pub fn compute_signature(token: &str, group: &str, timestamp: &str, nonce: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, token.as_bytes());
    let message = format!("{group}{timestamp}{nonce}");
    let tag = hmac::sign(&key, message.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(tag.as_ref())
}

/// Supervisor 侧校验签名；时间戳超窗或签名不符都判为认证失败
pub fn verify_signature(
    token: &str,
    group: &str,
    timestamp: &str,
    nonce: &str,
    signature: &str,
) -> SchedResult<()> {
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| SchedError::Authentication(format!("无效的时间戳: {timestamp}")))?;
    if (Utc::now().timestamp_millis() - ts).abs() > MAX_TIMESTAMP_SKEW_MS {
        return Err(SchedError::Authentication("签名时间戳超出允许偏移".to_string()));
    }
    let provided = base64::engine::general_purpose::STANDARD
        .decode(signature)
        .map_err(|_| SchedError::Authentication("签名不是合法的base64".to_string()))?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, token.as_bytes());
    let message = format!("{group}{timestamp}{nonce}");
    hmac::verify(&key, message.as_bytes(), &provided)
        .map_err(|_| SchedError::Authentication("签名校验失败".to_string()))
}

/// 单次调用的错误分类
fn classify_status(status: StatusCode) -> SchedError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        SchedError::network(format!("HTTP {status}"))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        SchedError::Authentication(format!("HTTP {status}"))
    } else {
        SchedError::internal(format!("HTTP {status}"))
    }
}

/// 点对点 RPC 客户端，带线性退避重试
///
/// 网络错误与 5xx 重试，第 i 次重试前等待 (i+1)×backoff；
/// 408/429 之外的 4xx 快速失败。
#[derive(Clone)]
pub struct DestinationClient {
    http: reqwest::Client,
    max_retry_times: u32,
    retry_backoff_ms: u64,
    auth: Option<WorkerAuth>,
}

impl DestinationClient {
    pub fn new(config: &HttpConfig, auth: Option<WorkerAuth>) -> SchedResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(
                config.connect_timeout_ms + config.read_timeout_ms,
            ))
            .build()
            .map_err(|e| SchedError::network(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            http,
            max_retry_times: config.max_retry_times,
            retry_backoff_ms: config.retry_backoff_ms,
            auth,
        })
    }

    /// 对指定节点发起 POST，失败按策略重试
    pub async fn post<B, R>(&self, host: &str, port: u16, path: &str, body: &B) -> SchedResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("http://{host}:{port}{path}");
        let mut last_error = SchedError::network(format!("未发起请求: {url}"));
        for i in 0..=self.max_retry_times {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(
                    self.retry_backoff_ms * u64::from(i),
                ))
                .await;
            }
            match self.post_once(&url, body).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => {
                    warn!("RPC调用失败将重试({}/{}): {} | {}", i, self.max_retry_times, url, e);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    pub async fn post_once<B, R>(&self, url: &str, body: &B) -> SchedResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.http.post(url).json(body);
        if let Some(auth) = &self.auth {
            for (name, value) in auth.sign_headers() {
                request = request.header(name, value);
            }
        }
        let response = request
            .send()
            .await
            .map_err(|e| SchedError::network(format!("请求失败: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| SchedError::network(format!("响应解析失败: {e}")))
    }

    pub async fn get<R>(&self, host: &str, port: u16, path: &str) -> SchedResult<R>
    where
        R: DeserializeOwned,
    {
        let url = format!("http://{host}:{port}{path}");
        let mut request = self.http.get(&url);
        if let Some(auth) = &self.auth {
            for (name, value) in auth.sign_headers() {
                request = request.header(name, value);
            }
        }
        let response = request
            .send()
            .await
            .map_err(|e| SchedError::network(format!("请求失败: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| SchedError::network(format!("响应解析失败: {e}")))
    }
}

/// 基于发现列表的分组负载均衡 RPC 客户端
///
/// 随机起点 + 重试轮转，不可重试错误立即停止。
pub struct DiscoveryClient {
    registry: Arc<dyn ServerRegistry>,
    inner: DestinationClient,
    max_retry_times: u32,
    retry_backoff_ms: u64,
}

impl DiscoveryClient {
    pub fn new(
        registry: Arc<dyn ServerRegistry>,
        config: &HttpConfig,
        auth: Option<WorkerAuth>,
    ) -> SchedResult<Self> {
        Ok(Self {
            registry,
            inner: DestinationClient::new(config, auth)?,
            max_retry_times: config.max_retry_times,
            retry_backoff_ms: config.retry_backoff_ms,
        })
    }

    /// 对任一存活 Supervisor 发起 POST
    pub async fn post_supervisor<B, R>(&self, path: &str, body: &B) -> SchedResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let snapshot = self.registry.discovered().await?;
        let servers: Vec<Supervisor> = snapshot.supervisors().to_vec();
        self.invoke_balanced(path, body, servers, |s| (s.host.clone(), s.port))
            .await
    }

    /// 对指定分组的任一存活 Worker 发起 POST
    pub async fn post_worker<B, R>(&self, group: &str, path: &str, body: &B) -> SchedResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let snapshot = self.registry.discovered().await?;
        let servers: Vec<Worker> = snapshot.workers_of_group(group);
        self.invoke_balanced(path, body, servers, |w| (w.host.clone(), w.port))
            .await
    }

    async fn invoke_balanced<S, B, R, F>(
        &self,
        path: &str,
        body: &B,
        servers: Vec<S>,
        endpoint: F,
    ) -> SchedResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
        F: Fn(&S) -> (String, u16),
    {
        if servers.is_empty() {
            return Err(SchedError::registry(format!("没有可用节点: {path}")));
        }
        let count = servers.len();
        let start = rand::thread_rng().gen_range(0..count);
        let attempts = count.min(self.max_retry_times as usize) + 1;
        let mut last_error = SchedError::network(format!("未发起请求: {path}"));
        for i in 0..attempts {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(self.retry_backoff_ms * i as u64)).await;
            }
            let (host, port) = endpoint(&servers[(start + i) % count]);
            let url = format!("http://{host}:{port}{path}");
            match self.inner.post_once(&url, body).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => {
                    debug!("负载均衡调用失败轮转下一节点: {} | {}", url, e);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_round_trip() {
        let signature = compute_signature("secret", "g1", "1700000000000", "abcd");
        assert!(verify_signature("secret", "g1", "1700000000000", "abcd", &signature)
            .unwrap_err()
            .to_string()
            .contains("时间戳"));

        // 用当前时间戳则校验通过
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = compute_signature("secret", "g1", &timestamp, "abcd");
        assert!(verify_signature("secret", "g1", &timestamp, "abcd", &signature).is_ok());
        assert!(verify_signature("wrong", "g1", &timestamp, "abcd", &signature).is_err());
        assert!(verify_signature("secret", "g2", &timestamp, "abcd", &signature).is_err());
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR).is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT).is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST).is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED).is_retryable());
    }

    #[test]
    fn test_sign_headers_complete() {
        let auth = WorkerAuth::new("g1", "token");
        let headers = auth.sign_headers();
        let names: Vec<&str> = headers.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec![
                AUTH_GROUP_HEADER,
                AUTH_TIMESTAMP_HEADER,
                AUTH_NONCE_HEADER,
                AUTH_SIGNATURE_HEADER
            ]
        );
    }
}
