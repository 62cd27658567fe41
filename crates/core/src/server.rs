use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

const SEP: char = ':';

/// Supervisor 节点端点
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Supervisor {
    pub host: String,
    pub port: u16,
}

impl Supervisor {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// 序列化为注册中心存储格式 "host:port"
    pub fn serialize(&self) -> String {
        format!("{}{}{}", self.host, SEP, self.port)
    }

    pub fn deserialize(text: &str) -> SchedResult<Self> {
        let mut parts = text.split(SEP);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), None) if !host.is_empty() => Ok(Self {
                host: host.to_string(),
                port: port
                    .parse()
                    .map_err(|_| SchedError::registry(format!("无效的Supervisor端口: {text}")))?,
            }),
            _ => Err(SchedError::registry(format!("无效的Supervisor序列化值: {text}"))),
        }
    }
}

impl fmt::Display for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

/// Worker 节点端点，带分组与实例标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Worker {
    pub group: String,
    pub worker_id: String,
    pub host: String,
    pub port: u16,
}

impl Worker {
    pub fn new<G, I, H>(group: G, worker_id: I, host: H, port: u16) -> Self
    where
        G: Into<String>,
        I: Into<String>,
        H: Into<String>,
    {
        Self {
            group: group.into(),
            worker_id: worker_id.into(),
            host: host.into(),
            port,
        }
    }

    /// 序列化为注册中心存储格式 "group:workerId:host:port"
    pub fn serialize(&self) -> String {
        format!(
            "{}{SEP}{}{SEP}{}{SEP}{}",
            self.group, self.worker_id, self.host, self.port
        )
    }

    pub fn deserialize(text: &str) -> SchedResult<Self> {
        let parts: Vec<&str> = text.split(SEP).collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(SchedError::registry(format!("无效的Worker序列化值: {text}")));
        }
        Ok(Self {
            group: parts[0].to_string(),
            worker_id: parts[1].to_string(),
            host: parts[2].to_string(),
            port: parts[3]
                .parse()
                .map_err(|_| SchedError::registry(format!("无效的Worker端口: {text}")))?,
        })
    }

    /// 同一节点判定：group 与地址一致即视为同一 Worker（worker_id 随重启变化）
    pub fn same_server(&self, other: &Worker) -> bool {
        self.group == other.group && self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supervisor_round_trip() {
        let s = Supervisor::new("10.0.0.1", 8081);
        assert_eq!(s.serialize(), "10.0.0.1:8081");
        assert_eq!(Supervisor::deserialize("10.0.0.1:8081").unwrap(), s);
        assert!(Supervisor::deserialize("10.0.0.1").is_err());
        assert!(Supervisor::deserialize("10.0.0.1:abc").is_err());
    }

    #[test]
    fn test_worker_round_trip() {
        let w = Worker::new("default", "w-01", "10.0.0.2", 8082);
        assert_eq!(w.serialize(), "default:w-01:10.0.0.2:8082");
        assert_eq!(Worker::deserialize(&w.serialize()).unwrap(), w);
        assert!(Worker::deserialize("default:w-01:10.0.0.2").is_err());
    }

    #[test]
    fn test_worker_same_server_ignores_worker_id() {
        let a = Worker::new("g", "w-1", "h", 80);
        let b = Worker::new("g", "w-2", "h", 80);
        let c = Worker::new("g2", "w-1", "h", 80);
        assert!(a.same_server(&b));
        assert!(!a.same_server(&c));
    }
}
