use std::sync::Mutex;

use chrono::Utc;

use crate::error::{SchedError, SchedResult};

/// 毫秒时间戳位数之外的布局：10 位节点 id + 12 位序列号
const NODE_ID_BITS: u8 = 10;
const SEQUENCE_BITS: u8 = 12;
const MAX_NODE_ID: i64 = (1 << NODE_ID_BITS) - 1;
const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;

/// 自定义纪元：2024-01-01T00:00:00Z
const EPOCH_MS: i64 = 1_704_067_200_000;

/// snowflake 风格的分布式 id 生成器
///
/// 同一毫秒内的并发由序列号区分，序列号耗尽时自旋等待下一毫秒。
/// 时钟小幅回拨沿用上次时间戳继续发号。
pub struct IdGenerator {
    node_id: i64,
    state: Mutex<State>,
}

struct State {
    last_timestamp: i64,
    sequence: i64,
}

impl IdGenerator {
    pub fn new(node_id: i64) -> SchedResult<Self> {
        if !(0..=MAX_NODE_ID).contains(&node_id) {
            return Err(SchedError::config(format!(
                "节点 id 超出范围 [0, {MAX_NODE_ID}]: {node_id}"
            )));
        }
        Ok(Self {
            node_id,
            state: Mutex::new(State {
                last_timestamp: 0,
                sequence: 0,
            }),
        })
    }

    pub fn generate(&self) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut now = Utc::now().timestamp_millis();
        if now < state.last_timestamp {
            now = state.last_timestamp;
        }
        if now == state.last_timestamp {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // 序列号耗尽，推进到下一毫秒
                while now <= state.last_timestamp {
                    now = Utc::now().timestamp_millis();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_timestamp = now;

        ((now - EPOCH_MS) << (NODE_ID_BITS + SEQUENCE_BITS))
            | (self.node_id << SEQUENCE_BITS)
            | state.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_monotonic_and_unique() {
        let generator = IdGenerator::new(1).unwrap();
        let mut seen = HashSet::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let id = generator.generate();
            assert!(id > 0);
            assert!(id >= last);
            assert!(seen.insert(id));
            last = id;
        }
    }

    #[test]
    fn test_node_id_bounds() {
        assert!(IdGenerator::new(0).is_ok());
        assert!(IdGenerator::new(MAX_NODE_ID).is_ok());
        assert!(IdGenerator::new(MAX_NODE_ID + 1).is_err());
        assert!(IdGenerator::new(-1).is_err());
    }

    #[test]
    fn test_node_id_embedded() {
        let generator = IdGenerator::new(42).unwrap();
        let id = generator.generate();
        assert_eq!((id >> SEQUENCE_BITS) & MAX_NODE_ID, 42);
    }
}
