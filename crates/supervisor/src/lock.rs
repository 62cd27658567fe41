use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use sqlx::{PgConnection, PgPool};
use tokio::sync::{Mutex, OwnedMutexGuard};

use flowjob_core::SchedResult;

/// 进程内实例锁池
///
/// 按 `wnstance_id ?? instance_id` 分片加锁，同一 key 总是落到同一把锁，
/// 用于在进入数据库行锁之前先在进程内串行化，避免锁等待风暴。
pub struct InternLockPool {
    shards: Vec<Arc<Mutex<()>>>,
}

impl InternLockPool {
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Arc::new(Mutex::new(())))
            .collect();
        Self { shards }
    }

    pub async fn lock(&self, key: i64) -> OwnedMutexGuard<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        Arc::clone(&self.shards[index]).lock_owned().await
    }
}

impl Default for InternLockPool {
    fn default() -> Self {
        Self::new(64)
    }
}

/// 集群级互斥：Postgres advisory lock
///
/// 每个扫描器持有独立的 key，同一时刻全集群只有一个副本在扫。
/// 连接放回池子时锁自动释放，不依赖调用方显式解锁。
pub struct ClusterLock {
    pool: PgPool,
    key: i64,
}

impl ClusterLock {
    pub fn new(pool: PgPool, name: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self {
            pool,
            key: hasher.finish() as i64,
        }
    }

    /// 尝试获取集群锁并在持有期间执行回调；未抢到返回 None
    pub async fn try_locked<T, F, Fut>(&self, action: F) -> SchedResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = SchedResult<T>>,
    {
        let mut conn = self.pool.acquire().await?;
        if !try_advisory_lock(&mut conn, self.key).await? {
            return Ok(None);
        }
        let result = action().await;
        // 显式释放，连接异常中断时由会话终结兜底
        let _ = advisory_unlock(&mut conn, self.key).await;
        result.map(Some)
    }
}

async fn try_advisory_lock(conn: &mut PgConnection, key: i64) -> SchedResult<bool> {
    let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(key)
        .fetch_one(conn)
        .await?;
    Ok(locked)
}

async fn advisory_unlock(conn: &mut PgConnection, key: i64) -> SchedResult<bool> {
    let unlocked: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .fetch_one(conn)
        .await?;
    Ok(unlocked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[tokio::test]
    async fn test_same_key_serializes() {
        let pool = Arc::new(InternLockPool::new(8));
        let counter = Arc::new(AtomicI32::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let _guard = pool.lock(42).await;
                let value = counter.load(Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.store(value + 1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 若不串行，read-modify-write 会互相覆盖导致丢数
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn test_different_keys_may_proceed() {
        let pool = InternLockPool::new(64);
        let _a = pool.lock(1).await;
        // 不同 key 大概率在不同分片上，拿得到就说明没有全局互斥
        let result = tokio::time::timeout(std::time::Duration::from_millis(200), async {
            let mut acquired = false;
            for key in 2..100 {
                if let Ok(_guard) =
                    tokio::time::timeout(std::time::Duration::from_millis(5), pool.lock(key)).await
                {
                    acquired = true;
                    break;
                }
            }
            acquired
        })
        .await;
        assert!(matches!(result, Ok(true)));
    }
}
