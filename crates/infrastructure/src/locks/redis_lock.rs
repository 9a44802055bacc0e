use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::info;

use orchestrator_domain::{ItemId, LockStore};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

/// 只删除自己持有的锁
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// 基于 `SET NX PX` 的分布式锁，TTL 兜底持有者崩溃的情况
pub struct RedisLockStore {
    conn: ConnectionManager,
    release: Script,
}

impl RedisLockStore {
    pub async fn connect(redis_url: &str) -> OrchestratorResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| OrchestratorError::lock(format!("Failed to create Redis client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| OrchestratorError::lock(format!("Failed to connect to Redis: {e}")))?;
        info!("Successfully connected to Redis lock store at {}", redis_url);
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn lock_key(key: ItemId) -> String {
        format!("orchestrator:lock:{key}")
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(
        &self,
        key: ItemId,
        owner: &str,
        ttl: Duration,
    ) -> OrchestratorResult<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(Self::lock_key(key))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64);
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| OrchestratorError::lock(format!("Redis SET NX failed: {e}")))?;
        if reply.is_some() {
            return Ok(true);
        }
        // 同一持有者重复获取视为成功
        Ok(self.holder(key).await?.as_deref() == Some(owner))
    }

    async fn release(&self, key: ItemId, owner: &str) -> OrchestratorResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(Self::lock_key(key))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| OrchestratorError::lock(format!("Redis release script failed: {e}")))?;
        Ok(deleted > 0)
    }

    async fn holder(&self, key: ItemId) -> OrchestratorResult<Option<String>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("GET");
        cmd.arg(Self::lock_key(key));
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| OrchestratorError::lock(format!("Redis GET failed: {e}")))
    }
}
