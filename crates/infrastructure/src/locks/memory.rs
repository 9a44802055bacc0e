use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use orchestrator_domain::{ItemId, LockStore};
use orchestrator_errors::OrchestratorResult;

struct Lease {
    owner: String,
    expires_at: Instant,
}

/// 进程内锁存储，过期的锁视为未持有
#[derive(Default)]
pub struct InMemoryLockStore {
    leases: Mutex<HashMap<ItemId, Lease>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        key: ItemId,
        owner: &str,
        ttl: Duration,
    ) -> OrchestratorResult<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        if let Some(lease) = leases.get(&key) {
            if lease.expires_at > now && lease.owner != owner {
                return Ok(false);
            }
        }
        leases.insert(
            key,
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: ItemId, owner: &str) -> OrchestratorResult<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get(&key) {
            Some(lease) if lease.owner == owner => {
                leases.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: ItemId) -> OrchestratorResult<Option<String>> {
        let leases = self.leases.lock().await;
        Ok(leases
            .get(&key)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.owner.clone()))
    }
}
