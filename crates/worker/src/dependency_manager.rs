//! 条目依赖锁
//!
//! 一个任务运行期间持有其条目以及全部后代条目的锁，保证同一棵树上
//! 相互重叠的任务不会同时运行。锁键按ID升序获取，任何冲突都会释放已获取的锁，
//! 并把任务挂到阻塞它的条目上；持有者完成时立即重新发布这些等待者。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use orchestrator_domain::{ItemId, ItemRepository, JobBroker, JobMessage, LockStore};
use orchestrator_errors::OrchestratorResult;

#[derive(Debug, Clone)]
struct ParkedJob {
    job: JobMessage,
    parked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct DependencyState {
    /// job_id -> 已持有的锁键
    held: HashMap<String, Vec<ItemId>>,
    /// 阻塞条目ID -> 等待的任务
    waiting: HashMap<ItemId, Vec<ParkedJob>>,
}

pub struct DependencyManager {
    repo: Arc<dyn ItemRepository>,
    locks: Arc<dyn LockStore>,
    broker: Arc<dyn JobBroker>,
    worker_id: String,
    lock_ttl: Duration,
    // start/complete 在同一把锁下串行执行，等待者不会错过唤醒
    state: Mutex<DependencyState>,
}

impl DependencyManager {
    pub fn new(
        repo: Arc<dyn ItemRepository>,
        locks: Arc<dyn LockStore>,
        broker: Arc<dyn JobBroker>,
        worker_id: impl Into<String>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            repo,
            locks,
            broker,
            worker_id: worker_id.into(),
            lock_ttl,
            state: Mutex::new(DependencyState::default()),
        }
    }

    fn owner(&self, job_id: &str) -> String {
        format!("{}:{}", self.worker_id, job_id)
    }

    /// 任务需要的锁键：条目自身加全部后代，升序
    pub async fn lock_keys(&self, job: &JobMessage) -> OrchestratorResult<Vec<ItemId>> {
        let relations = self.repo.relations(job.item_id).await?;
        let mut keys = Vec::with_capacity(1 + relations.descendants.len());
        keys.push(job.item_id);
        keys.extend(relations.descendants);
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    /// 尝试获取任务的全部锁。返回 `false` 时任务已被挂起，等待阻塞者完成后重新发布。
    pub async fn start_job(&self, job: &JobMessage) -> OrchestratorResult<bool> {
        let keys = self.lock_keys(job).await?;
        let owner = self.owner(&job.job_id);

        let mut state = self.state.lock().await;
        if state.held.contains_key(&job.job_id) {
            return Ok(true);
        }

        let mut acquired = Vec::with_capacity(keys.len());
        for key in &keys {
            let result = self.locks.try_acquire(*key, &owner, self.lock_ttl).await;
            match result {
                Ok(true) => acquired.push(*key),
                Ok(false) => {
                    self.release_keys(&acquired, &owner).await;
                    debug!(
                        job_id = %job.job_id,
                        item_id = job.item_id,
                        blocking_id = key,
                        "条目被其他任务锁定，任务进入等待"
                    );
                    state.waiting.entry(*key).or_default().push(ParkedJob {
                        job: job.clone(),
                        parked_at: Utc::now(),
                    });
                    return Ok(false);
                }
                Err(e) => {
                    self.release_keys(&acquired, &owner).await;
                    return Err(e);
                }
            }
        }

        state.held.insert(job.job_id.clone(), acquired);
        Ok(true)
    }

    /// 释放任务持有的锁，并重新发布等待这些条目的任务。返回重新发布的数量。
    pub async fn complete_job(&self, job_id: &str) -> OrchestratorResult<usize> {
        let mut state = self.state.lock().await;
        let Some(keys) = state.held.remove(job_id) else {
            return Ok(0);
        };
        self.release_keys(&keys, &self.owner(job_id)).await;

        let mut woken: Vec<ParkedJob> = keys
            .iter()
            .filter_map(|key| state.waiting.remove(key))
            .flatten()
            .collect();
        woken.sort_by_key(|parked| parked.parked_at);

        let count = woken.len();
        for (index, parked) in woken.iter().enumerate() {
            if let Err(e) = self.broker.publish(&parked.job).await {
                // 剩下的放回等待表，交给过期等待者恢复
                for rest in &woken[index..] {
                    state
                        .waiting
                        .entry(rest.job.item_id)
                        .or_default()
                        .push(rest.clone());
                }
                return Err(e);
            }
        }
        if count > 0 {
            debug!(job_id, woken = count, "锁已释放，唤醒等待任务");
        }
        Ok(count)
    }

    /// 重新发布等待超过阈值的任务。阻塞者可能运行在其他主机上，本机永远收不到它的完成通知。
    pub async fn requeue_stale_waiters(&self, older_than: Duration) -> OrchestratorResult<usize> {
        let age = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut state = self.state.lock().await;
        let mut stale = Vec::new();
        for parked in state.waiting.values_mut() {
            let (old, fresh): (Vec<ParkedJob>, Vec<ParkedJob>) =
                parked.drain(..).partition(|p| p.parked_at <= cutoff);
            *parked = fresh;
            stale.extend(old);
        }
        state.waiting.retain(|_, parked| !parked.is_empty());

        for parked in &stale {
            self.broker.publish(&parked.job).await?;
        }
        if !stale.is_empty() {
            info!("重新发布了 {} 个等待过久的任务", stale.len());
        }
        Ok(stale.len())
    }

    pub async fn waiting_count(&self) -> usize {
        self.state.lock().await.waiting.values().map(Vec::len).sum()
    }

    pub async fn held_keys(&self, job_id: &str) -> Option<Vec<ItemId>> {
        self.state.lock().await.held.get(job_id).cloned()
    }

    async fn release_keys(&self, keys: &[ItemId], owner: &str) {
        for key in keys.iter().rev() {
            if let Err(e) = self.locks.release(*key, owner).await {
                // 锁带TTL，释放失败最多让等待者多等一个TTL
                warn!("释放条目锁失败: item_id={}, owner={}, error={}", key, owner, e);
            }
        }
    }
}
