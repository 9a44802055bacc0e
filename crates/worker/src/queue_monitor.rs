//! 任务状态监控
//!
//! 以 `job_id` 为键记录每个任务的生命周期：
//! `Pending -> Waiting <-> Running -> Completed | Failed`，重试回到 `Pending` 并递增尝试次数。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use orchestrator_domain::{ItemId, JobMessage, JobType};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Waiting,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Waiting => "WAITING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Waiting | Running | Failed)
                | (Waiting, Waiting | Running | Failed)
                | (Running, Waiting | Completed | Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredJob {
    pub job: JobMessage,
    pub state: JobState,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct QueueMonitor {
    jobs: RwLock<HashMap<String, MonitoredJob>>,
}

impl QueueMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记任务；已登记时不做任何修改并返回 `false`
    pub async fn register_job(&self, job: &JobMessage) -> bool {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return false;
        }
        let now = Utc::now();
        jobs.insert(
            job.job_id.clone(),
            MonitoredJob {
                job: job.clone(),
                state: JobState::Pending,
                registered_at: now,
                updated_at: now,
            },
        );
        debug!(job_id = %job.job_id, job_type = %job.job_type, "任务已登记");
        true
    }

    pub async fn transition(&self, job_id: &str, to: JobState) -> OrchestratorResult<JobState> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| OrchestratorError::job_not_found(job_id))?;
        let from = entry.state;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                job_id: job_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        entry.state = to;
        entry.updated_at = Utc::now();
        debug!(job_id, %from, %to, "任务状态变更");
        Ok(from)
    }

    pub async fn mark_waiting(&self, job_id: &str) -> OrchestratorResult<JobState> {
        self.transition(job_id, JobState::Waiting).await
    }

    pub async fn mark_running(&self, job_id: &str) -> OrchestratorResult<JobState> {
        self.transition(job_id, JobState::Running).await
    }

    pub async fn mark_completed(&self, job_id: &str) -> OrchestratorResult<JobState> {
        self.transition(job_id, JobState::Completed).await
    }

    pub async fn mark_failed(&self, job_id: &str) -> OrchestratorResult<JobState> {
        self.transition(job_id, JobState::Failed).await
    }

    /// 重新入队：回到 `Pending`，尝试次数取自新消息。已完成的任务不能重试。
    pub async fn mark_retry(&self, retry: &JobMessage) -> OrchestratorResult<()> {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();
        match jobs.get_mut(&retry.job_id) {
            Some(entry) if entry.state == JobState::Completed => {
                Err(OrchestratorError::InvalidTransition {
                    job_id: retry.job_id.clone(),
                    from: entry.state.to_string(),
                    to: JobState::Pending.to_string(),
                })
            }
            Some(entry) => {
                entry.job = retry.clone();
                entry.state = JobState::Pending;
                entry.updated_at = now;
                Ok(())
            }
            None => {
                jobs.insert(
                    retry.job_id.clone(),
                    MonitoredJob {
                        job: retry.clone(),
                        state: JobState::Pending,
                        registered_at: now,
                        updated_at: now,
                    },
                );
                Ok(())
            }
        }
    }

    pub async fn state(&self, job_id: &str) -> Option<JobState> {
        self.jobs.read().await.get(job_id).map(|entry| entry.state)
    }

    pub async fn get(&self, job_id: &str) -> Option<MonitoredJob> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// 同一条目同一类型是否已有未结束的任务
    pub async fn has_active(&self, job_type: JobType, item_id: ItemId) -> bool {
        self.jobs.read().await.values().any(|entry| {
            entry.job.job_type == job_type
                && entry.job.item_id == item_id
                && !entry.state.is_terminal()
        })
    }

    pub async fn snapshot(&self) -> Vec<MonitoredJob> {
        let mut jobs: Vec<MonitoredJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.job.job_id.cmp(&b.job.job_id))
        });
        jobs
    }

    pub async fn counts(&self) -> BTreeMap<JobState, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.jobs.read().await.values() {
            *counts.entry(entry.state).or_insert(0) += 1;
        }
        counts
    }

    /// 运行时间超过阈值的任务，通常意味着执行它的进程已经崩溃
    pub async fn stale_running(&self, older_than: Duration) -> Vec<JobMessage> {
        let cutoff = cutoff(older_than);
        self.jobs
            .read()
            .await
            .values()
            .filter(|entry| entry.state == JobState::Running && entry.updated_at <= cutoff)
            .map(|entry| entry.job.clone())
            .collect()
    }

    /// 清理结束已久的任务记录，返回清理数量
    pub async fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = cutoff(older_than);
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| !(entry.state.is_terminal() && entry.updated_at <= cutoff));
        before - jobs.len()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

fn cutoff(older_than: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
