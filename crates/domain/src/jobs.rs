//! 分布式任务消息与分区布局

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orchestrator_errors::OrchestratorError;

use crate::item::ItemId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Index,
    Scrape,
    Download,
    Symlink,
    Update,
    PostProcess,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::Index,
        JobType::Scrape,
        JobType::Download,
        JobType::Symlink,
        JobType::Update,
        JobType::PostProcess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Index => "index",
            JobType::Scrape => "scrape",
            JobType::Download => "download",
            JobType::Symlink => "symlink",
            JobType::Update => "update",
            JobType::PostProcess => "post_process",
        }
    }

    /// 下载负载更大，给更长的时间限制
    pub fn default_time_limit(&self) -> Duration {
        match self {
            JobType::Download => Duration::from_secs(1800),
            _ => Duration::from_secs(300),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| OrchestratorError::config_error(format!("未知的任务类型: {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// 形如 "p3"
    pub partition: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: String,
    pub job_type: JobType,
    pub item_id: ItemId,
    pub metadata: JobMetadata,
    pub enqueued_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn new(job_type: JobType, item_id: ItemId, layout: &PartitionLayout) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            job_type,
            item_id,
            metadata: JobMetadata {
                partition: format!("p{}", layout.partition_for(job_type, item_id)),
                attempt: 0,
            },
            enqueued_at: Utc::now(),
        }
    }

    pub fn partition_index(&self) -> u32 {
        self.metadata
            .partition
            .trim_start_matches('p')
            .parse()
            .unwrap_or(0)
    }

    pub fn queue_name(&self) -> String {
        queue_name(self.job_type, self.partition_index())
    }

    /// 同一个 job_id、同一分区，尝试次数加一
    pub fn next_attempt(&self) -> Self {
        let mut retry = self.clone();
        retry.metadata.attempt += 1;
        retry.enqueued_at = Utc::now();
        retry
    }

    pub fn serialize(&self) -> Result<String, OrchestratorError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(data: &str) -> Result<Self, OrchestratorError> {
        Ok(serde_json::from_str(data)?)
    }
}

pub fn queue_name(job_type: JobType, partition: u32) -> String {
    format!("{}.p{}", job_type.as_str(), partition)
}

/// 每种任务类型固定的分区数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    counts: BTreeMap<JobType, u32>,
}

impl Default for PartitionLayout {
    fn default() -> Self {
        Self::new(BTreeMap::from([
            (JobType::Index, 2),
            (JobType::Scrape, 4),
            (JobType::Download, 8),
            (JobType::Symlink, 2),
            (JobType::Update, 2),
            (JobType::PostProcess, 2),
        ]))
    }
}

impl PartitionLayout {
    pub fn new(counts: BTreeMap<JobType, u32>) -> Self {
        Self { counts }
    }

    pub fn count(&self, job_type: JobType) -> u32 {
        self.counts.get(&job_type).copied().unwrap_or(1).max(1)
    }

    /// 同一条目总是落在同一个分区
    pub fn partition_for(&self, job_type: JobType, item_id: ItemId) -> u32 {
        (splitmix64(item_id as u64) % u64::from(self.count(job_type))) as u32
    }

    pub fn queue_for(&self, job_type: JobType, item_id: ItemId) -> String {
        queue_name(job_type, self.partition_for(job_type, item_id))
    }

    pub fn queues(&self, job_type: JobType) -> Vec<String> {
        (0..self.count(job_type))
            .map(|p| queue_name(job_type, p))
            .collect()
    }

    pub fn all_queues(&self) -> Vec<String> {
        JobType::ALL.iter().flat_map(|t| self.queues(*t)).collect()
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
