//! 任务生命周期指标
//!
//! 每条生命周期边（入队、开始、完成、重试、死信）各调用一次对应的 `mark_*`。
//! 计算延迟用的时间戳存放在有界LRU表中，按 `job_id` 索引，在下一条边上取出（pop）而不是读取，
//! 被取消、永远不会走到下一条边的任务最终会被LRU淘汰。

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Instant;

use lru::LruCache;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tracing::debug;

use orchestrator_domain::JobMessage;
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

pub const JOBS_ENQUEUED_TOTAL: &str = "jobs_enqueued_total";
pub const JOBS_STARTED_TOTAL: &str = "jobs_started_total";
pub const JOBS_COMPLETED_TOTAL: &str = "jobs_completed_total";
pub const JOBS_RETRIED_TOTAL: &str = "jobs_retried_total";
pub const JOBS_DLQ_TOTAL: &str = "jobs_dlq_total";
pub const JOB_QUEUE_WAIT_SECONDS: &str = "job_queue_wait_seconds";
pub const JOB_RUN_DURATION_SECONDS: &str = "job_run_duration_seconds";

const LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 1800.0,
];

pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    enqueued_at: Mutex<LruCache<String, Instant>>,
    started_at: Mutex<LruCache<String, Instant>>,
}

impl MetricsRegistry {
    /// 使用局部recorder，不安装全局recorder，测试之间互不干扰
    pub fn new(latency_capacity: usize) -> OrchestratorResult<Self> {
        let recorder = PrometheusBuilder::new()
            .set_buckets(LATENCY_BUCKETS)
            .map_err(|e| OrchestratorError::Internal(format!("配置直方图桶失败: {e}")))?
            .build_recorder();
        let handle = recorder.handle();
        let capacity = NonZeroUsize::new(latency_capacity).unwrap_or(NonZeroUsize::MIN);

        metrics::with_local_recorder(&recorder, || {
            describe_counter!(JOBS_ENQUEUED_TOTAL, "Jobs published to a partition queue");
            describe_counter!(JOBS_STARTED_TOTAL, "Jobs that acquired their locks and began running");
            describe_counter!(JOBS_COMPLETED_TOTAL, "Jobs that reached a terminal outcome");
            describe_counter!(JOBS_RETRIED_TOTAL, "Job attempts re-enqueued after a failure");
            describe_counter!(JOBS_DLQ_TOTAL, "Jobs routed to the dead-letter queue");
            describe_histogram!(
                JOB_QUEUE_WAIT_SECONDS,
                Unit::Seconds,
                "Time from enqueue to start"
            );
            describe_histogram!(
                JOB_RUN_DURATION_SECONDS,
                Unit::Seconds,
                "Time from start to completion"
            );
        });

        Ok(Self {
            recorder,
            handle,
            enqueued_at: Mutex::new(LruCache::new(capacity)),
            started_at: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn mark_enqueued(&self, job: &JobMessage) {
        self.increment(JOBS_ENQUEUED_TOTAL, job, None);
        self.put(&self.enqueued_at, job);
    }

    pub fn mark_started(&self, job: &JobMessage) {
        self.increment(JOBS_STARTED_TOTAL, job, None);
        if let Some(at) = self.pop(&self.enqueued_at, job) {
            self.observe(JOB_QUEUE_WAIT_SECONDS, job, at);
        }
        self.put(&self.started_at, job);
    }

    pub fn mark_completed(&self, job: &JobMessage, success: bool) {
        self.increment(JOBS_COMPLETED_TOTAL, job, Some(success));
        if let Some(at) = self.pop(&self.started_at, job) {
            self.observe(JOB_RUN_DURATION_SECONDS, job, at);
        }
    }

    /// 失败后重新入队：本次运行结束，下一次等待从现在开始计时
    pub fn mark_retry(&self, job: &JobMessage) {
        self.increment(JOBS_RETRIED_TOTAL, job, None);
        self.pop(&self.started_at, job);
        self.put(&self.enqueued_at, job);
    }

    pub fn mark_dlq(&self, job: &JobMessage) {
        self.increment(JOBS_DLQ_TOTAL, job, None);
    }

    /// 文本格式的指标输出
    pub fn render(&self) -> String {
        self.handle.render()
    }

    pub fn pending_latency_entries(&self) -> usize {
        let len = |map: &Mutex<LruCache<String, Instant>>| match map.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        len(&self.enqueued_at) + len(&self.started_at)
    }

    fn increment(&self, name: &'static str, job: &JobMessage, success: Option<bool>) {
        let job_type = job.job_type.as_str();
        let partition = job.metadata.partition.clone();
        metrics::with_local_recorder(&self.recorder, || match success {
            Some(success) => counter!(
                name,
                "job_type" => job_type,
                "partition" => partition,
                "success" => if success { "true" } else { "false" }
            )
            .increment(1),
            None => counter!(name, "job_type" => job_type, "partition" => partition).increment(1),
        });
        debug!(metric = name, job_id = %job.job_id, "指标已记录");
    }

    fn observe(&self, name: &'static str, job: &JobMessage, since: Instant) {
        let job_type = job.job_type.as_str();
        let partition = job.metadata.partition.clone();
        let seconds = since.elapsed().as_secs_f64();
        metrics::with_local_recorder(&self.recorder, || {
            histogram!(name, "job_type" => job_type, "partition" => partition).record(seconds)
        });
    }

    fn put(&self, map: &Mutex<LruCache<String, Instant>>, job: &JobMessage) {
        let mut guard = match map.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.put(job.job_id.clone(), Instant::now());
    }

    fn pop(&self, map: &Mutex<LruCache<String, Instant>>, job: &JobMessage) -> Option<Instant> {
        let mut guard = match map.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.pop(&job.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_domain::{JobType, PartitionLayout};

    fn job() -> JobMessage {
        JobMessage::new(JobType::Download, 12, &PartitionLayout::default())
    }

    #[test]
    fn test_render_exposition_format() {
        let registry = MetricsRegistry::new(100).unwrap();
        let job = job();
        registry.mark_enqueued(&job);
        registry.mark_started(&job);
        registry.mark_completed(&job, true);

        let text = registry.render();
        assert!(text.contains("# TYPE jobs_enqueued_total counter"));
        assert!(text.contains("# HELP jobs_enqueued_total Jobs published to a partition queue"));
        assert!(text.contains(&format!(
            "jobs_completed_total{{job_type=\"download\",partition=\"{}\",success=\"true\"}} 1",
            job.metadata.partition
        )));
        assert!(text.contains("# TYPE job_queue_wait_seconds histogram"));
        assert!(text.contains("job_run_duration_seconds_bucket{"));
        assert!(text.contains("job_run_duration_seconds_count{"));
        assert!(text.contains("job_run_duration_seconds_sum{"));
    }

    #[test]
    fn test_timestamps_are_popped() {
        let registry = MetricsRegistry::new(100).unwrap();
        let job = job();
        registry.mark_enqueued(&job);
        assert_eq!(registry.pending_latency_entries(), 1);
        registry.mark_started(&job);
        assert_eq!(registry.pending_latency_entries(), 1);
        registry.mark_completed(&job, false);
        assert_eq!(registry.pending_latency_entries(), 0);
    }

    #[test]
    fn test_latency_map_is_bounded() {
        let registry = MetricsRegistry::new(2).unwrap();
        for item_id in 0..10 {
            let job = JobMessage::new(JobType::Index, item_id, &PartitionLayout::default());
            registry.mark_enqueued(&job);
        }
        assert_eq!(registry.pending_latency_entries(), 2);
    }

    #[test]
    fn test_dlq_counter() {
        let registry = MetricsRegistry::new(10).unwrap();
        let job = job();
        registry.mark_dlq(&job);
        let expected = format!(
            "jobs_dlq_total{{job_type=\"download\",partition=\"{}\"}} 1",
            job.metadata.partition
        );
        assert!(registry.render().contains(&expected));
    }
}
