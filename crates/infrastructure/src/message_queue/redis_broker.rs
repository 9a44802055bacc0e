use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{debug, info, warn};

use orchestrator_domain::{DeadLetter, JobBroker, JobMessage};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

const KEY_PREFIX: &str = "orchestrator";

/// Redis消息代理
///
/// 每个分区一个list，`LMOVE` 把消息原子地移进处理中列表，确认时 `LREM`。
/// 进程崩溃后处理中列表里的消息由 [`JobBroker::recover_in_flight`] 放回队列。
pub struct RedisJobBroker {
    conn: ConnectionManager,
    poll_interval: Duration,
}

impl RedisJobBroker {
    pub async fn connect(redis_url: &str) -> OrchestratorResult<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            OrchestratorError::message_queue(format!("Failed to create Redis client: {e}"))
        })?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            OrchestratorError::message_queue(format!("Failed to connect to Redis: {e}"))
        })?;

        let broker = Self {
            conn,
            poll_interval: Duration::from_millis(200),
        };
        broker.ping().await?;
        info!("Successfully connected to Redis job broker at {}", redis_url);
        Ok(broker)
    }

    pub async fn ping(&self) -> OrchestratorResult<()> {
        let response: String = self.query(redis::cmd("PING")).await?;
        if response != "PONG" {
            return Err(OrchestratorError::message_queue(format!(
                "Unexpected PING response: {response}"
            )));
        }
        Ok(())
    }

    fn queue_key(queue: &str) -> String {
        format!("{KEY_PREFIX}:queue:{queue}")
    }

    fn processing_key(queue: &str) -> String {
        format!("{KEY_PREFIX}:processing:{queue}")
    }

    fn dead_letter_key() -> String {
        format!("{KEY_PREFIX}:dlq")
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> OrchestratorResult<T> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(|e| {
            OrchestratorError::message_queue(format!("Redis command failed: {e}"))
        })
    }

    fn parse_dead_letters(raw: Vec<String>) -> OrchestratorResult<Vec<DeadLetter>> {
        raw.iter()
            .map(|data| serde_json::from_str::<DeadLetter>(data).map_err(OrchestratorError::from))
            .collect()
    }
}

#[async_trait]
impl JobBroker for RedisJobBroker {
    async fn publish(&self, job: &JobMessage) -> OrchestratorResult<()> {
        let queue = job.queue_name();
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(Self::queue_key(&queue)).arg(job.serialize()?);
        let _: i64 = self.query(cmd).await?;
        debug!(job_id = %job.job_id, queue = %queue, "任务已发布到Redis");
        Ok(())
    }

    async fn receive(&self, queue: &str) -> OrchestratorResult<Option<JobMessage>> {
        let mut cmd = redis::cmd("LMOVE");
        cmd.arg(Self::queue_key(queue))
            .arg(Self::processing_key(queue))
            .arg("RIGHT")
            .arg("LEFT");
        let raw: Option<String> = self.query(cmd).await?;
        match raw {
            Some(data) => match JobMessage::deserialize(&data) {
                Ok(job) => Ok(Some(job)),
                Err(e) => {
                    // 坏消息直接移出处理中列表，避免反复恢复
                    warn!("丢弃无法解析的任务消息: {}", e);
                    let mut cmd = redis::cmd("LREM");
                    cmd.arg(Self::processing_key(queue)).arg(1).arg(&data);
                    let _: i64 = self.query(cmd).await?;
                    Err(e)
                }
            },
            None => Ok(None),
        }
    }

    async fn ack(&self, job: &JobMessage) -> OrchestratorResult<()> {
        let mut cmd = redis::cmd("LREM");
        cmd.arg(Self::processing_key(&job.queue_name()))
            .arg(1)
            .arg(job.serialize()?);
        let removed: i64 = self.query(cmd).await?;
        if removed == 0 {
            debug!(job_id = %job.job_id, "确认时未在处理中列表找到任务");
        }
        Ok(())
    }

    async fn queue_size(&self, queue: &str) -> OrchestratorResult<u64> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(Self::queue_key(queue));
        self.query(cmd).await
    }

    async fn dead_letter(&self, job: &JobMessage, reason: &str) -> OrchestratorResult<()> {
        let letter = DeadLetter {
            job: job.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        };
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(Self::processing_key(&job.queue_name()))
            .arg(1)
            .arg(job.serialize()?)
            .ignore()
            .cmd("RPUSH")
            .arg(Self::dead_letter_key())
            .arg(serde_json::to_string(&letter)?)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| OrchestratorError::message_queue(format!("Redis pipeline failed: {e}")))
    }

    async fn dead_letters(&self) -> OrchestratorResult<Vec<DeadLetter>> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(Self::dead_letter_key()).arg(0).arg(-1);
        let raw: Vec<String> = self.query(cmd).await?;
        Self::parse_dead_letters(raw)
    }

    async fn take_dead_letters(&self) -> OrchestratorResult<Vec<DeadLetter>> {
        let mut conn = self.conn.clone();
        let (raw,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(Self::dead_letter_key())
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(Self::dead_letter_key())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| OrchestratorError::message_queue(format!("Redis pipeline failed: {e}")))?;
        Self::parse_dead_letters(raw)
    }

    async fn wait_for_message(&self, timeout: Duration) {
        tokio::time::sleep(timeout.min(self.poll_interval)).await;
    }

    async fn recover_in_flight(&self, queue: &str) -> OrchestratorResult<usize> {
        let mut recovered = 0;
        loop {
            // 从最新的一端取出并推到消费端，最早的消息最终位于队首
            let mut cmd = redis::cmd("LMOVE");
            cmd.arg(Self::processing_key(queue))
                .arg(Self::queue_key(queue))
                .arg("LEFT")
                .arg("RIGHT");
            let moved: Option<String> = self.query(cmd).await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!("恢复了 {} 个未确认的任务到队列 {}", recovered, queue);
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_domain::{JobType, PartitionLayout};

    /// 需要设置 ORCHESTRATOR_TEST_REDIS_URL 才会运行
    async fn broker() -> Option<RedisJobBroker> {
        let url = std::env::var("ORCHESTRATOR_TEST_REDIS_URL").ok()?;
        let broker = RedisJobBroker::connect(&url).await.ok()?;
        let mut conn = broker.conn.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await.ok()?;
        Some(broker)
    }

    #[tokio::test]
    async fn test_receive_ack_and_recover() {
        let Some(broker) = broker().await else {
            return;
        };
        let layout = PartitionLayout::default();
        let job = JobMessage::new(JobType::Scrape, 9, &layout);
        let queue = job.queue_name();

        broker.publish(&job).await.unwrap();
        assert_eq!(broker.queue_size(&queue).await.unwrap(), 1);

        let got = broker.receive(&queue).await.unwrap().unwrap();
        assert_eq!(got, job);
        assert_eq!(broker.queue_size(&queue).await.unwrap(), 0);

        assert_eq!(broker.recover_in_flight(&queue).await.unwrap(), 1);
        let again = broker.receive(&queue).await.unwrap().unwrap();
        broker.ack(&again).await.unwrap();
        assert_eq!(broker.recover_in_flight(&queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dead_letters() {
        let Some(broker) = broker().await else {
            return;
        };
        let job = JobMessage::new(JobType::Download, 3, &PartitionLayout::default());
        broker.dead_letter(&job, "exhausted").await.unwrap();
        assert_eq!(broker.dead_letters().await.unwrap().len(), 1);
        let taken = broker.take_dead_letters().await.unwrap();
        assert_eq!(taken[0].job, job);
        assert!(broker.dead_letters().await.unwrap().is_empty());
    }
}
