//! Outbound job queue. Downstream workers (channel senders, CRM sync, staff
//! notifications) consume the jobs stream; delayed jobs wait in a sorted set
//! until [`RedisJobQueue::promote_due_jobs`] moves them over.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use tracing::{info, warn};

use crate::error::QueueError;
use crate::models::payloads::Job;

const STREAM_MAXLEN: usize = 10_000;
const PROMOTE_BATCH: isize = 100;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;
}

pub struct RedisJobQueue {
    redis: MultiplexedConnection,
    stream_key: String,
    delayed_key: String,
}

impl RedisJobQueue {
    pub fn new(redis: MultiplexedConnection, stream_key: &str, delayed_key: &str) -> Self {
        Self {
            redis,
            stream_key: stream_key.to_string(),
            delayed_key: delayed_key.to_string(),
        }
    }

    async fn xadd(&self, payload: &str) -> Result<String, QueueError> {
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAXLEN)
            .arg("*")
            .arg("payload")
            .arg(payload)
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(id)
    }

    /// Moves delayed jobs whose due time has passed onto the stream. A job is
    /// only forwarded by the worker whose ZREM removed it.
    pub async fn promote_due_jobs(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await?;

        let mut promoted = 0;
        for payload in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&payload)
                .query_async(&mut conn)
                .await?;
            if removed == 0 {
                continue;
            }
            self.xadd(&payload).await?;
            promoted += 1;
        }

        if promoted > 0 {
            info!(count = promoted, stream = self.stream_key, "Promoted delayed jobs");
        }
        Ok(promoted)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job)?;

        match job.delay_ms.filter(|ms| *ms > 0) {
            Some(delay_ms) => {
                let due_at = job.enqueued_at.timestamp_millis() + delay_ms as i64;
                redis::cmd("ZADD")
                    .arg(&self.delayed_key)
                    .arg(due_at)
                    .arg(&payload)
                    .query_async::<()>(&mut self.redis.clone())
                    .await?;
                info!(
                    job_id = %job.id,
                    job_type = job.kind.type_name(),
                    due_at,
                    "Scheduled delayed job"
                );
            }
            None => {
                let stream_id = self.xadd(&payload).await?;
                info!(
                    job_id = %job.id,
                    job_type = job.kind.type_name(),
                    stream_id,
                    "XADD to {}",
                    self.stream_key
                );
            }
        }
        Ok(())
    }
}

/// Collects jobs in memory. Tests read them back with [`MemoryJobQueue::jobs`].
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<Job>>,
    unavailable: Mutex<bool>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap_or_else(|e| e.into_inner()) = unavailable;
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        if *self.unavailable.lock().unwrap_or_else(|e| e.into_inner()) {
            warn!(job_id = %job.id, "Memory queue marked unavailable");
            return Err(QueueError::Redis(
                (redis::ErrorKind::IoError, "queue unavailable").into(),
            ));
        }
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::payloads::{JobKind, NotificationJob};
    use uuid::Uuid;

    fn notification() -> Job {
        Job::now(JobKind::SendNotification(NotificationJob {
            tenant_id: Uuid::nil(),
            channels: vec!["slack".to_string()],
            recipients: vec![],
            message: "new booking request".to_string(),
            conversation_id: None,
        }))
    }

    #[tokio::test]
    async fn memory_queue_keeps_order() {
        let queue = MemoryJobQueue::new();
        let first = notification();
        let second = notification();
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();

        let ids: Vec<_> = queue.jobs().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn unavailable_queue_rejects_jobs() {
        let queue = MemoryJobQueue::new();
        queue.set_unavailable(true);
        assert!(queue.enqueue(notification()).await.is_err());
        assert!(queue.jobs().is_empty());
    }
}
