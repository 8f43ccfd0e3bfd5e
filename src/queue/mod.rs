//! Durable job queue on Redis.
//!
//! At-least-once delivery: jobs move atomically from `waiting` to `active`,
//! the consumer takes a renewable lease, and a stalled-job sweep returns
//! active jobs with an expired lease to `waiting`. Failures are retried
//! through a `delayed` zset with exponential backoff until the attempt cap,
//! then parked on a `failed` list. The worker never retries on its own; all
//! retry policy lives here.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::util::{epoch_millis, epoch_seconds, new_id};

/// Recognized job names.
pub const JOB_CREATION: &str = "initialProjectCreationJob";
pub const JOB_MODIFICATION: &str = "projectModificationJob";
pub const JOB_SECRET_SYNC: &str = "sync-flyio-secrets";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub attempt: u32,
    pub payload: serde_json::Value,
    pub enqueued_at: i64,
}

/// A job popped from the queue. Keeps the raw encoding so the exact list
/// element can be removed on completion.
#[derive(Debug, Clone)]
pub struct DeliveredJob {
    pub job: Job,
    raw: String,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub max_attempts: u32,
    pub backoff_base_ms: i64,
    pub lock_duration_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "backend-generation".to_string(),
            max_attempts: 3,
            backoff_base_ms: 5_000,
            lock_duration_ms: 600_000,
        }
    }
}

impl QueueConfig {
    /// Exponential backoff for the next delivery of `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> i64 {
        self.backoff_base_ms * (1i64 << attempt.min(16))
    }

    /// Leases are renewed at a fixed fraction of the lock duration.
    pub fn renew_interval_ms(&self) -> i64 {
        self.lock_duration_ms / 3
    }
}

pub struct RedisQueue {
    conn: ConnectionManager,
    config: QueueConfig,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str, config: QueueConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("Failed to connect queue")?;
        Ok(Self { conn, config })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn key(&self, suffix: &str) -> String {
        format!("tbq:{}:{}", self.config.name, suffix)
    }

    fn lease_key(&self, job_id: &str) -> String {
        self.key(&format!("lease:{}", job_id))
    }

    pub async fn enqueue(&self, name: &str, payload: serde_json::Value) -> Result<String> {
        let job = Job {
            id: new_id(),
            name: name.to_string(),
            attempt: 1,
            payload,
            enqueued_at: epoch_seconds(),
        };
        let raw = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(self.key("waiting"))
            .arg(&raw)
            .query_async(&mut conn)
            .await?;
        debug!(job_id = %job.id, name, "Enqueued job");
        Ok(job.id)
    }

    /// Move due delayed jobs back to `waiting`.
    async fn promote_delayed(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key("delayed"))
            .arg(0)
            .arg(epoch_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(16)
            .query_async(&mut conn)
            .await?;
        for raw in due {
            // Only the worker that wins the ZREM moves the job.
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.key("delayed"))
                .arg(&raw)
                .query_async(&mut conn)
                .await?;
            if removed == 1 {
                let _: i64 = redis::cmd("LPUSH")
                    .arg(self.key("waiting"))
                    .arg(&raw)
                    .query_async(&mut conn)
                    .await?;
            }
        }
        Ok(())
    }

    /// Return active jobs whose lease expired to `waiting` for redelivery.
    async fn reclaim_stalled(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let active: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key("active"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        for raw in active {
            let Ok(job) = serde_json::from_str::<Job>(&raw) else {
                continue;
            };
            let held: i64 = redis::cmd("EXISTS")
                .arg(self.lease_key(&job.id))
                .query_async(&mut conn)
                .await?;
            if held == 0 {
                let removed: i64 = redis::cmd("LREM")
                    .arg(self.key("active"))
                    .arg(1)
                    .arg(&raw)
                    .query_async(&mut conn)
                    .await?;
                if removed == 1 {
                    warn!(job_id = %job.id, "Reclaimed stalled job");
                    let _: i64 = redis::cmd("LPUSH")
                        .arg(self.key("waiting"))
                        .arg(&raw)
                        .query_async(&mut conn)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Pop the next job, blocking up to two seconds. Takes the lease.
    pub async fn next_job(&self) -> Result<Option<DeliveredJob>> {
        self.promote_delayed().await?;
        self.reclaim_stalled().await?;

        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(self.key("waiting"))
            .arg(self.key("active"))
            .arg("RIGHT")
            .arg("LEFT")
            .arg(2.0)
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let job: Job = match serde_json::from_str(&raw) {
            Ok(job) => job,
            Err(e) => {
                // Undecodable payloads are parked on the failed list.
                warn!(error = %e, "Discarding malformed queue entry");
                let _: i64 = redis::cmd("LREM")
                    .arg(self.key("active"))
                    .arg(1)
                    .arg(&raw)
                    .query_async(&mut conn)
                    .await?;
                let _: i64 = redis::cmd("LPUSH")
                    .arg(self.key("failed"))
                    .arg(&raw)
                    .query_async(&mut conn)
                    .await?;
                return Ok(None);
            }
        };

        let _: () = redis::cmd("SET")
            .arg(self.lease_key(&job.id))
            .arg("held")
            .arg("PX")
            .arg(self.config.lock_duration_ms)
            .query_async(&mut conn)
            .await?;

        Ok(Some(DeliveredJob { job, raw }))
    }

    pub async fn renew_lease(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.lease_key(job_id))
            .arg("held")
            .arg("PX")
            .arg(self.config.lock_duration_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn release(&self, delivered: &DeliveredJob) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LREM")
            .arg(self.key("active"))
            .arg(1)
            .arg(&delivered.raw)
            .query_async(&mut conn)
            .await?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.lease_key(&delivered.job.id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn complete(&self, delivered: &DeliveredJob) -> Result<()> {
        self.release(delivered).await?;
        info!(job_id = %delivered.job.id, name = %delivered.job.name, "Job completed");
        Ok(())
    }

    /// Fail the job: retry with backoff while attempts remain, park on the
    /// failed list otherwise.
    pub async fn fail(&self, delivered: &DeliveredJob, reason: &str) -> Result<()> {
        self.release(delivered).await?;
        let mut conn = self.conn.clone();

        if delivered.job.attempt < self.config.max_attempts {
            let mut retry = delivered.job.clone();
            retry.attempt += 1;
            let raw = serde_json::to_string(&retry)?;
            let promote_at = epoch_millis() + self.config.backoff_ms(delivered.job.attempt);
            let _: i64 = redis::cmd("ZADD")
                .arg(self.key("delayed"))
                .arg(promote_at)
                .arg(&raw)
                .query_async(&mut conn)
                .await?;
            warn!(
                job_id = %delivered.job.id,
                attempt = retry.attempt,
                reason,
                "Job failed, scheduled retry"
            );
        } else {
            let _: i64 = redis::cmd("LPUSH")
                .arg(self.key("failed"))
                .arg(&delivered.raw)
                .query_async(&mut conn)
                .await?;
            warn!(
                job_id = %delivered.job.id,
                attempts = delivered.job.attempt,
                reason,
                "Job failed permanently"
            );
        }
        Ok(())
    }

    /// Wipe every queue key. Non-production shutdown only.
    pub async fn obliterate(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(self.key("*"))
            .query_async(&mut conn)
            .await?;
        if !keys.is_empty() {
            let mut del = redis::cmd("DEL");
            for key in &keys {
                del.arg(key);
            }
            let _: i64 = del.query_async(&mut conn).await?;
        }
        info!(queue = %self.config.name, "Queue wiped");
        Ok(())
    }
}
