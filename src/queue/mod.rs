//! Durable work queues for payment, refund and webhook jobs.
//!
//! A queue hands each ready job to exactly one worker at a time through a
//! lease. A lease that is neither completed nor failed before its visibility
//! timeout is reclaimed and the job is delivered again. Queue-level retry
//! (`max_attempts`, fixed backoff) only covers handler errors; webhook
//! backoff is driven by the delivery worker enqueueing new delayed jobs.

pub mod job;
pub mod memory;
#[cfg(feature = "cache")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::QueueConfig;

pub use self::job::{JobPayload, PaymentJob, RefundJob, WebhookJob};
pub use self::memory::InMemoryJobQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Payment,
    Refund,
    Webhook,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Payment, QueueName::Refund, QueueName::Webhook];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Payment => "payment-queue",
            QueueName::Refund => "refund-queue",
            QueueName::Webhook => "webhook-queue",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: JobPayload,
    /// Handler failures recorded so far
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(queue: QueueName, payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue,
            payload,
            attempts_made: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }
}

/// Returned by `enqueue`
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub id: Uuid,
    pub queue: QueueName,
    /// Earliest time the job can be leased
    pub ready_at: DateTime<Utc>,
}

/// Exclusive claim on a job until it is settled or the lease expires
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: Job,
    /// Distinguishes this lease from a later redelivery of the same job
    pub token: Uuid,
}

/// How a failed job was settled
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Retrying { attempt: u32, ready_at: DateTime<Utc> },
    Failed { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Ready and delayed jobs
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl std::ops::Add for JobCounts {
    type Output = JobCounts;

    fn add(self, rhs: JobCounts) -> JobCounts {
        JobCounts {
            waiting: self.waiting + rhs.waiting,
            active: self.active + rhs.active,
            completed: self.completed + rhs.completed,
            failed: self.failed + rhs.failed,
        }
    }
}

/// Queue-level retry and lease settings
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub visibility_timeout: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_backoff: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&QueueConfig> for QueuePolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            visibility_timeout: Duration::from_secs(config.visibility_timeout),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("{kind} job cannot be enqueued on {queue}")]
    WrongQueue { queue: QueueName, kind: &'static str },

    #[error("lease on job {job_id} is no longer held")]
    LeaseLost { job_id: Uuid },

    #[error("job serialization error: {0}")]
    Serialization(String),

    #[error("queue backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// Reject payloads addressed to another queue
pub(crate) fn ensure_queue(queue: QueueName, payload: &JobPayload) -> Result<(), QueueError> {
    if payload.queue() != queue {
        return Err(QueueError::WrongQueue {
            queue,
            kind: payload.kind(),
        });
    }
    Ok(())
}

pub(crate) fn ready_at(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> QueueName;

    /// Add a job that becomes eligible after `delay`
    async fn enqueue(&self, payload: JobPayload, delay: Duration) -> Result<JobHandle, QueueError>;

    /// Claim the next ready job, if any
    async fn lease(&self) -> Result<Option<Lease>, QueueError>;

    async fn complete(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Record a handler failure; the policy decides between retry and failed
    async fn fail(&self, lease: &Lease, reason: &str) -> Result<Settlement, QueueError>;

    async fn counts(&self) -> Result<JobCounts, QueueError>;
}

/// The three queues of the pipeline
#[derive(Clone)]
pub struct Queues {
    pub payments: Arc<dyn JobQueue>,
    pub refunds: Arc<dyn JobQueue>,
    pub webhooks: Arc<dyn JobQueue>,
}

impl Queues {
    pub fn in_memory(policy: QueuePolicy) -> Self {
        Self {
            payments: Arc::new(InMemoryJobQueue::new(QueueName::Payment, policy.clone())),
            refunds: Arc::new(InMemoryJobQueue::new(QueueName::Refund, policy.clone())),
            webhooks: Arc::new(InMemoryJobQueue::new(QueueName::Webhook, policy)),
        }
    }

    #[cfg(feature = "cache")]
    pub fn redis(pool: self::redis::RedisPool, key_prefix: &str, policy: QueuePolicy) -> Self {
        use self::redis::RedisJobQueue;

        Self {
            payments: Arc::new(RedisJobQueue::new(
                pool.clone(),
                key_prefix,
                QueueName::Payment,
                policy.clone(),
            )),
            refunds: Arc::new(RedisJobQueue::new(
                pool.clone(),
                key_prefix,
                QueueName::Refund,
                policy.clone(),
            )),
            webhooks: Arc::new(RedisJobQueue::new(
                pool,
                key_prefix,
                QueueName::Webhook,
                policy,
            )),
        }
    }

    pub fn get(&self, name: QueueName) -> &Arc<dyn JobQueue> {
        match name {
            QueueName::Payment => &self.payments,
            QueueName::Refund => &self.refunds,
            QueueName::Webhook => &self.webhooks,
        }
    }

    /// Route a payload to the queue it belongs to
    pub async fn dispatch(
        &self,
        payload: JobPayload,
        delay: Duration,
    ) -> Result<JobHandle, QueueError> {
        self.get(payload.queue()).enqueue(payload, delay).await
    }

    /// Sum of the counts of all three queues
    pub async fn aggregate_counts(&self) -> Result<JobCounts, QueueError> {
        let mut total = JobCounts::default();
        for name in QueueName::ALL {
            total = total + self.get(name).counts().await?;
        }
        Ok(total)
    }
}
