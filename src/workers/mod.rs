//! Background workers: one pool per queue, each task leasing jobs and
//! handing them to the queue's handler.

pub mod payment_processor;
pub mod refund_processor;
pub mod simulation;
pub mod webhook_delivery;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::database::error::DatabaseError;
use crate::database::payment_repository::PaymentStatus;
use crate::database::Stores;
use crate::queue::{JobPayload, JobQueue, QueueError, QueueName, Queues, Settlement};

use self::payment_processor::PaymentProcessor;
use self::refund_processor::RefundProcessor;
use self::simulation::OutcomePolicy;
use self::webhook_delivery::{RetrySchedule, WebhookDelivery, WebhookTransport};

/// Typed errors produced by job handlers.
///
/// A handler error makes the queue record a failed attempt; the queue policy
/// decides whether the job runs again.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{entity} {id} not found")]
    MissingRecord { entity: &'static str, id: String },

    #[error("{kind} job cannot be handled by the {queue} worker")]
    UnexpectedJob { queue: QueueName, kind: &'static str },

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What a handler did with a job it finished without error
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    PaymentCompleted {
        payment_id: String,
        status: PaymentStatus,
        webhook_enqueued: bool,
    },
    /// Payment already left `pending`; nothing written
    PaymentUnchanged { payment_id: String },
    RefundProcessed {
        refund_id: String,
        webhook_enqueued: bool,
    },
    /// Refund missing or already processed
    RefundSkipped { refund_id: String },
    WebhookDelivered { log_id: Uuid, attempts: i32 },
    WebhookRescheduled {
        log_id: Uuid,
        attempts: i32,
        next_retry_at: DateTime<Utc>,
    },
    WebhookExhausted { log_id: Uuid, attempts: i32 },
    /// Log already moved past this job; nothing sent
    WebhookSkipped { log_id: Uuid },
    /// Merchant gone or has no endpoint
    WebhookAbandoned { merchant_id: Uuid },
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::PaymentCompleted {
                payment_id, status, ..
            } => write!(f, "payment {} -> {}", payment_id, status),
            JobOutcome::PaymentUnchanged { payment_id } => {
                write!(f, "payment {} already final", payment_id)
            }
            JobOutcome::RefundProcessed { refund_id, .. } => {
                write!(f, "refund {} processed", refund_id)
            }
            JobOutcome::RefundSkipped { refund_id } => write!(f, "refund {} skipped", refund_id),
            JobOutcome::WebhookDelivered { log_id, attempts } => {
                write!(f, "webhook {} delivered on attempt {}", log_id, attempts)
            }
            JobOutcome::WebhookRescheduled {
                log_id,
                attempts,
                next_retry_at,
            } => write!(
                f,
                "webhook {} attempt {} failed, retry at {}",
                log_id, attempts, next_retry_at
            ),
            JobOutcome::WebhookExhausted { log_id, attempts } => {
                write!(f, "webhook {} failed after {} attempts", log_id, attempts)
            }
            JobOutcome::WebhookSkipped { log_id } => {
                write!(f, "webhook {} job is stale", log_id)
            }
            JobOutcome::WebhookAbandoned { merchant_id } => {
                write!(f, "merchant {} has no webhook endpoint", merchant_id)
            }
        }
    }
}

/// Result of one iteration of a worker loop
#[derive(Debug, Clone, PartialEq)]
pub enum JobReport {
    /// Nothing was ready
    Idle,
    Completed { job_id: Uuid, outcome: JobOutcome },
    Retrying {
        job_id: Uuid,
        attempt: u32,
        error: String,
    },
    Failed {
        job_id: Uuid,
        attempts: u32,
        error: String,
    },
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: JobPayload) -> Result<JobOutcome, WorkerError>;
}

/// One queue plus the handler for its jobs
#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>) -> Self {
        Self { queue, handler }
    }

    pub fn queue_name(&self) -> QueueName {
        self.queue.name()
    }

    /// Lease one job, run it and settle the lease
    pub async fn run_once(&self) -> Result<JobReport, QueueError> {
        let Some(lease) = self.queue.lease().await? else {
            return Ok(JobReport::Idle);
        };
        let job_id = lease.job.id;

        match self.handler.handle(lease.job.payload.clone()).await {
            Ok(outcome) => {
                self.queue.complete(&lease).await?;
                Ok(JobReport::Completed { job_id, outcome })
            }
            Err(e) => {
                let reason = e.to_string();
                match self.queue.fail(&lease, &reason).await? {
                    Settlement::Retrying { attempt, .. } => Ok(JobReport::Retrying {
                        job_id,
                        attempt,
                        error: reason,
                    }),
                    Settlement::Failed { attempts } => Ok(JobReport::Failed {
                        job_id,
                        attempts,
                        error: reason,
                    }),
                }
            }
        }
    }

    /// Run jobs until the queue has nothing ready
    pub async fn drain(&self) -> Result<Vec<JobReport>, QueueError> {
        let mut reports = Vec::new();
        loop {
            match self.run_once().await? {
                JobReport::Idle => return Ok(reports),
                report => reports.push(report),
            }
        }
    }
}

fn log_report(queue: QueueName, report: &JobReport) {
    match report {
        JobReport::Idle => {}
        JobReport::Completed { job_id, outcome } => {
            info!(queue = %queue, job_id = %job_id, outcome = %outcome, "job completed");
        }
        JobReport::Retrying {
            job_id,
            attempt,
            error,
        } => {
            warn!(queue = %queue, job_id = %job_id, attempt, error = %error, "job failed, will retry");
        }
        JobReport::Failed {
            job_id,
            attempts,
            error,
        } => {
            error!(queue = %queue, job_id = %job_id, attempts, error = %error, "job failed");
        }
    }
}

/// `concurrency` tasks leasing from one queue until shutdown
pub struct WorkerPool {
    worker: Worker,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(worker: Worker, concurrency: usize, poll_interval: Duration) -> Self {
        Self {
            worker,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) {
        let queue = self.worker.queue_name();
        info!(
            queue = %queue,
            concurrency = self.concurrency,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "worker pool started"
        );

        let tasks = (0..self.concurrency).map(|slot| {
            let worker = self.worker.clone();
            let rx = shutdown_rx.clone();
            tokio::spawn(run_slot(worker, slot, self.poll_interval, rx))
        });

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(queue = %queue, error = %e, "worker task panicked");
            }
        }

        info!(queue = %queue, "worker pool stopped");
    }
}

async fn run_slot(
    worker: Worker,
    slot: usize,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let queue = worker.queue_name();
    debug!(queue = %queue, slot, "worker slot started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let idle = match worker.run_once().await {
            Ok(report) => {
                log_report(queue, &report);
                report == JobReport::Idle
            }
            Err(e) => {
                warn!(queue = %queue, slot, error = %e, "queue operation failed");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    debug!(queue = %queue, slot, "worker slot stopped");
}

/// The three workers of the pipeline, sharing one set of stores and queues
#[derive(Clone)]
pub struct Pipeline {
    pub payments: Worker,
    pub refunds: Worker,
    pub webhooks: Worker,
}

impl Pipeline {
    pub fn new(
        stores: &Stores,
        queues: &Queues,
        outcome: Arc<dyn OutcomePolicy>,
        transport: Arc<dyn WebhookTransport>,
        schedule: RetrySchedule,
    ) -> Self {
        let payment_processor = PaymentProcessor::new(
            stores.payments.clone(),
            stores.merchants.clone(),
            queues.webhooks.clone(),
            outcome.clone(),
        );
        let refund_processor = RefundProcessor::new(
            stores.refunds.clone(),
            stores.merchants.clone(),
            queues.webhooks.clone(),
            outcome,
        );
        let delivery = WebhookDelivery::new(
            stores.merchants.clone(),
            stores.webhook_logs.clone(),
            queues.webhooks.clone(),
            transport,
            schedule,
        );

        Self {
            payments: Worker::new(queues.payments.clone(), Arc::new(payment_processor)),
            refunds: Worker::new(queues.refunds.clone(), Arc::new(refund_processor)),
            webhooks: Worker::new(queues.webhooks.clone(), Arc::new(delivery)),
        }
    }

    /// One pool per queue, sized from the worker configuration
    pub fn into_pools(self, config: &WorkerConfig) -> Vec<WorkerPool> {
        vec![
            WorkerPool::new(self.payments, config.payment_concurrency, config.poll_interval),
            WorkerPool::new(self.refunds, config.refund_concurrency, config.poll_interval),
            WorkerPool::new(self.webhooks, config.webhook_concurrency, config.poll_interval),
        ]
    }

    /// Run every queue until none has a ready job. Jobs enqueued by one
    /// worker for another are picked up in the same call.
    pub async fn drain(&self) -> Result<Vec<JobReport>, QueueError> {
        let mut reports = Vec::new();
        loop {
            let before = reports.len();
            reports.extend(self.payments.drain().await?);
            reports.extend(self.refunds.drain().await?);
            reports.extend(self.webhooks.drain().await?);
            if reports.len() == before {
                return Ok(reports);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryJobQueue, QueuePolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, payload: JobPayload) -> Result<JobOutcome, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let kind = payload.kind();
            let JobPayload::ProcessPayment(job) = payload else {
                return Err(WorkerError::UnexpectedJob {
                    queue: QueueName::Payment,
                    kind,
                });
            };
            if self.fail {
                return Err(WorkerError::MissingRecord {
                    entity: "Payment",
                    id: job.payment_id,
                });
            }
            Ok(JobOutcome::PaymentUnchanged {
                payment_id: job.payment_id,
            })
        }
    }

    fn worker(fail: bool) -> (Worker, Arc<CountingHandler>, Arc<InMemoryJobQueue>) {
        let queue = Arc::new(InMemoryJobQueue::new(
            QueueName::Payment,
            QueuePolicy::default(),
        ));
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail,
        });
        (
            Worker::new(queue.clone(), handler.clone()),
            handler,
            queue,
        )
    }

    #[tokio::test]
    async fn idle_when_queue_empty() {
        let (worker, handler, _) = worker(false);
        assert_eq!(worker.run_once().await.unwrap(), JobReport::Idle);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_error_goes_to_queue_failure_accounting() {
        let (worker, _, queue) = worker(true);
        queue
            .enqueue(JobPayload::process_payment("pay_gone"), Duration::ZERO)
            .await
            .unwrap();

        let report = worker.run_once().await.unwrap();
        match report {
            JobReport::Failed { attempts, error, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(error, "Payment pay_gone not found");
            }
            other => panic!("unexpected report {:?}", other),
        }
        assert_eq!(queue.counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn pool_processes_jobs_and_stops_on_shutdown() {
        let (worker, handler, queue) = worker(false);
        for i in 0..5 {
            queue
                .enqueue(
                    JobPayload::process_payment(format!("pay_{}", i)),
                    Duration::ZERO,
                )
                .await
                .unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let pool = WorkerPool::new(worker, 3, Duration::from_millis(5));
        let running = tokio::spawn(pool.run(rx));

        for _ in 0..200 {
            if queue.counts().await.unwrap().completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        running.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        assert_eq!(queue.counts().await.unwrap().completed, 5);
    }
}
