//! Process-local queue used by tests and `SKIP_EXTERNALS` mode.
//!
//! Scheduling runs on `tokio::time::Instant`, so paused-clock tests can
//! advance past delays and lease deadlines.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ensure_queue, ready_at, Job, JobCounts, JobHandle, JobPayload, JobQueue, Lease, QueueError,
    QueueName, QueuePolicy, Settlement,
};

struct ActiveLease {
    job: Job,
    token: Uuid,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    /// Keyed by (ready time, insertion sequence) to keep FIFO among equals
    delayed: BTreeMap<(Instant, u64), Job>,
    waiting: VecDeque<Job>,
    active: HashMap<Uuid, ActiveLease>,
    completed: u64,
    failed: u64,
    seq: u64,
}

impl QueueState {
    fn schedule(&mut self, job: Job, at: Instant) {
        self.seq += 1;
        self.delayed.insert((at, self.seq), job);
    }

    /// Promote due delayed jobs and reclaim expired leases
    fn refresh(&mut self, queue: QueueName, now: Instant) {
        let later = self.delayed.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut self.delayed, later);
        self.waiting.extend(due.into_values());

        let expired: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = self.active.remove(&id) {
                warn!(queue = %queue, job_id = %id, "lease expired, redelivering job");
                self.waiting.push_back(lease.job);
            }
        }
    }

    fn take_active(&mut self, lease: &Lease) -> Result<ActiveLease, QueueError> {
        match self.active.get(&lease.job.id) {
            Some(active) if active.token == lease.token => {}
            _ => {
                return Err(QueueError::LeaseLost {
                    job_id: lease.job.id,
                })
            }
        }
        self.active.remove(&lease.job.id).ok_or(QueueError::LeaseLost {
            job_id: lease.job.id,
        })
    }
}

pub struct InMemoryJobQueue {
    name: QueueName,
    policy: QueuePolicy,
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new(name: QueueName, policy: QueuePolicy) -> Self {
        Self {
            name,
            policy,
            state: Mutex::new(QueueState::default()),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> QueueName {
        self.name
    }

    async fn enqueue(&self, payload: JobPayload, delay: Duration) -> Result<JobHandle, QueueError> {
        ensure_queue(self.name, &payload)?;

        let job = Job::new(self.name, payload);
        let handle = JobHandle {
            id: job.id,
            queue: self.name,
            ready_at: ready_at(delay),
        };

        let mut state = self.state.lock().await;
        if delay.is_zero() {
            state.waiting.push_back(job);
        } else {
            state.schedule(job, Instant::now() + delay);
        }

        debug!(queue = %self.name, job_id = %handle.id, delay_ms = delay.as_millis() as u64, "job enqueued");
        Ok(handle)
    }

    async fn lease(&self) -> Result<Option<Lease>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.refresh(self.name, now);

        let Some(job) = state.waiting.pop_front() else {
            return Ok(None);
        };

        let token = Uuid::new_v4();
        state.active.insert(
            job.id,
            ActiveLease {
                job: job.clone(),
                token,
                deadline: now + self.policy.visibility_timeout,
            },
        );
        Ok(Some(Lease { job, token }))
    }

    async fn complete(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.take_active(lease)?;
        state.completed += 1;
        Ok(())
    }

    async fn fail(&self, lease: &Lease, reason: &str) -> Result<Settlement, QueueError> {
        let mut state = self.state.lock().await;
        let mut job = state.take_active(lease)?.job;
        job.attempts_made += 1;
        job.last_error = Some(reason.to_string());

        if job.attempts_made < self.policy.max_attempts {
            let attempt = job.attempts_made;
            state.schedule(job, Instant::now() + self.policy.retry_backoff);
            Ok(Settlement::Retrying {
                attempt,
                ready_at: ready_at(self.policy.retry_backoff),
            })
        } else {
            state.failed += 1;
            Ok(Settlement::Failed {
                attempts: job.attempts_made,
            })
        }
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let mut state = self.state.lock().await;
        state.refresh(self.name, Instant::now());

        Ok(JobCounts {
            waiting: (state.waiting.len() + state.delayed.len()) as u64,
            active: state.active.len() as u64,
            completed: state.completed,
            failed: state.failed,
        })
    }
}
