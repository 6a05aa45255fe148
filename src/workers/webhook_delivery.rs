//! Webhook delivery state machine.
//!
//! Each job makes one signed POST attempt for one log entry. A failed attempt
//! below the ceiling schedules the next one by enqueueing a new delayed job
//! that carries the log id, so a log's attempts are strictly sequential.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{JobHandler, JobOutcome, WorkerError};
use crate::config::WorkerConfig;
use crate::database::merchant_repository::MerchantStore;
use crate::database::webhook_log_repository::{
    DeliveryAttempt, NewWebhookLog, WebhookLog, WebhookLogStore, WebhookStatus,
};
use crate::queue::{JobPayload, JobQueue, QueueName, WebhookJob};
use crate::utils::{sign_payload, truncate_chars};

pub const MAX_DELIVERY_ATTEMPTS: i32 = 5;
pub const RESPONSE_BODY_LIMIT: usize = 1000;
/// Recorded as the response code when no HTTP response was received
pub const TRANSPORT_FAILURE_CODE: i32 = 500;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";

const PRODUCTION_DELAYS_SECS: [u64; 5] = [0, 60, 300, 1800, 7200];
const ACCELERATED_DELAYS_SECS: [u64; 5] = [0, 5, 10, 15, 20];

/// Backoff table indexed by the number of attempts already made.
/// Indexes past the end reuse the last entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl RetrySchedule {
    pub fn production() -> Self {
        Self::from_secs(&PRODUCTION_DELAYS_SECS)
    }

    pub fn accelerated() -> Self {
        Self::from_secs(&ACCELERATED_DELAYS_SECS)
    }

    pub fn from_secs(delays: &[u64]) -> Self {
        Self {
            delays: delays.iter().copied().map(Duration::from_secs).collect(),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        if config.accelerated_retries {
            Self::accelerated()
        } else {
            Self::production()
        }
    }

    pub fn delay_after(&self, attempts: i32) -> Duration {
        let index = attempts.max(0) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// One outbound delivery
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub event: String,
    pub body: Vec<u8>,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, request: &WebhookRequest) -> Result<WebhookResponse, DeliveryError>;
}

/// reqwest-backed transport with a per-request timeout
pub struct HttpWebhookTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpWebhookTransport {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn post(&self, request: &WebhookRequest) -> Result<WebhookResponse, DeliveryError> {
        let response = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, &request.signature)
            .header(EVENT_HEADER, &request.event)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(self.timeout)
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(text) => text,
            Err(e) if e.is_timeout() => return Err(DeliveryError::Timeout(self.timeout)),
            Err(e) => e.to_string(),
        };

        Ok(WebhookResponse { status, body })
    }
}

/// Next state of a log after an attempt
fn next_state(
    delivered: bool,
    attempts: i32,
    now: DateTime<Utc>,
    schedule: &RetrySchedule,
) -> (WebhookStatus, Option<DateTime<Utc>>) {
    if delivered {
        (WebhookStatus::Success, None)
    } else if attempts >= MAX_DELIVERY_ATTEMPTS {
        (WebhookStatus::Failed, None)
    } else {
        let delay = chrono::Duration::from_std(schedule.delay_after(attempts))
            .unwrap_or_else(|_| chrono::Duration::zero());
        (WebhookStatus::Pending, Some(now + delay))
    }
}

/// Serialized `{event, payload}` body; these exact bytes are signed and sent
pub fn webhook_body(log: &WebhookLog) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&json!({
        "event": log.event,
        "payload": log.payload,
    }))
}

pub struct WebhookDelivery {
    merchants: Arc<dyn MerchantStore>,
    logs: Arc<dyn WebhookLogStore>,
    webhooks: Arc<dyn JobQueue>,
    transport: Arc<dyn WebhookTransport>,
    schedule: RetrySchedule,
}

impl WebhookDelivery {
    pub fn new(
        merchants: Arc<dyn MerchantStore>,
        logs: Arc<dyn WebhookLogStore>,
        webhooks: Arc<dyn JobQueue>,
        transport: Arc<dyn WebhookTransport>,
        schedule: RetrySchedule,
    ) -> Self {
        Self {
            merchants,
            logs,
            webhooks,
            transport,
            schedule,
        }
    }

    pub async fn deliver(&self, job: WebhookJob) -> Result<JobOutcome, WorkerError> {
        let merchant = self.merchants.find_by_id(job.merchant_id).await?;
        let Some((url, secret)) = merchant.as_ref().and_then(|m| {
            m.webhook_endpoint()
                .map(|url| (url.to_string(), m.signing_secret().to_string()))
        }) else {
            debug!(merchant_id = %job.merchant_id, event = %job.event, "no webhook endpoint, dropping event");
            return Ok(JobOutcome::WebhookAbandoned {
                merchant_id: job.merchant_id,
            });
        };

        let log = match self.resolve_log(&job).await? {
            ResolvedLog::Live(log) => log,
            ResolvedLog::Stale(log) => {
                debug!(
                    log_id = %log.id,
                    status = %log.status,
                    attempts = log.attempts,
                    retry_count = job.retry_count,
                    "stale webhook job, skipping"
                );
                return Ok(JobOutcome::WebhookSkipped { log_id: log.id });
            }
        };
        let body = webhook_body(&log)?;
        let request = WebhookRequest {
            url,
            event: log.event.clone(),
            signature: sign_payload(&body, &secret),
            body,
        };

        let (delivered, response_code, response_body) = match self.transport.post(&request).await
        {
            Ok(response) => (
                response.is_success(),
                i32::from(response.status),
                response.body,
            ),
            Err(e) => (false, TRANSPORT_FAILURE_CODE, e.to_string()),
        };

        let now = Utc::now();
        let attempts = log.attempts + 1;
        let (status, next_retry_at) = next_state(delivered, attempts, now, &self.schedule);

        let Some(updated) = self
            .logs
            .record_attempt(
                log.id,
                log.attempts,
                DeliveryAttempt {
                    status,
                    attempts,
                    attempted_at: now,
                    response_code,
                    response_body: truncate_chars(&response_body, RESPONSE_BODY_LIMIT),
                    next_retry_at,
                },
            )
            .await?
        else {
            warn!(log_id = %log.id, attempts, "webhook log advanced by another delivery, result dropped");
            return Ok(JobOutcome::WebhookSkipped { log_id: log.id });
        };

        match (updated.status, updated.next_retry_at) {
            (WebhookStatus::Success, _) => {
                info!(log_id = %updated.id, event = %updated.event, attempts, "webhook delivered");
                Ok(JobOutcome::WebhookDelivered {
                    log_id: updated.id,
                    attempts,
                })
            }
            (WebhookStatus::Pending, Some(next_retry_at)) => {
                let delay = (next_retry_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                let next = job.continuation(updated.id, attempts as u32);
                self.webhooks.enqueue(next.into(), delay).await?;

                warn!(
                    log_id = %updated.id,
                    event = %updated.event,
                    attempts,
                    response_code,
                    next_retry_at = %next_retry_at,
                    "webhook delivery failed, retry scheduled"
                );
                Ok(JobOutcome::WebhookRescheduled {
                    log_id: updated.id,
                    attempts,
                    next_retry_at,
                })
            }
            _ => {
                warn!(
                    log_id = %updated.id,
                    event = %updated.event,
                    attempts,
                    response_code,
                    "webhook delivery failed permanently"
                );
                Ok(JobOutcome::WebhookExhausted {
                    log_id: updated.id,
                    attempts,
                })
            }
        }
    }

    /// Reuse the log named by the job, or start a new one. A log id that is
    /// unknown or owned by another merchant starts a new log. A job whose
    /// retry count no longer matches a pending log is stale.
    async fn resolve_log(&self, job: &WebhookJob) -> Result<ResolvedLog, WorkerError> {
        if let Some(log_id) = job.log_id {
            match self.logs.find_by_id(log_id).await? {
                Some(log) if log.merchant_id == job.merchant_id => {
                    let live = log.status == WebhookStatus::Pending
                        && i64::from(log.attempts) == i64::from(job.retry_count);
                    return Ok(if live {
                        ResolvedLog::Live(log)
                    } else {
                        ResolvedLog::Stale(log)
                    });
                }
                _ => warn!(log_id = %log_id, merchant_id = %job.merchant_id, "webhook log not usable, starting a new one"),
            }
        }

        let log = self
            .logs
            .create(NewWebhookLog {
                merchant_id: job.merchant_id,
                event: job.event.clone(),
                payload: job.payload.clone(),
            })
            .await?;
        Ok(ResolvedLog::Live(log))
    }
}

enum ResolvedLog {
    Live(WebhookLog),
    Stale(WebhookLog),
}

#[async_trait]
impl JobHandler for WebhookDelivery {
    async fn handle(&self, payload: JobPayload) -> Result<JobOutcome, WorkerError> {
        match payload {
            JobPayload::DeliverWebhook(job) => self.deliver(job).await,
            other => Err(WorkerError::UnexpectedJob {
                queue: QueueName::Webhook,
                kind: other.kind(),
            }),
        }
    }
}
