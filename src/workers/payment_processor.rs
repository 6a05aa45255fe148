use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::simulation::OutcomePolicy;
use super::{JobHandler, JobOutcome, WorkerError};
use crate::database::merchant_repository::MerchantStore;
use crate::database::payment_repository::{Payment, PaymentOutcome, PaymentStatus, PaymentStore};
use crate::queue::{JobPayload, JobQueue, QueueName, WebhookJob};

pub const EVENT_PAYMENT_SUCCESS: &str = "payment.success";
pub const EVENT_PAYMENT_FAILED: &str = "payment.failed";

/// Public fields of a payment as sent in webhook payloads
pub fn payment_snapshot(payment: &Payment) -> JsonValue {
    json!({
        "payment": {
            "id": payment.id,
            "order_id": payment.order_id,
            "amount": payment.amount,
            "currency": payment.currency,
            "method": payment.method,
            "vpa": payment.vpa,
            "status": payment.status,
            "created_at": payment.created_at,
        }
    })
}

/// Moves pending payments to a terminal status and queues the
/// notification for the merchant.
pub struct PaymentProcessor {
    payments: Arc<dyn PaymentStore>,
    merchants: Arc<dyn MerchantStore>,
    webhooks: Arc<dyn JobQueue>,
    outcome: Arc<dyn OutcomePolicy>,
}

impl PaymentProcessor {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        merchants: Arc<dyn MerchantStore>,
        webhooks: Arc<dyn JobQueue>,
        outcome: Arc<dyn OutcomePolicy>,
    ) -> Self {
        Self {
            payments,
            merchants,
            webhooks,
            outcome,
        }
    }

    pub async fn process(&self, payment_id: &str) -> Result<JobOutcome, WorkerError> {
        let payment = self
            .payments
            .find_by_id(payment_id)
            .await?
            .ok_or_else(|| WorkerError::MissingRecord {
                entity: "Payment",
                id: payment_id.to_string(),
            })?;

        if payment.status.is_terminal() {
            return Ok(JobOutcome::PaymentUnchanged {
                payment_id: payment.id,
            });
        }

        tokio::time::sleep(self.outcome.payment_latency()).await;

        let outcome = if self.outcome.payment_succeeds(payment.method) {
            PaymentOutcome::Success
        } else {
            PaymentOutcome::failed()
        };

        // Another delivery of this job may have finished first
        let Some(updated) = self.payments.complete(&payment.id, &outcome).await? else {
            warn!(payment_id = %payment.id, "payment left pending before this job finished");
            return Ok(JobOutcome::PaymentUnchanged {
                payment_id: payment.id,
            });
        };

        info!(
            payment_id = %updated.id,
            merchant_id = %updated.merchant_id,
            method = %updated.method,
            status = %updated.status,
            "payment processed"
        );

        let webhook_enqueued = self.notify(&updated).await?;

        Ok(JobOutcome::PaymentCompleted {
            payment_id: updated.id,
            status: updated.status,
            webhook_enqueued,
        })
    }

    async fn notify(&self, payment: &Payment) -> Result<bool, WorkerError> {
        let merchant = self.merchants.find_by_id(payment.merchant_id).await?;
        if merchant.as_ref().and_then(|m| m.webhook_endpoint()).is_none() {
            return Ok(false);
        }

        let event = match payment.status {
            PaymentStatus::Success => EVENT_PAYMENT_SUCCESS,
            _ => EVENT_PAYMENT_FAILED,
        };
        let job = WebhookJob::new(payment.merchant_id, event, payment_snapshot(payment));
        self.webhooks.enqueue(job.into(), Duration::ZERO).await?;
        Ok(true)
    }
}

#[async_trait]
impl JobHandler for PaymentProcessor {
    async fn handle(&self, payload: JobPayload) -> Result<JobOutcome, WorkerError> {
        match payload {
            JobPayload::ProcessPayment(job) => self.process(&job.payment_id).await,
            other => Err(WorkerError::UnexpectedJob {
                queue: QueueName::Payment,
                kind: other.kind(),
            }),
        }
    }
}
