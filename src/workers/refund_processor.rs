use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::simulation::OutcomePolicy;
use super::{JobHandler, JobOutcome, WorkerError};
use crate::database::merchant_repository::MerchantStore;
use crate::database::refund_repository::{Refund, RefundStatus, RefundStore};
use crate::queue::{JobPayload, JobQueue, QueueName, WebhookJob};

pub const EVENT_REFUND_PROCESSED: &str = "refund.processed";

pub fn refund_snapshot(refund: &Refund) -> JsonValue {
    json!({
        "refund": {
            "id": refund.id,
            "payment_id": refund.payment_id,
            "amount": refund.amount,
            "reason": refund.reason,
            "status": refund.status,
            "created_at": refund.created_at,
            "processed_at": refund.processed_at,
        }
    })
}

pub struct RefundProcessor {
    refunds: Arc<dyn RefundStore>,
    merchants: Arc<dyn MerchantStore>,
    webhooks: Arc<dyn JobQueue>,
    outcome: Arc<dyn OutcomePolicy>,
}

impl RefundProcessor {
    pub fn new(
        refunds: Arc<dyn RefundStore>,
        merchants: Arc<dyn MerchantStore>,
        webhooks: Arc<dyn JobQueue>,
        outcome: Arc<dyn OutcomePolicy>,
    ) -> Self {
        Self {
            refunds,
            merchants,
            webhooks,
            outcome,
        }
    }

    /// A vanished or already processed refund is a no-op, not an error
    pub async fn process(&self, refund_id: &str) -> Result<JobOutcome, WorkerError> {
        let skipped = || JobOutcome::RefundSkipped {
            refund_id: refund_id.to_string(),
        };

        let Some(refund) = self.refunds.find_by_id(refund_id).await? else {
            debug!(refund_id, "refund not found, skipping");
            return Ok(skipped());
        };
        if refund.status == RefundStatus::Processed {
            return Ok(skipped());
        }

        tokio::time::sleep(self.outcome.refund_latency()).await;

        let Some(processed) = self.refunds.mark_processed(&refund.id).await? else {
            return Ok(skipped());
        };

        info!(
            refund_id = %processed.id,
            payment_id = %processed.payment_id,
            amount = processed.amount,
            "refund processed"
        );

        let merchant = self.merchants.find_by_id(processed.merchant_id).await?;
        let webhook_enqueued = match merchant.as_ref().and_then(|m| m.webhook_endpoint()) {
            Some(_) => {
                let job = WebhookJob::new(
                    processed.merchant_id,
                    EVENT_REFUND_PROCESSED,
                    refund_snapshot(&processed),
                );
                self.webhooks.enqueue(job.into(), Duration::ZERO).await?;
                true
            }
            None => false,
        };

        Ok(JobOutcome::RefundProcessed {
            refund_id: processed.id,
            webhook_enqueued,
        })
    }
}

#[async_trait]
impl JobHandler for RefundProcessor {
    async fn handle(&self, payload: JobPayload) -> Result<JobOutcome, WorkerError> {
        match payload {
            JobPayload::ProcessRefund(job) => self.process(&job.refund_id).await,
            other => Err(WorkerError::UnexpectedJob {
                queue: QueueName::Refund,
                kind: other.kind(),
            }),
        }
    }
}
