//! Job payloads carried by the work queues.
//!
//! Payloads hold copies of identifiers and event data only; workers re-read
//! the authoritative records before acting.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::QueueName;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentJob {
    pub payment_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundJob {
    pub refund_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookJob {
    pub merchant_id: Uuid,
    pub event: String,
    pub payload: JsonValue,
    /// Present on every re-enqueue of an existing delivery chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<Uuid>,
    #[serde(default)]
    pub retry_count: u32,
}

impl WebhookJob {
    /// First delivery of a fresh event
    pub fn new(merchant_id: Uuid, event: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            merchant_id,
            event: event.into(),
            payload,
            log_id: None,
            retry_count: 0,
        }
    }

    /// Continuation of an existing log's delivery chain
    pub fn continuation(&self, log_id: Uuid, retry_count: u32) -> Self {
        Self {
            log_id: Some(log_id),
            retry_count,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum JobPayload {
    #[serde(rename = "process-payment")]
    ProcessPayment(PaymentJob),
    #[serde(rename = "process-refund")]
    ProcessRefund(RefundJob),
    #[serde(rename = "deliver-webhook")]
    DeliverWebhook(WebhookJob),
}

impl JobPayload {
    pub fn process_payment(payment_id: impl Into<String>) -> Self {
        JobPayload::ProcessPayment(PaymentJob {
            payment_id: payment_id.into(),
        })
    }

    pub fn process_refund(refund_id: impl Into<String>) -> Self {
        JobPayload::ProcessRefund(RefundJob {
            refund_id: refund_id.into(),
        })
    }

    /// The only queue this payload may travel on
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::ProcessPayment(_) => QueueName::Payment,
            JobPayload::ProcessRefund(_) => QueueName::Refund,
            JobPayload::DeliverWebhook(_) => QueueName::Webhook,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::ProcessPayment(_) => "process-payment",
            JobPayload::ProcessRefund(_) => "process-refund",
            JobPayload::DeliverWebhook(_) => "deliver-webhook",
        }
    }
}

impl From<WebhookJob> for JobPayload {
    fn from(job: WebhookJob) -> Self {
        JobPayload::DeliverWebhook(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payment_job_wire_shape() {
        let value = serde_json::to_value(JobPayload::process_payment("pay_1")).unwrap();
        assert_eq!(value, json!({"name": "process-payment", "paymentId": "pay_1"}));
    }

    #[test]
    fn webhook_job_omits_missing_log_id() {
        let merchant = Uuid::new_v4();
        let job = WebhookJob::new(merchant, "ping", json!({"message": "hi"}));
        let value = serde_json::to_value(JobPayload::from(job)).unwrap();

        assert_eq!(value["merchantId"], json!(merchant.to_string()));
        assert_eq!(value["retryCount"], json!(0));
        assert!(value.get("logId").is_none());
    }

    #[test]
    fn webhook_job_defaults_when_decoding_minimal_shape() {
        let merchant = Uuid::new_v4();
        let decoded: JobPayload = serde_json::from_value(json!({
            "name": "deliver-webhook",
            "merchantId": merchant,
            "event": "payment.success",
            "payload": {"payment": {"id": "pay_1"}}
        }))
        .unwrap();

        match decoded {
            JobPayload::DeliverWebhook(job) => {
                assert_eq!(job.log_id, None);
                assert_eq!(job.retry_count, 0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn continuation_keeps_event_and_payload() {
        let job = WebhookJob::new(Uuid::new_v4(), "refund.processed", json!({"refund": {}}));
        let log_id = Uuid::new_v4();
        let next = job.continuation(log_id, 3);

        assert_eq!(next.event, job.event);
        assert_eq!(next.payload, job.payload);
        assert_eq!(next.log_id, Some(log_id));
        assert_eq!(next.retry_count, 3);
    }
}
