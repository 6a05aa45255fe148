//! End-to-end runs of the payment, refund and webhook workers against the
//! in-memory stores and queues.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, RecordingTransport, UnreachableTransport, MERCHANT_ENDPOINT};
use paygate_backend::database::merchant_repository::{
    WebhookConfigUpdate, TEST_MERCHANT_WEBHOOK_SECRET,
};
use paygate_backend::database::payment_repository::{Payment, PaymentStatus};
use paygate_backend::database::refund_repository::RefundStatus;
use paygate_backend::database::webhook_log_repository::{WebhookLog, WebhookStatus};
use paygate_backend::queue::{JobQueue, QueueName, WebhookJob};
use paygate_backend::services::{
    CreatePaymentRequest, CreateRefundRequest, PaymentService, WebhookService,
};
use paygate_backend::utils::verify_signature;
use paygate_backend::workers::simulation::FixedOutcome;
use paygate_backend::workers::webhook_delivery::RetrySchedule;
use paygate_backend::workers::{JobOutcome, JobReport};

fn payment_service(h: &Harness) -> PaymentService {
    PaymentService::new(
        h.stores.payments.clone(),
        h.stores.refunds.clone(),
        h.queues.clone(),
    )
}

fn webhook_service(h: &Harness) -> WebhookService {
    WebhookService::new(
        h.stores.merchants.clone(),
        h.stores.webhook_logs.clone(),
        h.queues.webhooks.clone(),
    )
}

async fn create_upi_payment(h: &Harness, amount: i64) -> Payment {
    payment_service(h)
        .create_payment(
            &h.merchant,
            CreatePaymentRequest {
                amount: Some(amount),
                currency: Some("INR".to_string()),
                method: Some("upi".to_string()),
                vpa: Some("user@paytm".to_string()),
                order_id: Some("order_1".to_string()),
            },
        )
        .await
        .unwrap()
}

async fn only_log(h: &Harness) -> WebhookLog {
    let logs = h
        .stores
        .webhook_logs
        .list_for_merchant(h.merchant.id, 10, 0)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1, "expected exactly one webhook log");
    logs.into_iter().next().unwrap()
}

#[tokio::test]
async fn upi_payment_in_test_mode_succeeds_and_notifies_merchant() {
    let transport = RecordingTransport::responding(200);
    let h = Harness::instant(transport.clone()).await;

    let payment = create_upi_payment(&h, 50000).await;
    assert_eq!(payment.status, PaymentStatus::Pending);

    h.pipeline.drain().await.unwrap();

    let stored = h.stores.payments.find_by_id(&payment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Success);
    assert!(stored.error_code.is_none());

    let log = only_log(&h).await;
    assert_eq!(log.event, "payment.success");
    assert_eq!(log.status, WebhookStatus::Success);
    assert_eq!(log.attempts, 1);
    assert_eq!(log.response_code, Some(200));
    assert!(log.next_retry_at.is_none());

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.url, MERCHANT_ENDPOINT);
    assert_eq!(request.event, "payment.success");

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["event"], "payment.success");
    assert_eq!(body["payload"]["payment"]["id"], payment.id.as_str());
    assert_eq!(body["payload"]["payment"]["order_id"], "order_1");
    assert_eq!(body["payload"]["payment"]["status"], "success");

    assert!(verify_signature(
        &request.body,
        TEST_MERCHANT_WEBHOOK_SECRET,
        &request.signature
    ));
    assert!(!verify_signature(
        &request.body,
        "whsec_wrong",
        &request.signature
    ));
}

#[tokio::test]
async fn failed_payment_records_error_and_sends_failed_event() {
    let transport = RecordingTransport::responding(200);
    let h = Harness::new(
        Arc::new(FixedOutcome::always_fail(Duration::ZERO)),
        transport.clone(),
        RetrySchedule::from_secs(&[0]),
    )
    .await;

    let payment = create_upi_payment(&h, 1000).await;
    h.pipeline.drain().await.unwrap();

    let stored = h.stores.payments.find_by_id(&payment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Failed);
    assert_eq!(stored.error_code.as_deref(), Some("PAYMENT_FAILED"));
    assert_eq!(
        stored.error_description.as_deref(),
        Some("Payment processing failed")
    );

    assert_eq!(only_log(&h).await.event, "payment.failed");
}

#[tokio::test]
async fn merchant_without_endpoint_gets_no_webhook_log() {
    let transport = RecordingTransport::responding(200);
    let h = Harness::instant(transport.clone()).await;
    h.stores
        .merchants
        .update_webhook_config(
            h.merchant.id,
            WebhookConfigUpdate {
                webhook_url: Some(String::new()),
                webhook_secret: None,
            },
        )
        .await
        .unwrap();

    let payment = create_upi_payment(&h, 1000).await;
    h.pipeline.drain().await.unwrap();

    let stored = h.stores.payments.find_by_id(&payment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Success);
    assert_eq!(
        h.stores
            .webhook_logs
            .count_for_merchant(h.merchant.id)
            .await
            .unwrap(),
        0
    );
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn refund_is_processed_and_announced() {
    let transport = RecordingTransport::responding(200);
    let h = Harness::instant(transport.clone()).await;

    let payment = create_upi_payment(&h, 1000).await;
    h.pipeline.drain().await.unwrap();

    let refund = payment_service(&h)
        .create_refund(
            &h.merchant,
            &payment.id,
            CreateRefundRequest {
                amount: Some(400),
                reason: Some("customer request".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(refund.status, RefundStatus::Pending);

    h.pipeline.drain().await.unwrap();

    let stored = h.stores.refunds.find_by_id(&refund.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RefundStatus::Processed);
    assert!(stored.processed_at.is_some());

    let events: Vec<String> = transport.requests().into_iter().map(|r| r.event).collect();
    assert_eq!(events, vec!["payment.success", "refund.processed"]);
}

#[tokio::test]
async fn five_failed_attempts_exhaust_the_log() {
    let h = Harness::instant(Arc::new(UnreachableTransport)).await;

    create_upi_payment(&h, 1000).await;
    let reports = h.pipeline.drain().await.unwrap();

    let log = only_log(&h).await;
    assert_eq!(log.status, WebhookStatus::Failed);
    assert_eq!(log.attempts, 5);
    assert!(log.next_retry_at.is_none());
    assert_eq!(log.response_code, Some(500));
    assert!(log
        .response_body
        .as_deref()
        .unwrap_or_default()
        .contains("connection refused"));

    let exhausted = reports
        .iter()
        .filter(|r| {
            matches!(
                r,
                JobReport::Completed {
                    outcome: JobOutcome::WebhookExhausted { .. },
                    ..
                }
            )
        })
        .count();
    assert_eq!(exhausted, 1);
    assert_eq!(h.queues.webhooks.counts().await.unwrap().waiting, 0);
}

#[tokio::test]
async fn delivery_recovers_before_the_ceiling() {
    let transport = RecordingTransport::scripted(&[500, 503], 200);
    let h = Harness::instant(transport.clone()).await;

    create_upi_payment(&h, 1000).await;
    h.pipeline.drain().await.unwrap();

    let log = only_log(&h).await;
    assert_eq!(log.status, WebhookStatus::Success);
    assert_eq!(log.attempts, 3);
    assert!(log.next_retry_at.is_none());

    // Every attempt of one log sends the same signed bytes
    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.body == requests[0].body));
    assert!(requests.iter().all(|r| r.signature == requests[0].signature));
}

#[tokio::test(start_paused = true)]
async fn failed_attempts_follow_the_backoff_table() {
    let h = Harness::new(
        Arc::new(FixedOutcome::always_succeed(Duration::ZERO)),
        RecordingTransport::responding(500),
        RetrySchedule::accelerated(),
    )
    .await;

    create_upi_payment(&h, 1000).await;
    h.pipeline.payments.drain().await.unwrap();

    let expected_delays = [5, 10, 15, 20];
    for (i, delay) in expected_delays.iter().enumerate() {
        let report = h.pipeline.webhooks.run_once().await.unwrap();
        assert!(matches!(report, JobReport::Completed { .. }));

        let log = only_log(&h).await;
        assert_eq!(log.status, WebhookStatus::Pending);
        assert_eq!(log.attempts, i as i32 + 1);
        let scheduled = log.next_retry_at.unwrap() - log.last_attempt_at.unwrap();
        assert_eq!(scheduled.num_seconds(), *delay);

        // Not eligible until the delay has passed
        assert_eq!(h.pipeline.webhooks.run_once().await.unwrap(), JobReport::Idle);
        tokio::time::advance(Duration::from_secs(*delay as u64)).await;
    }

    h.pipeline.webhooks.run_once().await.unwrap();
    let log = only_log(&h).await;
    assert_eq!(log.status, WebhookStatus::Failed);
    assert_eq!(log.attempts, 5);
    assert!(log.next_retry_at.is_none());
}

#[tokio::test]
async fn manual_retry_revives_failed_log() {
    let transport = RecordingTransport::scripted(&[500; 5], 200);
    let h = Harness::instant(transport.clone()).await;

    create_upi_payment(&h, 1000).await;
    h.pipeline.drain().await.unwrap();
    let failed = only_log(&h).await;
    assert_eq!(failed.status, WebhookStatus::Failed);

    let reset = webhook_service(&h)
        .retry(&h.merchant, failed.id)
        .await
        .unwrap();
    assert_eq!(reset.attempts, 0);
    assert_eq!(reset.status, WebhookStatus::Pending);
    assert_eq!(
        h.queues.get(QueueName::Webhook).counts().await.unwrap().waiting,
        1
    );

    h.pipeline.drain().await.unwrap();

    let log = only_log(&h).await;
    assert_eq!(log.id, failed.id);
    assert_eq!(log.status, WebhookStatus::Success);
    assert_eq!(log.attempts, 1);
    assert_eq!(transport.requests().len(), 6);
}

fn continuation_for(h: &Harness, log: &WebhookLog, retry_count: u32) -> WebhookJob {
    WebhookJob::new(h.merchant.id, log.event.clone(), log.payload.clone())
        .continuation(log.id, retry_count)
}

#[tokio::test]
async fn redelivered_job_leaves_delivered_log_alone() {
    let transport = RecordingTransport::scripted(&[200], 500);
    let h = Harness::instant(transport.clone()).await;

    create_upi_payment(&h, 1000).await;
    h.pipeline.drain().await.unwrap();
    let delivered = only_log(&h).await;
    assert_eq!(delivered.status, WebhookStatus::Success);

    // Same job handed out again, plus one whose count matches the log
    for retry_count in [0, 1] {
        h.queues
            .webhooks
            .enqueue(
                continuation_for(&h, &delivered, retry_count).into(),
                Duration::ZERO,
            )
            .await
            .unwrap();
    }
    let reports = h.pipeline.webhooks.drain().await.unwrap();

    let skipped = reports
        .iter()
        .filter(|r| {
            matches!(
                r,
                JobReport::Completed {
                    outcome: JobOutcome::WebhookSkipped { .. },
                    ..
                }
            )
        })
        .count();
    assert_eq!(skipped, 2);

    let log = only_log(&h).await;
    assert_eq!(log.status, WebhookStatus::Success);
    assert_eq!(log.attempts, 1);
    assert!(log.next_retry_at.is_none());
    assert_eq!(transport.requests().len(), 1);
    assert_eq!(h.queues.webhooks.counts().await.unwrap().waiting, 0);
}

#[tokio::test]
async fn manual_retry_on_pending_log_keeps_one_chain() {
    let transport = RecordingTransport::responding(500);
    let h = Harness::new(
        Arc::new(FixedOutcome::always_succeed(Duration::ZERO)),
        transport.clone(),
        RetrySchedule::accelerated(),
    )
    .await;

    create_upi_payment(&h, 1000).await;
    h.pipeline.payments.drain().await.unwrap();
    h.pipeline.webhooks.run_once().await.unwrap();

    let pending = only_log(&h).await;
    assert_eq!(pending.status, WebhookStatus::Pending);
    assert_eq!(pending.attempts, 1);
    assert_eq!(h.queues.webhooks.counts().await.unwrap().waiting, 1);

    let err = webhook_service(&h)
        .retry(&h.merchant, pending.id)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let log = only_log(&h).await;
    assert_eq!(log.attempts, 1);
    assert_eq!(log.next_retry_at, pending.next_retry_at);
    assert_eq!(h.queues.webhooks.counts().await.unwrap().waiting, 1);
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn leftover_job_from_previous_chain_is_dropped_after_manual_retry() {
    let transport = RecordingTransport::scripted(&[500; 5], 200);
    let h = Harness::instant(transport.clone()).await;

    create_upi_payment(&h, 1000).await;
    h.pipeline.drain().await.unwrap();
    let failed = only_log(&h).await;
    assert_eq!(failed.status, WebhookStatus::Failed);

    // A copy of attempt 4 of the exhausted chain is still around
    h.queues
        .webhooks
        .enqueue(continuation_for(&h, &failed, 3).into(), Duration::ZERO)
        .await
        .unwrap();
    webhook_service(&h)
        .retry(&h.merchant, failed.id)
        .await
        .unwrap();

    h.pipeline.webhooks.drain().await.unwrap();

    let log = only_log(&h).await;
    assert_eq!(log.status, WebhookStatus::Success);
    assert_eq!(log.attempts, 1);
    assert_eq!(transport.requests().len(), 6);
}
