#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use paygate_backend::database::merchant_repository::{test_merchant, Merchant};
use paygate_backend::database::Stores;
use paygate_backend::queue::{QueuePolicy, Queues};
use paygate_backend::workers::simulation::{FixedOutcome, OutcomePolicy};
use paygate_backend::workers::webhook_delivery::{
    DeliveryError, RetrySchedule, WebhookRequest, WebhookResponse, WebhookTransport,
};
use paygate_backend::workers::Pipeline;

pub const MERCHANT_ENDPOINT: &str = "http://merchant.test/webhooks";

/// Answers with queued statuses, then with `fallback`, and keeps every request
pub struct RecordingTransport {
    requests: Mutex<Vec<WebhookRequest>>,
    scripted: Mutex<VecDeque<u16>>,
    fallback: u16,
}

impl RecordingTransport {
    pub fn responding(status: u16) -> Arc<Self> {
        Self::scripted(&[], status)
    }

    pub fn scripted(statuses: &[u16], fallback: u16) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            scripted: Mutex::new(statuses.iter().copied().collect()),
            fallback,
        })
    }

    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookTransport for RecordingTransport {
    async fn post(&self, request: &WebhookRequest) -> Result<WebhookResponse, DeliveryError> {
        self.requests.lock().unwrap().push(request.clone());
        let status = self
            .scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        Ok(WebhookResponse {
            status,
            body: format!("status {}", status),
        })
    }
}

/// Transport that never gets a response
pub struct UnreachableTransport;

#[async_trait]
impl WebhookTransport for UnreachableTransport {
    async fn post(&self, _request: &WebhookRequest) -> Result<WebhookResponse, DeliveryError> {
        Err(DeliveryError::Transport("connection refused".to_string()))
    }
}

pub struct Harness {
    pub stores: Stores,
    pub queues: Queues,
    pub pipeline: Pipeline,
    pub merchant: Merchant,
}

impl Harness {
    pub async fn new(
        outcome: Arc<dyn OutcomePolicy>,
        transport: Arc<dyn WebhookTransport>,
        schedule: RetrySchedule,
    ) -> Self {
        let stores = Stores::in_memory();
        let queues = Queues::in_memory(QueuePolicy::default());

        let mut merchant = test_merchant();
        merchant.webhook_url = Some(MERCHANT_ENDPOINT.to_string());
        let merchant = stores.merchants.upsert(merchant).await.unwrap();

        let pipeline = Pipeline::new(&stores, &queues, outcome, transport, schedule);
        Self {
            stores,
            queues,
            pipeline,
            merchant,
        }
    }

    /// Payments succeed instantly, webhook retries are immediate
    pub async fn instant(transport: Arc<dyn WebhookTransport>) -> Self {
        Self::new(
            Arc::new(FixedOutcome::always_succeed(Duration::ZERO)),
            transport,
            RetrySchedule::from_secs(&[0]),
        )
        .await
    }
}
