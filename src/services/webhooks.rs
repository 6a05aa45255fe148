//! Merchant-facing webhook operations: delivery logs, manual retry,
//! endpoint configuration and test events.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::database::merchant_repository::{Merchant, MerchantStore, WebhookConfigUpdate};
use crate::database::webhook_log_repository::{WebhookLog, WebhookLogStore};
use crate::error::{AppError, AppResult, ConflictError};
use crate::queue::{JobQueue, WebhookJob};
use crate::utils::generate_webhook_secret;

pub const DEFAULT_PAGE_LIMIT: i64 = 10;
pub const MAX_PAGE_LIMIT: i64 = 100;
pub const EVENT_PING: &str = "ping";

#[derive(Debug, Clone, Serialize)]
pub struct WebhookLogPage {
    pub data: Vec<WebhookLog>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookConfig {
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

impl From<&Merchant> for WebhookConfig {
    fn from(merchant: &Merchant) -> Self {
        Self {
            webhook_url: merchant.webhook_url.clone(),
            webhook_secret: merchant.webhook_secret.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateWebhookConfigRequest {
    /// An empty string clears the endpoint
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub regenerate_secret: bool,
}

fn validate_webhook_url(url: &str) -> AppResult<()> {
    let url = url.trim();
    if url.is_empty() {
        return Ok(());
    }
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(AppError::invalid_field(
            "webhook_url",
            "must be an http or https URL",
        )),
    }
}

#[derive(Clone)]
pub struct WebhookService {
    merchants: Arc<dyn MerchantStore>,
    logs: Arc<dyn WebhookLogStore>,
    webhooks: Arc<dyn JobQueue>,
}

impl WebhookService {
    pub fn new(
        merchants: Arc<dyn MerchantStore>,
        logs: Arc<dyn WebhookLogStore>,
        webhooks: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            merchants,
            logs,
            webhooks,
        }
    }

    pub async fn list_logs(
        &self,
        merchant: &Merchant,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> AppResult<WebhookLogPage> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let offset = offset.unwrap_or(0).max(0);

        let data = self
            .logs
            .list_for_merchant(merchant.id, limit, offset)
            .await?;
        let total = self.logs.count_for_merchant(merchant.id).await?;

        Ok(WebhookLogPage {
            data,
            total,
            limit,
            offset,
        })
    }

    /// Revive a finished log's delivery chain from attempt zero, delivering
    /// now. A log that is still `pending` already has a chain in the queue.
    pub async fn retry(&self, merchant: &Merchant, log_id: Uuid) -> AppResult<WebhookLog> {
        let log = self
            .logs
            .find_by_id(log_id)
            .await?
            .filter(|log| log.merchant_id == merchant.id)
            .ok_or_else(|| AppError::not_found("Webhook log"))?;

        let reset = self
            .logs
            .reset_for_retry(log.id, Utc::now())
            .await?
            .ok_or_else(|| AppError::conflict(ConflictError::WebhookDeliveryPending))?;

        let job = WebhookJob::new(merchant.id, reset.event.clone(), reset.payload.clone())
            .continuation(reset.id, 0);
        self.webhooks.enqueue(job.into(), Duration::ZERO).await?;

        info!(log_id = %reset.id, merchant_id = %merchant.id, event = %reset.event, "webhook retry scheduled");
        Ok(reset)
    }

    pub fn get_config(&self, merchant: &Merchant) -> WebhookConfig {
        WebhookConfig::from(merchant)
    }

    pub async fn update_config(
        &self,
        merchant: &Merchant,
        request: UpdateWebhookConfigRequest,
    ) -> AppResult<WebhookConfig> {
        if let Some(url) = &request.webhook_url {
            validate_webhook_url(url)?;
        }

        let update = WebhookConfigUpdate {
            webhook_url: request.webhook_url,
            webhook_secret: request
                .regenerate_secret
                .then(generate_webhook_secret),
        };
        let secret_rotated = update.webhook_secret.is_some();

        let updated = self
            .merchants
            .update_webhook_config(merchant.id, update)
            .await?;

        info!(
            merchant_id = %merchant.id,
            webhook_url = ?updated.webhook_url,
            secret_rotated,
            "webhook configuration updated"
        );
        Ok(WebhookConfig::from(&updated))
    }

    /// Queue a `ping` event through the regular delivery pipeline
    pub async fn send_test(&self, merchant: &Merchant) -> AppResult<()> {
        let job = WebhookJob::new(
            merchant.id,
            EVENT_PING,
            json!({
                "message": "This is a test webhook",
                "timestamp": Utc::now(),
            }),
        );
        self.webhooks.enqueue(job.into(), Duration::ZERO).await?;

        info!(merchant_id = %merchant.id, "test webhook scheduled");
        Ok(())
    }
}
