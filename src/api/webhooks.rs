//! Webhook log, retry, configuration and test-event endpoints

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use super::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::AuthenticatedMerchant;
use crate::services::{UpdateWebhookConfigRequest, WebhookConfig, WebhookLogPage};

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /api/v1/webhooks?limit&offset
pub async fn list_webhooks(
    State(state): State<AppState>,
    AuthenticatedMerchant(merchant): AuthenticatedMerchant,
    params: Result<Query<ListParams>, QueryRejection>,
) -> AppResult<Json<WebhookLogPage>> {
    let Query(params) =
        params.map_err(|e| AppError::invalid_field("query", e.body_text()))?;

    let page = state
        .webhooks
        .list_logs(&merchant, params.limit, params.offset)
        .await?;
    Ok(Json(page))
}

/// POST /api/v1/webhooks/{id}/retry
pub async fn retry_webhook(
    State(state): State<AppState>,
    AuthenticatedMerchant(merchant): AuthenticatedMerchant,
    Path(log_id): Path<String>,
) -> AppResult<Json<JsonValue>> {
    // A malformed id cannot name any log
    let log_id = Uuid::parse_str(&log_id).map_err(|_| AppError::not_found("Webhook log"))?;
    let log = state.webhooks.retry(&merchant, log_id).await?;

    Ok(Json(json!({
        "id": log.id,
        "status": log.status,
        "message": "Webhook retry scheduled",
    })))
}

/// GET /api/v1/webhooks/config
pub async fn get_config(
    State(state): State<AppState>,
    AuthenticatedMerchant(merchant): AuthenticatedMerchant,
) -> Json<WebhookConfig> {
    Json(state.webhooks.get_config(&merchant))
}

/// POST /api/v1/webhooks/config
pub async fn update_config(
    State(state): State<AppState>,
    AuthenticatedMerchant(merchant): AuthenticatedMerchant,
    body: Result<Json<UpdateWebhookConfigRequest>, JsonRejection>,
) -> AppResult<Json<WebhookConfig>> {
    let Json(request) = body?;
    let config = state.webhooks.update_config(&merchant, request).await?;
    Ok(Json(config))
}

/// POST /api/v1/webhooks/test
pub async fn test_webhook(
    State(state): State<AppState>,
    AuthenticatedMerchant(merchant): AuthenticatedMerchant,
) -> AppResult<Json<JsonValue>> {
    state.webhooks.send_test(&merchant).await?;
    Ok(Json(json!({ "message": "Test webhook scheduled" })))
}
