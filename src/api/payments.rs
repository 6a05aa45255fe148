//! Payment and refund endpoints

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value as JsonValue};

use super::AppState;
use crate::database::idempotency_repository::StoredResponse;
use crate::database::payment_repository::Payment;
use crate::database::refund_repository::Refund;
use crate::error::AppResult;
use crate::middleware::AuthenticatedMerchant;
use crate::services::{CreatePaymentRequest, CreateRefundRequest};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub fn payment_body(payment: &Payment) -> JsonValue {
    json!({
        "id": payment.id,
        "order_id": payment.order_id,
        "amount": payment.amount,
        "currency": payment.currency,
        "method": payment.method,
        "vpa": payment.vpa,
        "status": payment.status,
        "created_at": payment.created_at,
    })
}

fn payment_detail_body(payment: &Payment) -> JsonValue {
    json!({
        "id": payment.id,
        "order_id": payment.order_id,
        "amount": payment.amount,
        "currency": payment.currency,
        "method": payment.method,
        "vpa": payment.vpa,
        "status": payment.status,
        "captured": payment.captured,
        "error_code": payment.error_code,
        "error_description": payment.error_description,
        "created_at": payment.created_at,
        "updated_at": payment.updated_at,
    })
}

fn refund_body(refund: &Refund) -> JsonValue {
    json!({
        "id": refund.id,
        "payment_id": refund.payment_id,
        "amount": refund.amount,
        "reason": refund.reason,
        "status": refund.status,
        "created_at": refund.created_at,
    })
}

fn refund_detail_body(refund: &Refund) -> JsonValue {
    let mut body = refund_body(refund);
    body["processed_at"] = json!(refund.processed_at);
    body
}

/// POST /api/v1/payments
///
/// With an `Idempotency-Key` header, a repeat inside 24h returns the first
/// response unchanged and creates nothing.
pub async fn create_payment(
    State(state): State<AppState>,
    AuthenticatedMerchant(merchant): AuthenticatedMerchant,
    headers: HeaderMap,
    body: Result<Json<CreatePaymentRequest>, JsonRejection>,
) -> AppResult<Response> {
    let Json(request) = body?;
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let payments = state.payments.clone();
    let merchant_id = merchant.id;
    let stored = state
        .idempotency
        .execute(key, merchant_id, move || async move {
            let payment = payments.create_payment(&merchant, request).await?;
            Ok(StoredResponse {
                status_code: StatusCode::CREATED.as_u16(),
                body: payment_body(&payment),
            })
        })
        .await?;

    let status = StatusCode::from_u16(stored.status_code).unwrap_or(StatusCode::CREATED);
    Ok((status, Json(stored.body)).into_response())
}

/// GET /api/v1/payments/{id}
pub async fn get_payment(
    State(state): State<AppState>,
    AuthenticatedMerchant(merchant): AuthenticatedMerchant,
    Path(payment_id): Path<String>,
) -> AppResult<Json<JsonValue>> {
    let payment = state.payments.get_payment(&merchant, &payment_id).await?;
    Ok(Json(payment_detail_body(&payment)))
}

/// POST /api/v1/payments/{id}/capture
pub async fn capture_payment(
    State(state): State<AppState>,
    AuthenticatedMerchant(merchant): AuthenticatedMerchant,
    Path(payment_id): Path<String>,
) -> AppResult<Json<JsonValue>> {
    let payment = state
        .payments
        .capture_payment(&merchant, &payment_id)
        .await?;

    Ok(Json(json!({
        "id": payment.id,
        "order_id": payment.order_id,
        "amount": payment.amount,
        "currency": payment.currency,
        "method": payment.method,
        "status": payment.status,
        "captured": payment.captured,
        "created_at": payment.created_at,
        "updated_at": payment.updated_at,
    })))
}

/// POST /api/v1/payments/{id}/refunds
pub async fn create_refund(
    State(state): State<AppState>,
    AuthenticatedMerchant(merchant): AuthenticatedMerchant,
    Path(payment_id): Path<String>,
    body: Result<Json<CreateRefundRequest>, JsonRejection>,
) -> AppResult<Response> {
    let Json(request) = body?;
    let refund = state
        .payments
        .create_refund(&merchant, &payment_id, request)
        .await?;

    Ok((StatusCode::CREATED, Json(refund_body(&refund))).into_response())
}

/// GET /api/v1/refunds/{id}
pub async fn get_refund(
    State(state): State<AppState>,
    AuthenticatedMerchant(merchant): AuthenticatedMerchant,
    Path(refund_id): Path<String>,
) -> AppResult<Json<JsonValue>> {
    let refund = state.payments.get_refund(&merchant, &refund_id).await?;
    Ok(Json(refund_detail_body(&refund)))
}
