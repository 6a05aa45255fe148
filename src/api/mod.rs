//! HTTP surface: merchant API routes, job status and health

pub mod jobs;
pub mod payments;
pub mod webhooks;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::database::Stores;
use crate::health::{HealthChecker, HealthState};
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::queue::Queues;
use crate::services::{IdempotencyGuard, PaymentService, WebhookService};

/// Shared handler state; every field is cheap to clone
#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub queues: Queues,
    pub payments: PaymentService,
    pub webhooks: WebhookService,
    pub idempotency: Arc<IdempotencyGuard>,
    pub health_checker: HealthChecker,
    /// Set while the worker pools are running
    pub workers_running: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(stores: Stores, queues: Queues, health_checker: HealthChecker) -> Self {
        Self {
            payments: PaymentService::new(
                stores.payments.clone(),
                stores.refunds.clone(),
                queues.clone(),
            ),
            webhooks: WebhookService::new(
                stores.merchants.clone(),
                stores.webhook_logs.clone(),
                queues.webhooks.clone(),
            ),
            idempotency: Arc::new(IdempotencyGuard::new(stores.idempotency.clone())),
            health_checker,
            workers_running: Arc::new(AtomicBool::new(false)),
            stores,
            queues,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let merchant_api = Router::new()
        .route("/payments", post(payments::create_payment))
        .route("/payments/{id}", get(payments::get_payment))
        .route("/payments/{id}/capture", post(payments::capture_payment))
        .route("/payments/{id}/refunds", post(payments::create_refund))
        .route("/refunds/{id}", get(payments::get_refund))
        .route("/webhooks", get(webhooks::list_webhooks))
        .route(
            "/webhooks/config",
            get(webhooks::get_config).post(webhooks::update_config),
        )
        .route("/webhooks/test", post(webhooks::test_webhook))
        .route("/webhooks/{id}/retry", post(webhooks::retry_webhook))
        .route("/test/jobs/status", get(jobs::job_status));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", merchant_api)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

/// 503 when a backend is down, otherwise the component report
async fn health(State(state): State<AppState>) -> Response {
    let health_status = state.health_checker.check_health().await;

    if health_status.status == HealthState::Unhealthy {
        error!("Health check failed - service unhealthy");
        (StatusCode::SERVICE_UNAVAILABLE, Json(health_status)).into_response()
    } else {
        info!("Health check passed");
        Json(health_status).into_response()
    }
}
