//! Request-side business logic shared by the HTTP handlers

pub mod auth;
pub mod idempotency;
pub mod payments;
pub mod webhooks;

pub use self::auth::resolve_merchant;
pub use self::idempotency::IdempotencyGuard;
pub use self::payments::{CreatePaymentRequest, CreateRefundRequest, PaymentService};
pub use self::webhooks::{UpdateWebhookConfigRequest, WebhookConfig, WebhookLogPage, WebhookService};
