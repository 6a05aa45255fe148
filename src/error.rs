//! Unified error handling for the gateway API
//!
//! Every synchronous failure maps to an HTTP status and one of a small set of
//! machine-readable codes. Asynchronous failures (webhook delivery, payment
//! simulation) never surface here; they live on the records themselves.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::database::error::DatabaseError;
use crate::queue::QueueError;

/// Error codes returned in the `{error: {code, description}}` body
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    #[serde(rename = "BAD_REQUEST_ERROR")]
    BadRequestError,
    #[serde(rename = "NOT_FOUND_ERROR")]
    NotFoundError,
    #[serde(rename = "AUTHENTICATION_ERROR")]
    AuthenticationError,
    #[serde(rename = "INTERNAL_SERVER_ERROR")]
    InternalServerError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequestError => "BAD_REQUEST_ERROR",
            ErrorCode::NotFoundError => "NOT_FOUND_ERROR",
            ErrorCode::AuthenticationError => "AUTHENTICATION_ERROR",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
        }
    }
}

/// Rejected before any side effect: missing or malformed request fields
#[derive(Debug, Clone)]
pub enum ValidationError {
    MissingFields,
    InvalidAmount { reason: String },
    InvalidField { field: String, reason: String },
}

/// Domain state does not allow the requested operation
#[derive(Debug, Clone)]
pub enum ConflictError {
    PaymentNotCapturable,
    PaymentAlreadyCaptured,
    PaymentNotSuccessful,
    RefundExceedsAvailable { requested: i64, available: i64 },
    /// Manual retry while the log still has a live delivery chain
    WebhookDeliveryPending,
}

/// Infrastructure failures (database, queue)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String },
    Queue { message: String },
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Validation(ValidationError),
    NotFound { entity: &'static str },
    Conflict(ConflictError),
    Authentication { reason: AuthFailure },
    Infrastructure(InfrastructureError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingCredentials,
    InvalidCredentials,
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn missing_fields() -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::MissingFields))
    }

    pub fn invalid_amount(reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::InvalidAmount {
            reason: reason.into(),
        }))
    }

    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }))
    }

    pub fn not_found(entity: &'static str) -> Self {
        Self::new(AppErrorKind::NotFound { entity })
    }

    pub fn conflict(err: ConflictError) -> Self {
        Self::new(AppErrorKind::Conflict(err))
    }

    pub fn authentication(reason: AuthFailure) -> Self {
        Self::new(AppErrorKind::Authentication { reason })
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Validation(_) => 400,
            AppErrorKind::NotFound { .. } => 404,
            AppErrorKind::Conflict(_) => 400,
            AppErrorKind::Authentication { .. } => 401,
            AppErrorKind::Infrastructure(_) => 500,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Validation(_) | AppErrorKind::Conflict(_) => ErrorCode::BadRequestError,
            AppErrorKind::NotFound { .. } => ErrorCode::NotFoundError,
            AppErrorKind::Authentication { .. } => ErrorCode::AuthenticationError,
            AppErrorKind::Infrastructure(_) => ErrorCode::InternalServerError,
        }
    }

    /// Human-readable description placed in the error body
    pub fn description(&self) -> String {
        match &self.kind {
            AppErrorKind::Validation(err) => match err {
                ValidationError::MissingFields => "Missing required fields".to_string(),
                ValidationError::InvalidAmount { reason } => {
                    format!("Invalid amount: {}", reason)
                }
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid {}: {}", field, reason)
                }
            },
            AppErrorKind::NotFound { entity } => format!("{} not found", entity),
            AppErrorKind::Conflict(err) => match err {
                ConflictError::PaymentNotCapturable => {
                    "Payment not in capturable state".to_string()
                }
                ConflictError::PaymentAlreadyCaptured => "Payment already captured".to_string(),
                ConflictError::PaymentNotSuccessful => "Payment not successful".to_string(),
                ConflictError::RefundExceedsAvailable { .. } => {
                    "Refund amount exceeds available amount".to_string()
                }
                ConflictError::WebhookDeliveryPending => {
                    "Webhook delivery still pending".to_string()
                }
            },
            AppErrorKind::Authentication { reason } => match reason {
                AuthFailure::MissingCredentials => "Missing API credentials".to_string(),
                AuthFailure::InvalidCredentials => "Invalid API credentials".to_string(),
            },
            AppErrorKind::Infrastructure(_) => "Internal Server Error".to_string(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AppErrorKind::Infrastructure(InfrastructureError::Database { message }) => {
                write!(f, "database error: {}", message)
            }
            AppErrorKind::Infrastructure(InfrastructureError::Queue { message }) => {
                write!(f, "queue error: {}", message)
            }
            _ => write!(f, "{}", self.description()),
        }
    }
}

impl std::error::Error for AppError {}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: err.to_string(),
        }))
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Queue {
            message: err.to_string(),
        }))
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_over_refund_is_bad_request() {
        let error = AppError::conflict(ConflictError::RefundExceedsAvailable {
            requested: 1500,
            available: 1000,
        });

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::BadRequestError);
        assert_eq!(
            error.description(),
            "Refund amount exceeds available amount"
        );
    }

    #[test]
    fn test_not_found_error() {
        let error = AppError::not_found("Payment");
        assert_eq!(error.status_code(), 404);
        assert_eq!(error.error_code().as_str(), "NOT_FOUND_ERROR");
        assert_eq!(error.description(), "Payment not found");
    }

    #[test]
    fn test_authentication_errors() {
        let missing = AppError::authentication(AuthFailure::MissingCredentials);
        assert_eq!(missing.status_code(), 401);
        assert_eq!(missing.description(), "Missing API credentials");

        let invalid = AppError::authentication(AuthFailure::InvalidCredentials);
        assert_eq!(invalid.error_code(), ErrorCode::AuthenticationError);
    }

    #[test]
    fn test_infrastructure_errors_hide_details_from_clients() {
        let error = AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: "connection refused".to_string(),
        }));

        assert_eq!(error.status_code(), 500);
        assert_eq!(error.description(), "Internal Server Error");
        assert!(error.to_string().contains("connection refused"));
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::BadRequestError).unwrap();
        assert_eq!(json, "\"BAD_REQUEST_ERROR\"");
    }
}
