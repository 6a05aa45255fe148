use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::database::error::DatabaseError;

pub const PAYMENT_FAILED_CODE: &str = "PAYMENT_FAILED";
pub const PAYMENT_FAILED_DESCRIPTION: &str = "Payment processing failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "success" => Some(PaymentStatus::Success),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Card,
    Upi,
    Netbanking,
    Wallet,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Upi => "upi",
            PaymentMethod::Netbanking => "netbanking",
            PaymentMethod::Wallet => "wallet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "card" => Some(PaymentMethod::Card),
            "upi" => Some(PaymentMethod::Upi),
            "netbanking" => Some(PaymentMethod::Netbanking),
            "wallet" => Some(PaymentMethod::Wallet),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payment {
    pub id: String,
    pub merchant_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub vpa: Option<String>,
    pub order_id: String,
    pub status: PaymentStatus,
    pub captured: bool,
    pub error_code: Option<String>,
    pub error_description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub id: String,
    pub merchant_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub vpa: Option<String>,
    pub order_id: String,
}

/// Terminal result of the processing simulation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Success,
    Failed {
        error_code: String,
        error_description: String,
    },
}

impl PaymentOutcome {
    pub fn failed() -> Self {
        PaymentOutcome::Failed {
            error_code: PAYMENT_FAILED_CODE.to_string(),
            error_description: PAYMENT_FAILED_DESCRIPTION.to_string(),
        }
    }

    pub fn status(&self) -> PaymentStatus {
        match self {
            PaymentOutcome::Success => PaymentStatus::Success,
            PaymentOutcome::Failed { .. } => PaymentStatus::Failed,
        }
    }

    fn error_fields(&self) -> (Option<&str>, Option<&str>) {
        match self {
            PaymentOutcome::Success => (None, None),
            PaymentOutcome::Failed {
                error_code,
                error_description,
            } => (Some(error_code.as_str()), Some(error_description.as_str())),
        }
    }
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn create(&self, payment: NewPayment) -> Result<Payment, DatabaseError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Payment>, DatabaseError>;

    /// Move a pending payment to its terminal status.
    /// Returns `None` when the payment is missing or no longer pending.
    async fn complete(
        &self,
        id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<Option<Payment>, DatabaseError>;

    /// Set `captured` on a successful, uncaptured payment.
    /// Returns `None` when the payment is not in that state.
    async fn mark_captured(&self, id: &str) -> Result<Option<Payment>, DatabaseError>;

    async fn count_for_merchant(&self, merchant_id: Uuid) -> Result<i64, DatabaseError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[cfg(feature = "database")]
pub use self::postgres::PgPaymentRepository;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::{FromRow, PgPool};

    const COLUMNS: &str = "id, merchant_id, amount, currency, method, vpa, order_id, status, \
                           captured, error_code, error_description, created_at, updated_at";

    #[derive(Debug, FromRow)]
    struct PaymentRow {
        id: String,
        merchant_id: Uuid,
        amount: i64,
        currency: String,
        method: String,
        vpa: Option<String>,
        order_id: String,
        status: String,
        captured: bool,
        error_code: Option<String>,
        error_description: Option<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    }

    impl TryFrom<PaymentRow> for Payment {
        type Error = DatabaseError;

        fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
            let method = PaymentMethod::parse(&row.method).ok_or_else(|| {
                DatabaseError::decode(format!("unknown payment method '{}'", row.method))
            })?;
            let status = PaymentStatus::parse(&row.status).ok_or_else(|| {
                DatabaseError::decode(format!("unknown payment status '{}'", row.status))
            })?;

            Ok(Payment {
                id: row.id,
                merchant_id: row.merchant_id,
                amount: row.amount,
                currency: row.currency,
                method,
                vpa: row.vpa,
                order_id: row.order_id,
                status,
                captured: row.captured,
                error_code: row.error_code,
                error_description: row.error_description,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
        }
    }

    fn into_payment(row: Option<PaymentRow>) -> Result<Option<Payment>, DatabaseError> {
        row.map(Payment::try_from).transpose()
    }

    /// Repository for payments
    pub struct PgPaymentRepository {
        pool: PgPool,
    }

    impl PgPaymentRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl PaymentStore for PgPaymentRepository {
        async fn create(&self, payment: NewPayment) -> Result<Payment, DatabaseError> {
            let row = sqlx::query_as::<_, PaymentRow>(&format!(
                "INSERT INTO payments (id, merchant_id, amount, currency, method, vpa, order_id, status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
                 RETURNING {}",
                COLUMNS
            ))
            .bind(&payment.id)
            .bind(payment.merchant_id)
            .bind(payment.amount)
            .bind(&payment.currency)
            .bind(payment.method.as_str())
            .bind(&payment.vpa)
            .bind(&payment.order_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            Payment::try_from(row)
        }

        async fn find_by_id(&self, id: &str) -> Result<Option<Payment>, DatabaseError> {
            let row = sqlx::query_as::<_, PaymentRow>(&format!(
                "SELECT {} FROM payments WHERE id = $1",
                COLUMNS
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            into_payment(row)
        }

        async fn complete(
            &self,
            id: &str,
            outcome: &PaymentOutcome,
        ) -> Result<Option<Payment>, DatabaseError> {
            let (error_code, error_description) = outcome.error_fields();
            let row = sqlx::query_as::<_, PaymentRow>(&format!(
                "UPDATE payments
                 SET status = $2, error_code = $3, error_description = $4, updated_at = NOW()
                 WHERE id = $1 AND status = 'pending'
                 RETURNING {}",
                COLUMNS
            ))
            .bind(id)
            .bind(outcome.status().as_str())
            .bind(error_code)
            .bind(error_description)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            into_payment(row)
        }

        async fn mark_captured(&self, id: &str) -> Result<Option<Payment>, DatabaseError> {
            let row = sqlx::query_as::<_, PaymentRow>(&format!(
                "UPDATE payments
                 SET captured = TRUE, updated_at = NOW()
                 WHERE id = $1 AND status = 'success' AND captured = FALSE
                 RETURNING {}",
                COLUMNS
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            into_payment(row)
        }

        async fn count_for_merchant(&self, merchant_id: Uuid) -> Result<i64, DatabaseError> {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM payments WHERE merchant_id = $1")
                .bind(merchant_id)
                .fetch_one(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryPaymentStore {
    payments: RwLock<HashMap<String, Payment>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn create(&self, payment: NewPayment) -> Result<Payment, DatabaseError> {
        let mut payments = self.payments.write().await;
        if payments.contains_key(&payment.id) {
            return Err(DatabaseError::new(
                crate::database::error::DatabaseErrorKind::UniqueViolation {
                    constraint: "payments_pkey".to_string(),
                },
            ));
        }

        let now = Utc::now();
        let created = Payment {
            id: payment.id,
            merchant_id: payment.merchant_id,
            amount: payment.amount,
            currency: payment.currency,
            method: payment.method,
            vpa: payment.vpa,
            order_id: payment.order_id,
            status: PaymentStatus::Pending,
            captured: false,
            error_code: None,
            error_description: None,
            created_at: now,
            updated_at: now,
        };
        payments.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Payment>, DatabaseError> {
        Ok(self.payments.read().await.get(id).cloned())
    }

    async fn complete(
        &self,
        id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut payments = self.payments.write().await;
        let payment = match payments.get_mut(id) {
            Some(p) if p.status == PaymentStatus::Pending => p,
            _ => return Ok(None),
        };

        let (error_code, error_description) = outcome.error_fields();
        payment.status = outcome.status();
        payment.error_code = error_code.map(str::to_string);
        payment.error_description = error_description.map(str::to_string);
        payment.updated_at = Utc::now();
        Ok(Some(payment.clone()))
    }

    async fn mark_captured(&self, id: &str) -> Result<Option<Payment>, DatabaseError> {
        let mut payments = self.payments.write().await;
        match payments.get_mut(id) {
            Some(p) if p.status == PaymentStatus::Success && !p.captured => {
                p.captured = true;
                p.updated_at = Utc::now();
                Ok(Some(p.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn count_for_merchant(&self, merchant_id: Uuid) -> Result<i64, DatabaseError> {
        Ok(self
            .payments
            .read()
            .await
            .values()
            .filter(|p| p.merchant_id == merchant_id)
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_payment(id: &str) -> NewPayment {
        NewPayment {
            id: id.to_string(),
            merchant_id: Uuid::new_v4(),
            amount: 1000,
            currency: "INR".to_string(),
            method: PaymentMethod::Upi,
            vpa: Some("user@upi".to_string()),
            order_id: "order_1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_status_transitions_exactly_once() {
        let store = InMemoryPaymentStore::new();
        store.create(new_payment("pay_1")).await.unwrap();

        let first = store
            .complete("pay_1", &PaymentOutcome::Success)
            .await
            .unwrap();
        assert_eq!(first.unwrap().status, PaymentStatus::Success);

        let second = store
            .complete("pay_1", &PaymentOutcome::failed())
            .await
            .unwrap();
        assert!(second.is_none());

        let stored = store.find_by_id("pay_1").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Success);
        assert!(stored.error_code.is_none());
    }

    #[tokio::test]
    async fn test_failed_outcome_sets_error_fields() {
        let store = InMemoryPaymentStore::new();
        store.create(new_payment("pay_2")).await.unwrap();

        let failed = store
            .complete("pay_2", &PaymentOutcome::failed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert_eq!(failed.error_code.as_deref(), Some(PAYMENT_FAILED_CODE));
        assert_eq!(
            failed.error_description.as_deref(),
            Some(PAYMENT_FAILED_DESCRIPTION)
        );
    }

    #[tokio::test]
    async fn test_capture_only_once_and_only_on_success() {
        let store = InMemoryPaymentStore::new();
        store.create(new_payment("pay_3")).await.unwrap();

        assert!(store.mark_captured("pay_3").await.unwrap().is_none());

        store
            .complete("pay_3", &PaymentOutcome::Success)
            .await
            .unwrap();
        assert!(store.mark_captured("pay_3").await.unwrap().unwrap().captured);
        assert!(store.mark_captured("pay_3").await.unwrap().is_none());
    }

    #[test]
    fn test_method_parsing_is_case_insensitive() {
        assert_eq!(PaymentMethod::parse("UPI"), Some(PaymentMethod::Upi));
        assert_eq!(PaymentMethod::parse("card"), Some(PaymentMethod::Card));
        assert_eq!(PaymentMethod::parse("cash"), None);
    }
}
