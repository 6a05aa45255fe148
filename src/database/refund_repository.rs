use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::database::error::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Pending,
    Processed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Processed => "processed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RefundStatus::Pending),
            "processed" => Some(RefundStatus::Processed),
            _ => None,
        }
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refund entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Refund {
    pub id: String,
    pub payment_id: String,
    pub merchant_id: Uuid,
    pub amount: i64,
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewRefund {
    pub id: String,
    pub payment_id: String,
    pub merchant_id: Uuid,
    pub amount: i64,
    pub reason: Option<String>,
}

/// Result of the atomic cap-check-and-insert
#[derive(Debug, Clone, PartialEq)]
pub enum RefundCreation {
    Created(Refund),
    /// Requested amount is larger than what remains refundable
    ExceedsAvailable { available: i64 },
}

#[async_trait]
pub trait RefundStore: Send + Sync {
    /// Insert a refund unless the running total of the payment's refunds
    /// would exceed `payment_amount`. Check and insert happen atomically.
    async fn create_within_limit(
        &self,
        refund: NewRefund,
        payment_amount: i64,
    ) -> Result<RefundCreation, DatabaseError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Refund>, DatabaseError>;

    /// pending -> processed. Returns `None` if already processed or missing.
    async fn mark_processed(&self, id: &str) -> Result<Option<Refund>, DatabaseError>;

    /// Sum of all created refunds of a payment, whatever their status
    async fn total_for_payment(&self, payment_id: &str) -> Result<i64, DatabaseError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[cfg(feature = "database")]
pub use self::postgres::PgRefundRepository;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::{FromRow, PgPool};

    const COLUMNS: &str =
        "id, payment_id, merchant_id, amount, reason, status, created_at, processed_at";

    #[derive(Debug, FromRow)]
    struct RefundRow {
        id: String,
        payment_id: String,
        merchant_id: Uuid,
        amount: i64,
        reason: Option<String>,
        status: String,
        created_at: DateTime<Utc>,
        processed_at: Option<DateTime<Utc>>,
    }

    impl TryFrom<RefundRow> for Refund {
        type Error = DatabaseError;

        fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
            let status = RefundStatus::parse(&row.status).ok_or_else(|| {
                DatabaseError::decode(format!("unknown refund status '{}'", row.status))
            })?;

            Ok(Refund {
                id: row.id,
                payment_id: row.payment_id,
                merchant_id: row.merchant_id,
                amount: row.amount,
                reason: row.reason,
                status,
                created_at: row.created_at,
                processed_at: row.processed_at,
            })
        }
    }

    /// Repository for refunds
    pub struct PgRefundRepository {
        pool: PgPool,
    }

    impl PgRefundRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl RefundStore for PgRefundRepository {
        async fn create_within_limit(
            &self,
            refund: NewRefund,
            payment_amount: i64,
        ) -> Result<RefundCreation, DatabaseError> {
            let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

            // Serializes concurrent refunds of the same payment
            sqlx::query("SELECT id FROM payments WHERE id = $1 FOR UPDATE")
                .bind(&refund.payment_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(DatabaseError::from_sqlx)?
                .ok_or_else(|| DatabaseError::not_found("Payment", &refund.payment_id))?;

            let refunded: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM refunds WHERE payment_id = $1",
            )
            .bind(&refund.payment_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            let available = payment_amount - refunded;
            if refund.amount > available {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(RefundCreation::ExceedsAvailable { available });
            }

            let row = sqlx::query_as::<_, RefundRow>(&format!(
                "INSERT INTO refunds (id, payment_id, merchant_id, amount, reason, status)
                 VALUES ($1, $2, $3, $4, $5, 'pending')
                 RETURNING {}",
                COLUMNS
            ))
            .bind(&refund.id)
            .bind(&refund.payment_id)
            .bind(refund.merchant_id)
            .bind(refund.amount)
            .bind(&refund.reason)
            .fetch_one(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            tx.commit().await.map_err(DatabaseError::from_sqlx)?;

            Ok(RefundCreation::Created(Refund::try_from(row)?))
        }

        async fn find_by_id(&self, id: &str) -> Result<Option<Refund>, DatabaseError> {
            let row = sqlx::query_as::<_, RefundRow>(&format!(
                "SELECT {} FROM refunds WHERE id = $1",
                COLUMNS
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            row.map(Refund::try_from).transpose()
        }

        async fn mark_processed(&self, id: &str) -> Result<Option<Refund>, DatabaseError> {
            let row = sqlx::query_as::<_, RefundRow>(&format!(
                "UPDATE refunds
                 SET status = 'processed', processed_at = NOW()
                 WHERE id = $1 AND status = 'pending'
                 RETURNING {}",
                COLUMNS
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            row.map(Refund::try_from).transpose()
        }

        async fn total_for_payment(&self, payment_id: &str) -> Result<i64, DatabaseError> {
            sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM refunds WHERE payment_id = $1",
            )
            .bind(payment_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// The whole map sits behind one mutex, so the cap check and the insert
/// cannot interleave with another refund of the same payment.
#[derive(Default)]
pub struct InMemoryRefundStore {
    refunds: Mutex<HashMap<String, Refund>>,
}

impl InMemoryRefundStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sum_for_payment(refunds: &HashMap<String, Refund>, payment_id: &str) -> i64 {
    refunds
        .values()
        .filter(|r| r.payment_id == payment_id)
        .map(|r| r.amount)
        .sum()
}

#[async_trait]
impl RefundStore for InMemoryRefundStore {
    async fn create_within_limit(
        &self,
        refund: NewRefund,
        payment_amount: i64,
    ) -> Result<RefundCreation, DatabaseError> {
        let mut refunds = self.refunds.lock().await;

        let available = payment_amount - sum_for_payment(&refunds, &refund.payment_id);
        if refund.amount > available {
            return Ok(RefundCreation::ExceedsAvailable { available });
        }

        let created = Refund {
            id: refund.id,
            payment_id: refund.payment_id,
            merchant_id: refund.merchant_id,
            amount: refund.amount,
            reason: refund.reason,
            status: RefundStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
        };
        refunds.insert(created.id.clone(), created.clone());
        Ok(RefundCreation::Created(created))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Refund>, DatabaseError> {
        Ok(self.refunds.lock().await.get(id).cloned())
    }

    async fn mark_processed(&self, id: &str) -> Result<Option<Refund>, DatabaseError> {
        let mut refunds = self.refunds.lock().await;
        match refunds.get_mut(id) {
            Some(r) if r.status == RefundStatus::Pending => {
                r.status = RefundStatus::Processed;
                r.processed_at = Some(Utc::now());
                Ok(Some(r.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn total_for_payment(&self, payment_id: &str) -> Result<i64, DatabaseError> {
        Ok(sum_for_payment(&*self.refunds.lock().await, payment_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_refund(id: &str, amount: i64) -> NewRefund {
        NewRefund {
            id: id.to_string(),
            payment_id: "pay_abc".to_string(),
            merchant_id: Uuid::new_v4(),
            amount,
            reason: Some("customer request".to_string()),
        }
    }

    #[tokio::test]
    async fn test_refunds_cannot_exceed_payment_amount() {
        let store = InMemoryRefundStore::new();

        let first = store
            .create_within_limit(new_refund("rfnd_1", 600), 1000)
            .await
            .unwrap();
        assert!(matches!(first, RefundCreation::Created(_)));

        let second = store
            .create_within_limit(new_refund("rfnd_2", 500), 1000)
            .await
            .unwrap();
        assert_eq!(second, RefundCreation::ExceedsAvailable { available: 400 });

        let exact = store
            .create_within_limit(new_refund("rfnd_3", 400), 1000)
            .await
            .unwrap();
        assert!(matches!(exact, RefundCreation::Created(_)));
        assert_eq!(store.total_for_payment("pay_abc").await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_concurrent_refunds_respect_cap() {
        let store = Arc::new(InMemoryRefundStore::new());

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .create_within_limit(new_refund(&format!("rfnd_{}", i), 300), 1000)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if let RefundCreation::Created(_) = handle.await.unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 3);
        assert_eq!(store.total_for_payment("pay_abc").await.unwrap(), 900);
    }

    #[tokio::test]
    async fn test_mark_processed_is_single_shot() {
        let store = InMemoryRefundStore::new();
        store
            .create_within_limit(new_refund("rfnd_x", 100), 1000)
            .await
            .unwrap();

        let processed = store.mark_processed("rfnd_x").await.unwrap().unwrap();
        assert_eq!(processed.status, RefundStatus::Processed);
        assert!(processed.processed_at.is_some());
        assert!(store.mark_processed("rfnd_x").await.unwrap().is_none());
    }
}
