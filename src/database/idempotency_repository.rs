use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::database::error::{DatabaseError, DatabaseErrorKind};

/// Response replayed for a repeated idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResponse {
    pub status_code: u16,
    pub body: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub merchant_id: Uuid,
    pub response: StoredResponse,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn find(
        &self,
        key: &str,
        merchant_id: Uuid,
    ) -> Result<Option<IdempotencyRecord>, DatabaseError>;

    /// Fails with `UniqueViolation` when (key, merchant) already exists
    async fn insert(
        &self,
        key: &str,
        merchant_id: Uuid,
        response: &StoredResponse,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn delete(&self, key: &str, merchant_id: Uuid) -> Result<(), DatabaseError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[cfg(feature = "database")]
pub use self::postgres::PgIdempotencyRepository;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::{FromRow, PgPool};

    #[derive(Debug, FromRow)]
    struct IdempotencyRow {
        key: String,
        merchant_id: Uuid,
        response: JsonValue,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    }

    impl TryFrom<IdempotencyRow> for IdempotencyRecord {
        type Error = DatabaseError;

        fn try_from(row: IdempotencyRow) -> Result<Self, Self::Error> {
            let response: StoredResponse = serde_json::from_value(row.response)
                .map_err(|e| DatabaseError::decode(format!("stored response: {}", e)))?;

            Ok(IdempotencyRecord {
                key: row.key,
                merchant_id: row.merchant_id,
                response,
                created_at: row.created_at,
                expires_at: row.expires_at,
            })
        }
    }

    /// Repository for idempotency keys
    pub struct PgIdempotencyRepository {
        pool: PgPool,
    }

    impl PgIdempotencyRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl IdempotencyStore for PgIdempotencyRepository {
        async fn find(
            &self,
            key: &str,
            merchant_id: Uuid,
        ) -> Result<Option<IdempotencyRecord>, DatabaseError> {
            let row = sqlx::query_as::<_, IdempotencyRow>(
                "SELECT key, merchant_id, response, created_at, expires_at
                 FROM idempotency_keys
                 WHERE key = $1 AND merchant_id = $2",
            )
            .bind(key)
            .bind(merchant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            row.map(IdempotencyRecord::try_from).transpose()
        }

        async fn insert(
            &self,
            key: &str,
            merchant_id: Uuid,
            response: &StoredResponse,
            expires_at: DateTime<Utc>,
        ) -> Result<(), DatabaseError> {
            let response = serde_json::to_value(response)
                .map_err(|e| DatabaseError::decode(format!("stored response: {}", e)))?;

            sqlx::query(
                "INSERT INTO idempotency_keys (key, merchant_id, response, expires_at)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(key)
            .bind(merchant_id)
            .bind(response)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            Ok(())
        }

        async fn delete(&self, key: &str, merchant_id: Uuid) -> Result<(), DatabaseError> {
            sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND merchant_id = $2")
                .bind(key)
                .bind(merchant_id)
                .execute(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;

            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<(String, Uuid), IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn find(
        &self,
        key: &str,
        merchant_id: Uuid,
    ) -> Result<Option<IdempotencyRecord>, DatabaseError> {
        Ok(self
            .records
            .read()
            .await
            .get(&(key.to_string(), merchant_id))
            .cloned())
    }

    async fn insert(
        &self,
        key: &str,
        merchant_id: Uuid,
        response: &StoredResponse,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut records = self.records.write().await;
        let id = (key.to_string(), merchant_id);
        if records.contains_key(&id) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: "idempotency_keys_pkey".to_string(),
            }));
        }

        records.insert(
            id,
            IdempotencyRecord {
                key: key.to_string(),
                merchant_id,
                response: response.clone(),
                created_at: Utc::now(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str, merchant_id: Uuid) -> Result<(), DatabaseError> {
        self.records
            .write()
            .await
            .remove(&(key.to_string(), merchant_id));
        Ok(())
    }
}
