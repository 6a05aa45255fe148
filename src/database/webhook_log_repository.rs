use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::database::error::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Pending,
    Success,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Success => "success",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(WebhookStatus::Pending),
            "success" => Some(WebhookStatus::Success),
            "failed" => Some(WebhookStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One webhook event and its delivery history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookLog {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub event: String,
    pub payload: JsonValue,
    pub status: WebhookStatus,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookLog {
    pub merchant_id: Uuid,
    pub event: String,
    pub payload: JsonValue,
}

/// Everything the delivery worker writes back after one attempt
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub status: WebhookStatus,
    pub attempts: i32,
    pub attempted_at: DateTime<Utc>,
    pub response_code: i32,
    pub response_body: String,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait WebhookLogStore: Send + Sync {
    /// New log in `pending` with zero attempts
    async fn create(&self, log: NewWebhookLog) -> Result<WebhookLog, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookLog>, DatabaseError>;

    /// Applied only while the log is `pending` with `previous_attempts`
    /// attempts; `None` means another delivery got there first.
    async fn record_attempt(
        &self,
        id: Uuid,
        previous_attempts: i32,
        attempt: DeliveryAttempt,
    ) -> Result<Option<WebhookLog>, DatabaseError>;

    /// Operator retry: attempts back to zero, status pending. `None` when the
    /// log is still `pending`.
    async fn reset_for_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<Option<WebhookLog>, DatabaseError>;

    /// Newest first
    async fn list_for_merchant(
        &self,
        merchant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookLog>, DatabaseError>;

    async fn count_for_merchant(&self, merchant_id: Uuid) -> Result<i64, DatabaseError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[cfg(feature = "database")]
pub use self::postgres::PgWebhookLogRepository;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::{FromRow, PgPool};

    const COLUMNS: &str = "id, merchant_id, event, payload, status, attempts, last_attempt_at, \
                           response_code, response_body, next_retry_at, created_at";

    #[derive(Debug, FromRow)]
    struct WebhookLogRow {
        id: Uuid,
        merchant_id: Uuid,
        event: String,
        payload: JsonValue,
        status: String,
        attempts: i32,
        last_attempt_at: Option<DateTime<Utc>>,
        response_code: Option<i32>,
        response_body: Option<String>,
        next_retry_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    }

    impl TryFrom<WebhookLogRow> for WebhookLog {
        type Error = DatabaseError;

        fn try_from(row: WebhookLogRow) -> Result<Self, Self::Error> {
            let status = WebhookStatus::parse(&row.status).ok_or_else(|| {
                DatabaseError::decode(format!("unknown webhook status '{}'", row.status))
            })?;

            Ok(WebhookLog {
                id: row.id,
                merchant_id: row.merchant_id,
                event: row.event,
                payload: row.payload,
                status,
                attempts: row.attempts,
                last_attempt_at: row.last_attempt_at,
                response_code: row.response_code,
                response_body: row.response_body,
                next_retry_at: row.next_retry_at,
                created_at: row.created_at,
            })
        }
    }

    /// Repository for webhook delivery logs
    pub struct PgWebhookLogRepository {
        pool: PgPool,
    }

    impl PgWebhookLogRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl WebhookLogStore for PgWebhookLogRepository {
        async fn create(&self, log: NewWebhookLog) -> Result<WebhookLog, DatabaseError> {
            let row = sqlx::query_as::<_, WebhookLogRow>(&format!(
                "INSERT INTO webhook_logs (id, merchant_id, event, payload, status, attempts)
                 VALUES ($1, $2, $3, $4, 'pending', 0)
                 RETURNING {}",
                COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(log.merchant_id)
            .bind(&log.event)
            .bind(&log.payload)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            WebhookLog::try_from(row)
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookLog>, DatabaseError> {
            let row = sqlx::query_as::<_, WebhookLogRow>(&format!(
                "SELECT {} FROM webhook_logs WHERE id = $1",
                COLUMNS
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            row.map(WebhookLog::try_from).transpose()
        }

        async fn record_attempt(
            &self,
            id: Uuid,
            previous_attempts: i32,
            attempt: DeliveryAttempt,
        ) -> Result<Option<WebhookLog>, DatabaseError> {
            let row = sqlx::query_as::<_, WebhookLogRow>(&format!(
                "UPDATE webhook_logs
                 SET status = $3, attempts = $4, last_attempt_at = $5,
                     response_code = $6, response_body = $7, next_retry_at = $8
                 WHERE id = $1 AND status = 'pending' AND attempts = $2
                 RETURNING {}",
                COLUMNS
            ))
            .bind(id)
            .bind(previous_attempts)
            .bind(attempt.status.as_str())
            .bind(attempt.attempts)
            .bind(attempt.attempted_at)
            .bind(attempt.response_code)
            .bind(&attempt.response_body)
            .bind(attempt.next_retry_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            row.map(WebhookLog::try_from).transpose()
        }

        async fn reset_for_retry(
            &self,
            id: Uuid,
            next_retry_at: DateTime<Utc>,
        ) -> Result<Option<WebhookLog>, DatabaseError> {
            let row = sqlx::query_as::<_, WebhookLogRow>(&format!(
                "UPDATE webhook_logs
                 SET status = 'pending', attempts = 0, next_retry_at = $2
                 WHERE id = $1 AND status <> 'pending'
                 RETURNING {}",
                COLUMNS
            ))
            .bind(id)
            .bind(next_retry_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            row.map(WebhookLog::try_from).transpose()
        }

        async fn list_for_merchant(
            &self,
            merchant_id: Uuid,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<WebhookLog>, DatabaseError> {
            let rows = sqlx::query_as::<_, WebhookLogRow>(&format!(
                "SELECT {} FROM webhook_logs
                 WHERE merchant_id = $1
                 ORDER BY created_at DESC
                 LIMIT $2 OFFSET $3",
                COLUMNS
            ))
            .bind(merchant_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            rows.into_iter().map(WebhookLog::try_from).collect()
        }

        async fn count_for_merchant(&self, merchant_id: Uuid) -> Result<i64, DatabaseError> {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM webhook_logs WHERE merchant_id = $1")
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
pub struct InMemoryWebhookLogStore {
    logs: RwLock<HashMap<Uuid, WebhookLog>>,
}

impl InMemoryWebhookLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookLogStore for InMemoryWebhookLogStore {
    async fn create(&self, log: NewWebhookLog) -> Result<WebhookLog, DatabaseError> {
        let created = WebhookLog {
            id: Uuid::new_v4(),
            merchant_id: log.merchant_id,
            event: log.event,
            payload: log.payload,
            status: WebhookStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            response_code: None,
            response_body: None,
            next_retry_at: None,
            created_at: Utc::now(),
        };
        self.logs.write().await.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookLog>, DatabaseError> {
        Ok(self.logs.read().await.get(&id).cloned())
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        previous_attempts: i32,
        attempt: DeliveryAttempt,
    ) -> Result<Option<WebhookLog>, DatabaseError> {
        let mut logs = self.logs.write().await;
        let Some(log) = logs.get_mut(&id).filter(|log| {
            log.status == WebhookStatus::Pending && log.attempts == previous_attempts
        }) else {
            return Ok(None);
        };

        log.status = attempt.status;
        log.attempts = attempt.attempts;
        log.last_attempt_at = Some(attempt.attempted_at);
        log.response_code = Some(attempt.response_code);
        log.response_body = Some(attempt.response_body);
        log.next_retry_at = attempt.next_retry_at;
        Ok(Some(log.clone()))
    }

    async fn reset_for_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<Option<WebhookLog>, DatabaseError> {
        let mut logs = self.logs.write().await;
        let Some(log) = logs
            .get_mut(&id)
            .filter(|log| log.status != WebhookStatus::Pending)
        else {
            return Ok(None);
        };

        log.status = WebhookStatus::Pending;
        log.attempts = 0;
        log.next_retry_at = Some(next_retry_at);
        Ok(Some(log.clone()))
    }

    async fn list_for_merchant(
        &self,
        merchant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookLog>, DatabaseError> {
        let logs = self.logs.read().await;
        let mut owned: Vec<WebhookLog> = logs
            .values()
            .filter(|l| l.merchant_id == merchant_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(owned
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_for_merchant(&self, merchant_id: Uuid) -> Result<i64, DatabaseError> {
        Ok(self
            .logs
            .read()
            .await
            .values()
            .filter(|l| l.merchant_id == merchant_id)
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_log(merchant_id: Uuid, event: &str) -> NewWebhookLog {
        NewWebhookLog {
            merchant_id,
            event: event.to_string(),
            payload: json!({"payment": {"id": "pay_1"}}),
        }
    }

    #[tokio::test]
    async fn test_created_log_starts_pending() {
        let store = InMemoryWebhookLogStore::new();
        let log = store
            .create(new_log(Uuid::new_v4(), "payment.success"))
            .await
            .unwrap();

        assert_eq!(log.status, WebhookStatus::Pending);
        assert_eq!(log.attempts, 0);
        assert!(log.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_reset_for_retry_revives_failed_log() {
        let store = InMemoryWebhookLogStore::new();
        let log = store
            .create(new_log(Uuid::new_v4(), "payment.failed"))
            .await
            .unwrap();

        store
            .record_attempt(
                log.id,
                0,
                DeliveryAttempt {
                    status: WebhookStatus::Failed,
                    attempts: 5,
                    attempted_at: Utc::now(),
                    response_code: 500,
                    response_body: "boom".to_string(),
                    next_retry_at: None,
                },
            )
            .await
            .unwrap();

        let now = Utc::now();
        let reset = store.reset_for_retry(log.id, now).await.unwrap().unwrap();
        assert_eq!(reset.status, WebhookStatus::Pending);
        assert_eq!(reset.attempts, 0);
        assert_eq!(reset.next_retry_at, Some(now));
        assert_eq!(reset.response_code, Some(500));
    }

    fn failed_attempt(attempts: i32) -> DeliveryAttempt {
        DeliveryAttempt {
            status: WebhookStatus::Pending,
            attempts,
            attempted_at: Utc::now(),
            response_code: 503,
            response_body: "unavailable".to_string(),
            next_retry_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_attempt_with_stale_count_is_not_applied() {
        let store = InMemoryWebhookLogStore::new();
        let log = store
            .create(new_log(Uuid::new_v4(), "payment.success"))
            .await
            .unwrap();

        let first = store.record_attempt(log.id, 0, failed_attempt(1)).await.unwrap();
        assert_eq!(first.unwrap().attempts, 1);

        // A second writer that also read attempts = 0 loses
        assert!(store
            .record_attempt(log.id, 0, failed_attempt(1))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.find_by_id(log.id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_terminal_log_takes_no_more_attempts() {
        let store = InMemoryWebhookLogStore::new();
        let log = store
            .create(new_log(Uuid::new_v4(), "payment.success"))
            .await
            .unwrap();
        let mut delivered = failed_attempt(1);
        delivered.status = WebhookStatus::Success;
        delivered.next_retry_at = None;
        store.record_attempt(log.id, 0, delivered).await.unwrap();

        assert!(store
            .record_attempt(log.id, 1, failed_attempt(2))
            .await
            .unwrap()
            .is_none());
        let stored = store.find_by_id(log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WebhookStatus::Success);
    }

    #[tokio::test]
    async fn test_reset_refused_while_pending() {
        let store = InMemoryWebhookLogStore::new();
        let log = store.create(new_log(Uuid::new_v4(), "ping")).await.unwrap();

        assert!(store
            .reset_for_retry(log.id, Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_is_scoped_and_paginated() {
        let store = InMemoryWebhookLogStore::new();
        let merchant = Uuid::new_v4();
        for _ in 0..3 {
            store.create(new_log(merchant, "ping")).await.unwrap();
        }
        store
            .create(new_log(Uuid::new_v4(), "ping"))
            .await
            .unwrap();

        assert_eq!(store.count_for_merchant(merchant).await.unwrap(), 3);
        let page = store.list_for_merchant(merchant, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].created_at >= page[1].created_at);
        let rest = store.list_for_merchant(merchant, 10, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
    }
}
