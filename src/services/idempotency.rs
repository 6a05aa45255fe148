//! Replay of stored responses for requests carrying an `Idempotency-Key`

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::error::DatabaseErrorKind;
use crate::database::idempotency_repository::{IdempotencyStore, StoredResponse};
use crate::error::AppResult;

pub const IDEMPOTENCY_TTL_HOURS: i64 = 24;

type KeyLocks = HashMap<(String, Uuid), Arc<tokio::sync::Mutex<()>>>;

pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    /// Serializes requests with the same (key, merchant) inside this process
    in_flight: Mutex<KeyLocks>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self::with_ttl(store, Duration::hours(IDEMPOTENCY_TTL_HOURS))
    }

    pub fn with_ttl(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `operation` at most once per unexpired (key, merchant).
    ///
    /// Without a key the operation always runs. Only 2xx responses are
    /// stored; errors and other statuses leave the key unused.
    pub async fn execute<F, Fut>(
        &self,
        key: Option<&str>,
        merchant_id: Uuid,
        operation: F,
    ) -> AppResult<StoredResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<StoredResponse>>,
    {
        let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) else {
            return operation().await;
        };

        let lock = self.key_lock(key, merchant_id);
        let result = {
            let _held = lock.lock().await;
            self.execute_locked(key, merchant_id, operation).await
        };
        drop(lock);
        self.release_key(key, merchant_id);

        result
    }

    async fn execute_locked<F, Fut>(
        &self,
        key: &str,
        merchant_id: Uuid,
        operation: F,
    ) -> AppResult<StoredResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<StoredResponse>>,
    {
        if let Some(record) = self.store.find(key, merchant_id).await? {
            if !record.is_expired(Utc::now()) {
                info!(merchant_id = %merchant_id, idempotency_key = %key, "replaying stored response");
                return Ok(record.response);
            }
            self.store.delete(key, merchant_id).await?;
        }

        let response = operation().await?;

        if (200..300).contains(&response.status_code) {
            let expires_at = Utc::now() + self.ttl;
            if let Err(e) = self
                .store
                .insert(key, merchant_id, &response, expires_at)
                .await
            {
                match e.kind {
                    // Another instance stored first; our response still stands
                    DatabaseErrorKind::UniqueViolation { .. } => {
                        warn!(merchant_id = %merchant_id, idempotency_key = %key, "idempotency key stored concurrently")
                    }
                    _ => return Err(e.into()),
                }
            }
        }

        Ok(response)
    }

    fn key_lock(&self, key: &str, merchant_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry((key.to_string(), merchant_id))
            .or_default()
            .clone()
    }

    fn release_key(&self, key: &str, merchant_id: Uuid) {
        let mut locks = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        let id = (key.to_string(), merchant_id);
        if locks
            .get(&id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&id);
        }
    }
}
