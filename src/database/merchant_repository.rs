use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::database::error::DatabaseError;

/// Merchant entity: API credentials plus webhook configuration
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "database", derive(sqlx::FromRow))]
pub struct Merchant {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret: String,
    pub webhook_url: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Merchant {
    /// Configured delivery endpoint; an empty URL counts as unset
    pub fn webhook_endpoint(&self) -> Option<&str> {
        self.webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Signing key; merchants without a secret sign with the empty key
    pub fn signing_secret(&self) -> &str {
        self.webhook_secret.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct NewMerchant {
    pub name: String,
    pub email: String,
    pub api_key: String,
    pub api_secret: String,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

/// Partial update of the webhook settings.
/// `webhook_url: Some("")` clears the endpoint.
#[derive(Debug, Clone, Default)]
pub struct WebhookConfigUpdate {
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

#[async_trait]
pub trait MerchantStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Merchant>, DatabaseError>;

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Merchant>, DatabaseError>;

    /// Insert or refresh credentials of the merchant with the same email
    async fn upsert(&self, merchant: NewMerchant) -> Result<Merchant, DatabaseError>;

    async fn update_webhook_config(
        &self,
        id: Uuid,
        update: WebhookConfigUpdate,
    ) -> Result<Merchant, DatabaseError>;
}

fn normalize_url(url: String) -> Option<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub const TEST_MERCHANT_EMAIL: &str = "test@example.com";
pub const TEST_MERCHANT_API_KEY: &str = "key_test_abc123";
pub const TEST_MERCHANT_API_SECRET: &str = "secret_test_xyz789";
pub const TEST_MERCHANT_WEBHOOK_SECRET: &str = "whsec_test_abc123";

/// Fixed-credential merchant available in test mode
pub fn test_merchant() -> NewMerchant {
    NewMerchant {
        name: "Test Merchant".to_string(),
        email: TEST_MERCHANT_EMAIL.to_string(),
        api_key: TEST_MERCHANT_API_KEY.to_string(),
        api_secret: TEST_MERCHANT_API_SECRET.to_string(),
        webhook_url: None,
        webhook_secret: Some(TEST_MERCHANT_WEBHOOK_SECRET.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[cfg(feature = "database")]
pub use self::postgres::PgMerchantRepository;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::PgPool;

    const COLUMNS: &str = "id, name, email, api_key, api_secret, webhook_url, webhook_secret, \
                           created_at, updated_at";

    /// Repository for merchants
    pub struct PgMerchantRepository {
        pool: PgPool,
    }

    impl PgMerchantRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl MerchantStore for PgMerchantRepository {
        async fn find_by_id(&self, id: Uuid) -> Result<Option<Merchant>, DatabaseError> {
            sqlx::query_as::<_, Merchant>(&format!(
                "SELECT {} FROM merchants WHERE id = $1",
                COLUMNS
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
        }

        async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Merchant>, DatabaseError> {
            sqlx::query_as::<_, Merchant>(&format!(
                "SELECT {} FROM merchants WHERE api_key = $1",
                COLUMNS
            ))
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
        }

        async fn upsert(&self, merchant: NewMerchant) -> Result<Merchant, DatabaseError> {
            sqlx::query_as::<_, Merchant>(&format!(
                "INSERT INTO merchants (id, name, email, api_key, api_secret, webhook_url, webhook_secret)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (email) DO UPDATE
                 SET api_key = EXCLUDED.api_key,
                     api_secret = EXCLUDED.api_secret,
                     webhook_secret = EXCLUDED.webhook_secret,
                     updated_at = NOW()
                 RETURNING {}",
                COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(&merchant.name)
            .bind(&merchant.email)
            .bind(&merchant.api_key)
            .bind(&merchant.api_secret)
            .bind(merchant.webhook_url.and_then(normalize_url))
            .bind(&merchant.webhook_secret)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
        }

        async fn update_webhook_config(
            &self,
            id: Uuid,
            update: WebhookConfigUpdate,
        ) -> Result<Merchant, DatabaseError> {
            let url_provided = update.webhook_url.is_some();
            sqlx::query_as::<_, Merchant>(&format!(
                "UPDATE merchants
                 SET webhook_url = CASE WHEN $2 THEN $3 ELSE webhook_url END,
                     webhook_secret = COALESCE($4, webhook_secret),
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING {}",
                COLUMNS
            ))
            .bind(id)
            .bind(url_provided)
            .bind(update.webhook_url.and_then(normalize_url))
            .bind(update.webhook_secret)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .ok_or_else(|| DatabaseError::not_found("Merchant", id))
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local merchant store for tests and `SKIP_EXTERNALS` mode
#[derive(Default)]
pub struct InMemoryMerchantStore {
    merchants: RwLock<HashMap<Uuid, Merchant>>,
}

impl InMemoryMerchantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MerchantStore for InMemoryMerchantStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Merchant>, DatabaseError> {
        Ok(self.merchants.read().await.get(&id).cloned())
    }

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Merchant>, DatabaseError> {
        Ok(self
            .merchants
            .read()
            .await
            .values()
            .find(|m| m.api_key == api_key)
            .cloned())
    }

    async fn upsert(&self, merchant: NewMerchant) -> Result<Merchant, DatabaseError> {
        let mut merchants = self.merchants.write().await;
        let now = Utc::now();

        if let Some(existing) = merchants.values_mut().find(|m| m.email == merchant.email) {
            existing.api_key = merchant.api_key;
            existing.api_secret = merchant.api_secret;
            existing.webhook_secret = merchant.webhook_secret;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let created = Merchant {
            id: Uuid::new_v4(),
            name: merchant.name,
            email: merchant.email,
            api_key: merchant.api_key,
            api_secret: merchant.api_secret,
            webhook_url: merchant.webhook_url.and_then(normalize_url),
            webhook_secret: merchant.webhook_secret,
            created_at: now,
            updated_at: now,
        };
        merchants.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_webhook_config(
        &self,
        id: Uuid,
        update: WebhookConfigUpdate,
    ) -> Result<Merchant, DatabaseError> {
        let mut merchants = self.merchants.write().await;
        let merchant = merchants
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("Merchant", id))?;

        if let Some(url) = update.webhook_url {
            merchant.webhook_url = normalize_url(url);
        }
        if let Some(secret) = update.webhook_secret {
            merchant.webhook_secret = Some(secret);
        }
        merchant.updated_at = Utc::now();
        Ok(merchant.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_merchant(email: &str) -> NewMerchant {
        NewMerchant {
            name: "Test Merchant".to_string(),
            email: email.to_string(),
            api_key: "key_test_abc123".to_string(),
            api_secret: "secret_test_xyz789".to_string(),
            webhook_url: None,
            webhook_secret: Some("whsec_test_abc123".to_string()),
        }
    }

    #[tokio::test]
    async fn test_upsert_refreshes_existing_merchant() {
        let store = InMemoryMerchantStore::new();
        let first = store.upsert(new_merchant("test@example.com")).await.unwrap();

        let mut again = new_merchant("test@example.com");
        again.api_secret = "rotated".to_string();
        let second = store.upsert(again).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.api_secret, "rotated");
    }

    #[tokio::test]
    async fn test_blank_webhook_url_clears_endpoint() {
        let store = InMemoryMerchantStore::new();
        let merchant = store.upsert(new_merchant("a@example.com")).await.unwrap();

        let updated = store
            .update_webhook_config(
                merchant.id,
                WebhookConfigUpdate {
                    webhook_url: Some("http://localhost:4000/hooks".to_string()),
                    webhook_secret: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.webhook_endpoint(), Some("http://localhost:4000/hooks"));
        assert_eq!(updated.signing_secret(), "whsec_test_abc123");

        let cleared = store
            .update_webhook_config(
                merchant.id,
                WebhookConfigUpdate {
                    webhook_url: Some("   ".to_string()),
                    webhook_secret: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(cleared.webhook_endpoint(), None);
    }
}
