//! Record stores for merchants, payments, refunds, webhook logs and
//! idempotency keys. Each store is an async trait with a Postgres
//! implementation (feature `database`) and an in-memory one.

pub mod error;
pub mod idempotency_repository;
pub mod merchant_repository;
pub mod payment_repository;
pub mod refund_repository;
pub mod webhook_log_repository;

use std::sync::Arc;

use self::idempotency_repository::{IdempotencyStore, InMemoryIdempotencyStore};
use self::merchant_repository::{InMemoryMerchantStore, MerchantStore};
use self::payment_repository::{InMemoryPaymentStore, PaymentStore};
use self::refund_repository::{InMemoryRefundStore, RefundStore};
use self::webhook_log_repository::{InMemoryWebhookLogStore, WebhookLogStore};

/// All record stores, built once at start-up and shared by the API layer
/// and the workers.
#[derive(Clone)]
pub struct Stores {
    pub merchants: Arc<dyn MerchantStore>,
    pub payments: Arc<dyn PaymentStore>,
    pub refunds: Arc<dyn RefundStore>,
    pub webhook_logs: Arc<dyn WebhookLogStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            merchants: Arc::new(InMemoryMerchantStore::new()),
            payments: Arc::new(InMemoryPaymentStore::new()),
            refunds: Arc::new(InMemoryRefundStore::new()),
            webhook_logs: Arc::new(InMemoryWebhookLogStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        }
    }

    #[cfg(feature = "database")]
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        use self::idempotency_repository::PgIdempotencyRepository;
        use self::merchant_repository::PgMerchantRepository;
        use self::payment_repository::PgPaymentRepository;
        use self::refund_repository::PgRefundRepository;
        use self::webhook_log_repository::PgWebhookLogRepository;

        Self {
            merchants: Arc::new(PgMerchantRepository::new(pool.clone())),
            payments: Arc::new(PgPaymentRepository::new(pool.clone())),
            refunds: Arc::new(PgRefundRepository::new(pool.clone())),
            webhook_logs: Arc::new(PgWebhookLogRepository::new(pool.clone())),
            idempotency: Arc::new(PgIdempotencyRepository::new(pool)),
        }
    }
}

#[cfg(feature = "database")]
pub use self::pool::*;

#[cfg(feature = "database")]
mod pool {
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use std::time::Duration;
    use tracing::{error as log_error, info, warn};

    use super::error::{DatabaseError, DatabaseErrorKind};
    use crate::config::DatabaseConfig;

    /// Database pool configuration
    #[derive(Debug, Clone)]
    pub struct PoolConfig {
        pub max_connections: u32,
        pub min_connections: u32,
        pub connection_timeout: Duration,
        pub idle_timeout: Duration,
        pub max_lifetime: Duration,
    }

    impl Default for PoolConfig {
        fn default() -> Self {
            Self {
                max_connections: 20,
                min_connections: 5,
                connection_timeout: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(600),
                max_lifetime: Duration::from_secs(1800),
            }
        }
    }

    impl From<&DatabaseConfig> for PoolConfig {
        fn from(config: &DatabaseConfig) -> Self {
            Self {
                max_connections: config.max_connections,
                min_connections: config.min_connections,
                connection_timeout: Duration::from_secs(config.connection_timeout),
                idle_timeout: Duration::from_secs(config.idle_timeout.unwrap_or(600)),
                ..Self::default()
            }
        }
    }

    /// Initialize the database connection pool
    pub async fn init_pool(
        database_url: &str,
        config: Option<PoolConfig>,
    ) -> Result<PgPool, DatabaseError> {
        let config = config.unwrap_or_default();

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connection_timeout = ?config.connection_timeout,
            "initializing database pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connection_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| {
                log_error!(error = %e, "failed to initialize database pool");
                DatabaseError::from_sqlx(e)
            })?;

        info!("database pool initialized");
        Ok(pool)
    }

    /// Initialize the pool from application configuration and apply migrations
    pub async fn init_pool_from_config(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
        let pool = init_pool(&config.url, Some(PoolConfig::from(config))).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                log_error!(error = %e, "database migration failed");
                DatabaseError::new(DatabaseErrorKind::Unknown {
                    message: e.to_string(),
                })
            })?;

        info!("database migrations applied");
        Ok(pool)
    }

    /// Connection pool health check
    pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
        sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| {
            warn!(error = %e, "database health check failed");
            DatabaseError::from_sqlx(e)
        })?;

        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_default_pool_config() {
            let config = PoolConfig::default();
            assert_eq!(config.max_connections, 20);
            assert_eq!(config.min_connections, 5);
            assert_eq!(config.connection_timeout, Duration::from_secs(30));
        }

        #[test]
        fn test_pool_config_from_app_config() {
            let config = DatabaseConfig {
                url: "postgres://localhost/paygate".to_string(),
                max_connections: 8,
                min_connections: 2,
                connection_timeout: 10,
                idle_timeout: None,
            };
            let pool = PoolConfig::from(&config);
            assert_eq!(pool.max_connections, 8);
            assert_eq!(pool.connection_timeout, Duration::from_secs(10));
            assert_eq!(pool.idle_timeout, Duration::from_secs(600));
        }
    }
}
