//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub logging: LoggingConfig,
    /// Run against in-memory stores and queues instead of Postgres/Redis
    pub skip_externals: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Job queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub max_connections: u32,
    /// Delivery attempts a job gets before it is recorded as failed
    pub max_attempts: u32,
    /// How long a leased job stays invisible to other workers
    pub visibility_timeout: u64, // seconds
}

/// Background worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub payment_concurrency: usize,
    pub refund_concurrency: usize,
    pub webhook_concurrency: usize,
    /// Deterministic outcomes and short fixed latency
    pub test_mode: bool,
    pub test_processing_delay: Duration,
    /// Second-scale webhook backoff table
    pub accelerated_retries: bool,
    pub webhook_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let skip_externals = parse_bool("SKIP_EXTERNALS", false)?;

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env(skip_externals)?,
            queue: QueueConfig::from_env()?,
            workers: WorkerConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            skip_externals,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if !self.skip_externals {
            self.database.validate()?;
            self.queue.validate()?;
        }
        self.workers.validate()?;
        self.logging.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env(skip_externals: bool) -> Result<Self, ConfigError> {
        let url = match env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) if skip_externals => String::new(),
            Err(_) => return Err(ConfigError::MissingVariable("DATABASE_URL".to_string())),
        };

        Ok(DatabaseConfig {
            url,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(QueueConfig {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            key_prefix: env::var("QUEUE_KEY_PREFIX").unwrap_or_else(|_| "paygate".to_string()),
            max_connections: env::var("QUEUE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("QUEUE_MAX_CONNECTIONS".to_string()))?,
            max_attempts: env::var("JOB_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("JOB_MAX_ATTEMPTS".to_string()))?,
            visibility_timeout: env::var("JOB_VISIBILITY_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| {
                    ConfigError::InvalidValue("JOB_VISIBILITY_TIMEOUT_SECONDS".to_string())
                })?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::InvalidValue("REDIS_URL".to_string()));
        }

        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue("JOB_MAX_ATTEMPTS".to_string()));
        }

        // Must outlast the slowest simulated payment plus a webhook timeout
        if self.visibility_timeout < 15 {
            return Err(ConfigError::ValidationFailed(
                "JOB_VISIBILITY_TIMEOUT_SECONDS must be at least 15".to_string(),
            ));
        }

        Ok(())
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(WorkerConfig {
            poll_interval: Duration::from_millis(parse_u64("WORKER_POLL_INTERVAL_MS", 250)?),
            payment_concurrency: parse_u64("PAYMENT_WORKER_CONCURRENCY", 4)? as usize,
            refund_concurrency: parse_u64("REFUND_WORKER_CONCURRENCY", 2)? as usize,
            webhook_concurrency: parse_u64("WEBHOOK_WORKER_CONCURRENCY", 4)? as usize,
            test_mode: parse_bool("TEST_MODE", false)?,
            test_processing_delay: Duration::from_millis(parse_u64(
                "TEST_PROCESSING_DELAY_MS",
                1000,
            )?),
            accelerated_retries: parse_bool("WEBHOOK_RETRY_INTERVALS_TEST", false)?,
            webhook_timeout: Duration::from_secs(parse_u64("WEBHOOK_TIMEOUT_SECONDS", 5)?),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.payment_concurrency == 0
            || self.refund_concurrency == 0
            || self.webhook_concurrency == 0
        {
            return Err(ConfigError::ValidationFailed(
                "worker concurrency must be at least 1".to_string(),
            ));
        }

        if self.webhook_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "WEBHOOK_TIMEOUT_SECONDS".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            payment_concurrency: 4,
            refund_concurrency: 2,
            webhook_concurrency: 4,
            test_mode: false,
            test_processing_delay: Duration::from_millis(1000),
            accelerated_retries: false,
            webhook_timeout: Duration::from_secs(5),
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .to_lowercase()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

fn parse_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_config() -> QueueConfig {
        QueueConfig {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "paygate".to_string(),
            max_connections: 10,
            max_attempts: 1,
            visibility_timeout: 60,
        }
    }

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_config_rejects_non_redis_url() {
        let mut config = queue_config();
        assert!(config.validate().is_ok());

        config.redis_url = "http://localhost:6379".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_config_rejects_short_visibility_timeout() {
        let mut config = queue_config();
        config.visibility_timeout = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_worker_config_requires_concurrency() {
        let config = WorkerConfig {
            webhook_concurrency: 0,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_log_level_validation() {
        let config = LoggingConfig {
            level: "verbose".to_string(),
            format: LogFormat::Plain,
        };
        assert!(config.validate().is_err());
    }
}
