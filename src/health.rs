//! Health check module
//! Reports the state of the record store and the job queue backend

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const SLOW_RESPONSE_MS: u128 = 1000;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[serde(rename = "ok")]
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        !matches!(self.status, HealthState::Unhealthy)
    }

    fn record(&mut self, name: &str, health: ComponentHealth) {
        self.status = match (self.status, health.status) {
            (_, ComponentState::Down) | (HealthState::Unhealthy, _) => HealthState::Unhealthy,
            (_, ComponentState::Warning) | (HealthState::Degraded, _) => HealthState::Degraded,
            _ => HealthState::Healthy,
        };
        self.checks.insert(name.to_string(), health);
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

/// Health checker for the configured backends.
///
/// Backends that are not configured (in-memory mode) are reported as up with
/// an `in-memory` note.
#[derive(Clone, Default)]
pub struct HealthChecker {
    #[cfg(feature = "database")]
    db_pool: Option<sqlx::PgPool>,
    #[cfg(feature = "cache")]
    queue_pool: Option<crate::queue::redis::RedisPool>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "database")]
    pub fn with_database(mut self, pool: sqlx::PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    #[cfg(feature = "cache")]
    pub fn with_queue(mut self, pool: crate::queue::redis::RedisPool) -> Self {
        self.queue_pool = Some(pool);
        self
    }

    /// Perform comprehensive health check
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();

        #[cfg(feature = "database")]
        let database = match &self.db_pool {
            Some(pool) => {
                timed_check("database", async {
                    crate::database::health_check(pool)
                        .await
                        .map_err(|e| e.to_string())
                })
                .await
            }
            None => in_memory(),
        };
        #[cfg(not(feature = "database"))]
        let database = in_memory();
        health_status.record("database", database);

        #[cfg(feature = "cache")]
        let queue = match &self.queue_pool {
            Some(pool) => {
                timed_check("queue", async {
                    crate::queue::redis::health_check(pool)
                        .await
                        .map_err(|e| e.to_string())
                })
                .await
            }
            None => in_memory(),
        };
        #[cfg(not(feature = "cache"))]
        let queue = in_memory();
        health_status.record("queue", queue);

        health_status
    }
}

fn in_memory() -> ComponentHealth {
    ComponentHealth {
        status: ComponentState::Up,
        response_time_ms: None,
        details: Some("in-memory".to_string()),
    }
}

async fn timed_check<F>(component: &str, check: F) -> ComponentHealth
where
    F: Future<Output = Result<(), String>>,
{
    let start = Instant::now();
    match timeout(CHECK_TIMEOUT, check).await {
        Ok(Ok(())) => {
            let elapsed = start.elapsed().as_millis();
            if elapsed > SLOW_RESPONSE_MS {
                warn!(component, elapsed_ms = elapsed as u64, "health check slow");
                ComponentHealth::warning(Some(elapsed), Some("Slow response".to_string()))
            } else {
                info!(component, elapsed_ms = elapsed as u64, "health check OK");
                ComponentHealth::up(Some(elapsed))
            }
        }
        Ok(Err(e)) => {
            error!(component, error = %e, "health check failed");
            ComponentHealth::down(Some(e))
        }
        Err(_) => {
            error!(component, "health check timed out");
            ComponentHealth::down(Some("Timeout".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert!(matches!(up_health.status, ComponentState::Up));
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert!(matches!(down_health.status, ComponentState::Down));
        assert_eq!(down_health.details, Some("Test error".to_string()));

        let warning_health = ComponentHealth::warning(Some(1500), Some("Slow response".to_string()));
        assert!(matches!(warning_health.status, ComponentState::Warning));
        assert_eq!(warning_health.response_time_ms, Some(1500));
    }

    #[test]
    fn test_overall_state_takes_worst_component() {
        let mut status = HealthStatus::new();
        status.record("database", ComponentHealth::up(Some(3)));
        assert_eq!(status.status, HealthState::Healthy);

        status.record("queue", ComponentHealth::warning(Some(1500), None));
        assert_eq!(status.status, HealthState::Degraded);

        status.record("other", ComponentHealth::down(None));
        assert_eq!(status.status, HealthState::Unhealthy);
        assert!(!status.is_healthy());
    }

    #[tokio::test]
    async fn test_in_memory_backends_report_ok() {
        let status = HealthChecker::new().check_health().await;
        assert_eq!(status.status, HealthState::Healthy);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["checks"]["database"]["details"], "in-memory");
        assert_eq!(json["checks"]["queue"]["status"], "up");
    }

    #[tokio::test]
    async fn test_failed_check_is_down() {
        let health = timed_check("database", async { Err("connection refused".to_string()) }).await;
        assert_eq!(health.status, ComponentState::Down);
        assert_eq!(health.details.as_deref(), Some("connection refused"));
    }
}
