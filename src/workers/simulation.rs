//! Simulated processor: latency windows and weighted payment outcomes

use rand::Rng;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use crate::config::WorkerConfig;
use crate::database::payment_repository::PaymentMethod;

const PAYMENT_LATENCY_MS: Range<u64> = 5_000..10_000;
const REFUND_LATENCY_MS: Range<u64> = 3_000..5_000;

const UPI_SUCCESS_RATE: f64 = 0.90;
const DEFAULT_SUCCESS_RATE: f64 = 0.95;

/// Decides how long processing takes and whether a payment goes through
pub trait OutcomePolicy: Send + Sync {
    fn payment_latency(&self) -> Duration;

    fn refund_latency(&self) -> Duration;

    fn payment_succeeds(&self, method: PaymentMethod) -> bool;
}

pub fn success_rate(method: PaymentMethod) -> f64 {
    match method {
        PaymentMethod::Upi => UPI_SUCCESS_RATE,
        _ => DEFAULT_SUCCESS_RATE,
    }
}

/// Random multi-second latency and method-weighted success draws
#[derive(Debug, Clone, Default)]
pub struct WeightedOutcome;

impl OutcomePolicy for WeightedOutcome {
    fn payment_latency(&self) -> Duration {
        Duration::from_millis(rand::rng().random_range(PAYMENT_LATENCY_MS))
    }

    fn refund_latency(&self) -> Duration {
        Duration::from_millis(rand::rng().random_range(REFUND_LATENCY_MS))
    }

    fn payment_succeeds(&self, method: PaymentMethod) -> bool {
        rand::rng().random_bool(success_rate(method))
    }
}

/// Constant latency and a constant outcome; test mode uses the succeeding variant
#[derive(Debug, Clone)]
pub struct FixedOutcome {
    pub latency: Duration,
    pub succeed: bool,
}

impl FixedOutcome {
    pub fn always_succeed(latency: Duration) -> Self {
        Self {
            latency,
            succeed: true,
        }
    }

    pub fn always_fail(latency: Duration) -> Self {
        Self {
            latency,
            succeed: false,
        }
    }
}

impl OutcomePolicy for FixedOutcome {
    fn payment_latency(&self) -> Duration {
        self.latency
    }

    fn refund_latency(&self) -> Duration {
        self.latency
    }

    fn payment_succeeds(&self, _method: PaymentMethod) -> bool {
        self.succeed
    }
}

pub fn policy_from_config(config: &WorkerConfig) -> Arc<dyn OutcomePolicy> {
    if config.test_mode {
        Arc::new(FixedOutcome::always_succeed(config.test_processing_delay))
    } else {
        Arc::new(WeightedOutcome)
    }
}
