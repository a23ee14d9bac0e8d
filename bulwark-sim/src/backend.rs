use bulwark::RequestKeyParams;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Accept,
    Investigate,
    Cancel,
}

/// What the risk service answers for one order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderRisk {
    pub order: RequestKeyParams,
    pub score: u8,
    pub recommendation: Recommendation,
    pub assessed_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("risk service unavailable")]
    Unavailable,
}

/// Stand-in for a slow, occasionally failing order-risk service.
#[derive(Debug)]
pub struct RiskBackend {
    failure_rate: f64,
    latency: Duration,
    calls: AtomicU64,
}

impl RiskBackend {
    pub fn new(failure_rate: f64, latency: Duration) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            latency,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn assess(&self, order: RequestKeyParams) -> Result<OrderRisk, BackendError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        // ThreadRng is not Send; draw everything before the first await.
        let (fail, delay, score) = {
            let mut rng = rand::rng();
            let jitter = rng.random_range(0.5..1.5);
            (
                rng.random_bool(self.failure_rate),
                self.latency.mul_f64(jitter),
                rng.random_range(0..=100u8),
            )
        };
        tokio::time::sleep(delay).await;

        if fail {
            return Err(BackendError::Unavailable);
        }
        let recommendation = match score {
            0..=59 => Recommendation::Accept,
            60..=84 => Recommendation::Investigate,
            _ => Recommendation::Cancel,
        };
        Ok(OrderRisk {
            order,
            score,
            recommendation,
            assessed_at: Utc::now(),
        })
    }
}
