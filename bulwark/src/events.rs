use crate::domain::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResilienceEvent {
    BreakerTransition(BreakerTransitionEvent),
    RefreshSucceeded(RefreshEvent),
    RefreshFailed(RefreshFailedEvent),
}

impl ResilienceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ResilienceEvent::BreakerTransition(_) => "breaker_transition",
            ResilienceEvent::RefreshSucceeded(_) => "refresh_succeeded",
            ResilienceEvent::RefreshFailed(_) => "refresh_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerTransitionEvent {
    pub operation: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshEvent {
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshFailedEvent {
    pub key: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Publish on an optional channel. A channel without receivers is not an error.
pub(crate) fn publish(broadcaster: Option<&broadcast::Sender<ResilienceEvent>>, event: ResilienceEvent) {
    let Some(broadcaster) = broadcaster else {
        return;
    };
    let kind = event.kind();
    match broadcaster.send(event) {
        Ok(subscriber_count) => {
            tracing::debug!("Broadcasted {kind} event to {subscriber_count} subscriber(s)");
        }
        Err(_) => {
            tracing::debug!("No subscribers for {kind} event");
        }
    }
}
