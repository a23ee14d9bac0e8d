use crate::domain::BreakerSnapshot;
use crate::events::ResilienceEvent;
use crate::planes::control::circuit_breaker::CircuitBreaker;
use dashmap::DashMap;
use shared::config::BreakerConfig;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Hands out exactly one breaker per logical operation name.
///
/// Built once at startup and shared by handle; breakers live as long as the
/// registry does.
#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    config: BreakerConfig,
    event_broadcaster: Option<broadcast::Sender<ResilienceEvent>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> shared::Result<Self> {
        config.validate()?;
        Ok(Self {
            breakers: Arc::new(DashMap::new()),
            config,
            event_broadcaster: None,
        })
    }

    pub fn with_event_broadcaster(
        config: BreakerConfig,
        broadcaster: broadcast::Sender<ResilienceEvent>,
    ) -> shared::Result<Self> {
        Ok(Self {
            event_broadcaster: Some(broadcaster),
            ..Self::new(config)?
        })
    }

    pub fn get_or_create(&self, operation: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(operation) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(operation.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::build(
                    operation.to_string(),
                    self.config.clone(),
                    self.event_broadcaster.clone(),
                ))
            });
        Arc::clone(entry.value())
    }

    pub fn get(&self, operation: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(operation)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshots of every breaker, ordered by operation name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.operation.cmp(&b.operation));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("breakers", &self.breakers.len())
            .finish()
    }
}
