use crate::domain::{Lookup, PolicyStats};
use crate::error::ExecuteError;
use crate::events::{publish, RefreshEvent, RefreshFailedEvent, ResilienceEvent};
use crate::planes::control::{BreakerRegistry, CircuitBreaker};
use crate::planes::data::deduplicator::Deduplicator;
use crate::ports::CacheStore;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// The policy a request handler calls: cache, then coalesce, then breaker,
/// then backend, then cache again.
///
/// One policy guards one logical backend operation. Build it once at startup
/// and clone the handle into handlers; clones share all state.
pub struct ExecutionPolicy<T, E> {
    operation: String,
    cache: Arc<dyn CacheStore>,
    breaker: Arc<CircuitBreaker>,
    dedup: Arc<Deduplicator<T, E>>,
    default_ttl: Option<Duration>,
    event_broadcaster: Option<broadcast::Sender<ResilienceEvent>>,
}

impl<T, E> Clone for ExecutionPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            cache: Arc::clone(&self.cache),
            breaker: Arc::clone(&self.breaker),
            dedup: Arc::clone(&self.dedup),
            default_ttl: self.default_ttl,
            event_broadcaster: self.event_broadcaster.clone(),
        }
    }
}

impl<T, E> ExecutionPolicy<T, E>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
{
    pub fn new(
        operation: impl Into<String>,
        cache: Arc<dyn CacheStore>,
        breakers: &BreakerRegistry,
    ) -> Self {
        let operation = operation.into();
        let breaker = breakers.get_or_create(&operation);
        Self {
            operation,
            cache,
            breaker,
            dedup: Arc::new(Deduplicator::new()),
            default_ttl: None,
            event_broadcaster: None,
        }
    }

    /// TTL for values stored by this policy; without it the store's default applies.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn with_event_broadcaster(mut self, broadcaster: broadcast::Sender<ResilienceEvent>) -> Self {
        self.event_broadcaster = Some(broadcaster);
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub async fn execute<F, Fut>(&self, key: &str, factory: F) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute_with_ttl(key, self.default_ttl, factory).await
    }

    pub async fn execute_with_ttl<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (cached, refresh) = match self.cache.get(key).await? {
            Lookup::Hit(bytes) => (Some(bytes), false),
            Lookup::Stale { value, refresh } => (Some(value), refresh),
            Lookup::Miss => (None, false),
        };

        if let Some(bytes) = cached {
            match decode::<T>(&bytes) {
                Ok(value) => {
                    if refresh {
                        self.spawn_refresh(key, ttl, factory);
                    }
                    debug!(operation = %self.operation, key, refresh, "Served from cache");
                    return Ok(value);
                }
                Err(err) => {
                    // Drops the entry along with any refresh claim on it.
                    warn!(operation = %self.operation, key, "Discarding undecodable cache entry: {err}");
                    self.cache.delete(key).await?;
                }
            }
        }

        let request_id = Uuid::new_v4().to_string();
        let run = fetch_and_store(
            Arc::clone(&self.breaker),
            Arc::clone(&self.cache),
            key.to_string(),
            ttl,
            factory,
        );
        self.dedup
            .register_request(key, move || run, &request_id)
            .await
    }

    /// Drop a cached value so the next call goes to the backend.
    pub async fn invalidate(&self, key: &str) -> Result<bool, ExecuteError<E>> {
        Ok(self.cache.delete(key).await?.deleted)
    }

    pub fn stats(&self) -> PolicyStats {
        PolicyStats {
            cache: self.cache.stats(),
            dedup: self.dedup.stats(),
            breaker: self.breaker.snapshot(),
        }
    }

    /// Fire-and-forget refresh along the normal coalesced, breaker-guarded
    /// path. Failure only gives up the refresh claim; the entry stays.
    fn spawn_refresh<F, Fut>(&self, key: &str, ttl: Option<Duration>, factory: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let dedup = Arc::clone(&self.dedup);
        let cache = Arc::clone(&self.cache);
        let broadcaster = self.event_broadcaster.clone();
        let operation = self.operation.clone();
        let key = key.to_string();
        let request_id = format!("refresh-{}", Uuid::new_v4());
        let run = fetch_and_store(
            Arc::clone(&self.breaker),
            Arc::clone(&self.cache),
            key.clone(),
            ttl,
            factory,
        );

        tokio::spawn(async move {
            match dedup.register_request(&key, move || run, &request_id).await {
                Ok(_) => {
                    debug!(operation = %operation, key = %key, "Background refresh stored");
                    publish(
                        broadcaster.as_ref(),
                        ResilienceEvent::RefreshSucceeded(RefreshEvent {
                            key,
                            timestamp: Utc::now(),
                        }),
                    );
                }
                Err(err) => {
                    warn!(operation = %operation, key = %key, "Background refresh failed: {err}");
                    cache.release_refresh(&key).await;
                    publish(
                        broadcaster.as_ref(),
                        ResilienceEvent::RefreshFailed(RefreshFailedEvent {
                            key,
                            reason: err.to_string(),
                            timestamp: Utc::now(),
                        }),
                    );
                }
            }
        });
    }
}

impl<T, E> std::fmt::Debug for ExecutionPolicy<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPolicy")
            .field("operation", &self.operation)
            .field("breaker", &self.breaker)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

/// Backend call through the breaker; stores the value on success. A value
/// that cannot be cached is still returned to the caller.
async fn fetch_and_store<T, E, F, Fut>(
    breaker: Arc<CircuitBreaker>,
    cache: Arc<dyn CacheStore>,
    key: String,
    ttl: Option<Duration>,
    factory: F,
) -> Result<T, ExecuteError<E>>
where
    T: Serialize,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let value = breaker.execute(factory).await?;
    match encode(&value) {
        Ok(bytes) => {
            if let Err(err) = cache.set(&key, bytes, ttl).await {
                warn!(key = %key, "Failed to cache backend result: {err}");
            }
        }
        Err(err) => warn!(key = %key, "Backend result is not cacheable: {err}"),
    }
    Ok(value)
}

fn encode<T: Serialize>(value: &T) -> shared::Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| shared::Error::Codec(err.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &Bytes) -> shared::Result<T> {
    serde_json::from_slice(bytes).map_err(|err| shared::Error::Codec(err.to_string()))
}
