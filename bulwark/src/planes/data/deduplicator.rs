use crate::domain::DedupStats;
use crate::error::ExecuteError;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

type SharedOutcome<T, E> = Shared<BoxFuture<'static, Result<T, ExecuteError<E>>>>;

/// One running execution and everybody waiting on it.
struct InFlightRequest<T, E> {
    outcome: SharedOutcome<T, E>,
    subscriber_count: usize,
    started_at: Instant,
    leader_request_id: String,
    generation: u64,
}

/// Coalesces concurrent callers that share a key into a single execution.
///
/// The execution runs on its own task, so it finishes (and publishes) even if
/// the caller that started it goes away. The task removes its registry entry
/// before publishing; a caller arriving afterwards starts fresh.
pub struct Deduplicator<T, E> {
    in_flight: Arc<Mutex<HashMap<String, InFlightRequest<T, E>>>>,
    generation: AtomicU64,
    executions: AtomicU64,
    coalesced: AtomicU64,
}

impl<T, E> Deduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Join the execution already running for `key`, or start one with
    /// `factory`. All subscribers get clones of the same outcome.
    pub async fn register_request<F, Fut>(
        &self,
        key: &str,
        factory: F,
        request_id: &str,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ExecuteError<E>>> + Send + 'static,
    {
        let (outcome, pending) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get_mut(key) {
                Some(existing) => {
                    existing.subscriber_count += 1;
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        key,
                        request_id,
                        leader = %existing.leader_request_id,
                        subscribers = existing.subscriber_count,
                        waited_ms = existing.started_at.elapsed().as_millis() as u64,
                        "Coalesced onto in-flight request"
                    );
                    (existing.outcome.clone(), None)
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let (publisher, subscriber) = oneshot::channel();
                    let outcome = subscriber
                        .map(|published| {
                            published.unwrap_or_else(|_| {
                                Err(ExecuteError::Aborted(
                                    "execution ended without publishing a result".into(),
                                ))
                            })
                        })
                        .boxed()
                        .shared();
                    in_flight.insert(
                        key.to_string(),
                        InFlightRequest {
                            outcome: outcome.clone(),
                            subscriber_count: 1,
                            started_at: Instant::now(),
                            leader_request_id: request_id.to_string(),
                            generation,
                        },
                    );
                    self.executions.fetch_add(1, Ordering::Relaxed);
                    debug!(key, request_id, "Started new execution");
                    (outcome, Some((generation, publisher)))
                }
            }
        };

        // Spawned outside the lock: a task dropped on the spot (runtime
        // shutting down) settles its entry, which needs the lock.
        if let Some((generation, publisher)) = pending {
            let settle = SettleGuard {
                registry: Arc::clone(&self.in_flight),
                key: key.to_string(),
                generation,
            };
            tokio::spawn(async move {
                // Locals drop in reverse order: on a panic the entry is
                // removed before subscribers see the closed channel.
                let publisher = publisher;
                let settle = settle;
                let result = factory().await;
                // Unregister first so nobody new can join a settled execution.
                drop(settle);
                let _ = publisher.send(result);
            });
        }

        outcome.await
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            executions: self.executions.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

/// Removes the registry entry when the execution finishes. Also runs if the
/// task panics or is dropped, so a dead execution is never joined later.
struct SettleGuard<T, E> {
    registry: Arc<Mutex<HashMap<String, InFlightRequest<T, E>>>>,
    key: String,
    generation: u64,
}

impl<T, E> Drop for SettleGuard<T, E> {
    fn drop(&mut self) {
        let mut in_flight = self.registry.lock();
        let ours = in_flight
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation);
        if !ours {
            return;
        }
        if let Some(settled) = in_flight.remove(&self.key) {
            debug!(
                key = %self.key,
                subscribers = settled.subscriber_count,
                elapsed_ms = settled.started_at.elapsed().as_millis() as u64,
                "Execution settled"
            );
        }
    }
}

impl<T, E> Default for Deduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> std::fmt::Debug for Deduplicator<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}
