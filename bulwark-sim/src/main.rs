mod backend;

use backend::{OrderRisk, RiskBackend};
use bulwark::events::ResilienceEvent;
use bulwark::{
    generate_request_key, BreakerRegistry, ExecuteError, ExecutionPolicy, RequestKeyParams,
};
use shared::config::Config;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage_engine::TtlCache;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const OPERATION: &str = "order-data";

/// Shape of the simulated traffic.
#[derive(Debug)]
struct Workload {
    total_requests: u64,
    concurrency: u64,
    distinct_orders: u64,
    failure_rate: f64,
    latency: Duration,
}

impl Workload {
    fn from_env() -> Self {
        Self {
            total_requests: env_or("BULWARK_SIM_REQUESTS", 5_000),
            concurrency: env_or::<u64>("BULWARK_SIM_CONCURRENCY", 50).max(1),
            distinct_orders: env_or::<u64>("BULWARK_SIM_DISTINCT_ORDERS", 200).max(1),
            failure_rate: env_or("BULWARK_SIM_FAILURE_RATE", 0.05),
            latency: Duration::from_millis(env_or("BULWARK_SIM_LATENCY_MS", 40)),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable {name}={raw}");
            default
        }),
        Err(_) => default,
    }
}

#[derive(Debug, Default)]
struct Counters {
    served: AtomicU64,
    fast_failures: AtomicU64,
    timeouts: AtomicU64,
    backend_errors: AtomicU64,
    other_errors: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &Result<OrderRisk, ExecuteError<backend::BackendError>>) {
        let counter = match outcome {
            Ok(_) => &self.served,
            Err(ExecuteError::CircuitOpen { .. }) => &self.fast_failures,
            Err(ExecuteError::Timeout { .. }) => &self.timeouts,
            Err(ExecuteError::Backend(_)) => &self.backend_errors,
            Err(_) => &self.other_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct SimulationStats {
    total_requests: u64,
    served: u64,
    fast_failures: u64,
    timeouts: u64,
    backend_errors: u64,
    other_errors: u64,
    backend_calls: u64,
    duration_ms: u64,
}

impl SimulationStats {
    fn print_summary(&self) {
        let pct = |n: u64| (n as f64 / self.total_requests.max(1) as f64) * 100.0;

        println!("\n=== Simulation Results ===");
        println!("Duration:          {} ms ({:.2} seconds)", self.duration_ms, self.duration_ms as f64 / 1000.0);
        println!("Requests:          {}", self.total_requests);
        println!("Served:            {} ({:.2}%)", self.served, pct(self.served));
        println!("Circuit open:      {} ({:.2}%)", self.fast_failures, pct(self.fast_failures));
        println!("Timed out:         {} ({:.2}%)", self.timeouts, pct(self.timeouts));
        println!("Backend errors:    {} ({:.2}%)", self.backend_errors, pct(self.backend_errors));
        println!("Other errors:      {}", self.other_errors);
        println!("Backend calls:     {} ({:.2}% of requests)", self.backend_calls, pct(self.backend_calls));
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Bulwark simulation");

    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let config = Config::from_env()?;
    let workload = Workload::from_env();
    info!(?config, ?workload, "Configuration loaded");

    // Everything below is built exactly once and shared by handle.
    let (event_tx, event_rx) = broadcast::channel(256);
    let cache = Arc::new(TtlCache::new(OPERATION, config.cache.clone())?);
    let breakers = BreakerRegistry::with_event_broadcaster(config.breaker.clone(), event_tx.clone())?;
    let policy: ExecutionPolicy<OrderRisk, backend::BackendError> =
        ExecutionPolicy::new(OPERATION, cache, &breakers).with_event_broadcaster(event_tx);
    let backend = Arc::new(RiskBackend::new(workload.failure_rate, workload.latency));
    let counters = Arc::new(Counters::default());

    let mut events = tokio::spawn(log_events(event_rx));

    let start = Instant::now();
    tokio::select! {
        _ = run_workload(&workload, &policy, &backend, &counters) => info!("Workload completed"),
        _ = shutdown_signal() => info!("Shutdown signal received, stopping workload"),
    }
    let duration = start.elapsed();

    let stats = SimulationStats {
        total_requests: counters.served.load(Ordering::Relaxed)
            + counters.fast_failures.load(Ordering::Relaxed)
            + counters.timeouts.load(Ordering::Relaxed)
            + counters.backend_errors.load(Ordering::Relaxed)
            + counters.other_errors.load(Ordering::Relaxed),
        served: counters.served.load(Ordering::Relaxed),
        fast_failures: counters.fast_failures.load(Ordering::Relaxed),
        timeouts: counters.timeouts.load(Ordering::Relaxed),
        backend_errors: counters.backend_errors.load(Ordering::Relaxed),
        other_errors: counters.other_errors.load(Ordering::Relaxed),
        backend_calls: backend.calls(),
        duration_ms: duration.as_millis() as u64,
    };
    stats.print_summary();

    let policy_stats = policy.stats();
    println!("Cache:             {:?}", policy_stats.cache);
    println!("Dedup:             {:?}", policy_stats.dedup);
    for snapshot in breakers.snapshots() {
        println!("Breaker:           {snapshot:?}");
    }

    // Dropping the last senders ends the event logger; refresh tasks still
    // holding one get a grace period.
    drop(policy);
    drop(breakers);
    if tokio::time::timeout(Duration::from_secs(2), &mut events).await.is_err() {
        events.abort();
    }

    info!("Bulwark simulation finished");
    Ok(())
}

async fn run_workload(
    workload: &Workload,
    policy: &ExecutionPolicy<OrderRisk, backend::BackendError>,
    backend: &Arc<RiskBackend>,
    counters: &Arc<Counters>,
) {
    let requests_per_worker = workload.total_requests / workload.concurrency;
    let mut tasks = JoinSet::new();

    for worker_id in 0..workload.concurrency {
        let policy = policy.clone();
        let backend = Arc::clone(backend);
        let counters = Arc::clone(counters);
        let distinct_orders = workload.distinct_orders;

        tasks.spawn(async move {
            for i in 0..requests_per_worker {
                // Workers walk the same small order set so keys overlap.
                let order_number = (worker_id + i * 7) % distinct_orders;
                let params = RequestKeyParams {
                    checkout_token: Some(format!("ct-{order_number:05}")),
                    order_name: Some(format!("#{}", 1000 + order_number)),
                    ..Default::default()
                };
                let key = generate_request_key(&params);
                let backend = Arc::clone(&backend);

                let outcome = policy
                    .execute(&key, move || async move { backend.assess(params).await })
                    .await;
                counters.record(&outcome);
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!("Worker task failed: {err}");
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<ResilienceEvent>) {
    loop {
        match events.recv().await {
            Ok(ResilienceEvent::BreakerTransition(t)) => {
                info!(operation = %t.operation, from = %t.from, to = %t.to, "Breaker transition");
            }
            Ok(ResilienceEvent::RefreshSucceeded(r)) => {
                info!(key = %r.key, "Background refresh succeeded");
            }
            Ok(ResilienceEvent::RefreshFailed(r)) => {
                warn!(key = %r.key, reason = %r.reason, "Background refresh failed");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event logger lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// Graceful shutdown handler
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to install terminate handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
