//! Resilient request execution in front of a slow or flaky backend.
//!
//! The control plane tracks backend health (circuit breakers); the data plane
//! serves requests (deduplication and the execution policy). Cache storage
//! plugs in through [`ports::CacheStore`].

pub mod domain;
pub mod error;
pub mod events;
pub mod planes;
pub mod ports;

pub use error::ExecuteError;
pub use planes::control::{BreakerRegistry, CircuitBreaker};
pub use planes::data::{generate_request_key, Deduplicator, ExecutionPolicy, RequestKeyParams};
