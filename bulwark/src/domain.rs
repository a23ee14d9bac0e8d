use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod response {
    #[derive(Clone, Debug)]
    pub struct PutResponse {
        pub created: bool,
        pub evicted: usize,
        pub compressed: bool,
    }

    impl PutResponse {
        pub fn new(created: bool, evicted: usize, compressed: bool) -> Self {
            Self {
                created,
                evicted,
                compressed,
            }
        }
    }

    #[derive(Clone, Debug)]
    pub struct DeleteResponse {
        pub deleted: bool,
    }

    impl DeleteResponse {
        pub fn new(deleted: bool) -> Self {
            Self { deleted }
        }
    }
}

/// Outcome of a cache read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Hit(Bytes),
    /// Still valid but inside the refresh window. `refresh` is true only for
    /// the reader that claimed the background refresh.
    Stale { value: Bytes, refresh: bool },
    Miss,
}

impl Lookup {
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            Lookup::Hit(value) | Lookup::Stale { value, .. } => Some(value),
            Lookup::Miss => None,
        }
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Lookup::Miss)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub entries: usize,
    pub compressed_entries: usize,
    pub stored_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a breaker, for dashboards and logs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub operation: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count_in_half_open: u32,
    pub probe_in_flight: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Time left before an open breaker admits a probe.
    pub retry_after: Option<Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub executions: u64,
    pub coalesced: u64,
    pub in_flight: usize,
}

/// Combined view over one execution policy's collaborators.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyStats {
    pub cache: CacheStats,
    pub dedup: DedupStats,
    pub breaker: BreakerSnapshot,
}
