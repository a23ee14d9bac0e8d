#![deny(clippy::all)]

use crate::domain::response::{DeleteResponse, PutResponse};
use crate::domain::{CacheStats, Lookup};
use async_trait::async_trait;
use bytes::Bytes;
use shared::Result;
use std::time::Duration;

// Ports are the pluggable extension points for underlying cache implementations

/// Port for the byte-level cache sitting in front of the backend.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Lookup>;

    /// Store `value` under `key`. `None` uses the store's default TTL.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<PutResponse>;

    async fn delete(&self, key: &str) -> Result<DeleteResponse>;

    /// Give up a refresh claim handed out by `get` without touching the entry.
    async fn release_refresh(&self, key: &str);

    fn stats(&self) -> CacheStats;
}
