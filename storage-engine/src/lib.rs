//! Storage adapters for the bulwark `CacheStore` port.

pub mod compression;
pub mod ttl_cache;

pub use ttl_cache::{CacheEntry, TtlCache};
