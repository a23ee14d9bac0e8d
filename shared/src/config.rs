use crate::{Error, Result, TtlMs};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Settings for the in-memory TTL cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub max_size: usize,
    /// Fraction of the TTL, counted back from expiry, during which a read
    /// schedules a background refresh. Must lie in (0, 1).
    pub background_refresh_threshold: f64,
    pub compression_enabled: bool,
    pub compression_threshold_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_millis(Config::DEFAULT_TTL_MS as u64),
            max_size: Config::DEFAULT_MAX_SIZE,
            background_refresh_threshold: Config::DEFAULT_REFRESH_THRESHOLD,
            compression_enabled: true,
            compression_threshold_bytes: Config::DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        let t = self.background_refresh_threshold;
        if !(t > 0.0 && t < 1.0) {
            return Err(Error::Config(format!(
                "background refresh threshold must be in (0, 1), got {t}"
            )));
        }
        if self.max_size == 0 {
            return Err(Error::Config("cache max size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Settings shared by every circuit breaker.
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Successful half-open probes needed before the breaker closes again.
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: Config::DEFAULT_FAILURE_THRESHOLD,
            success_threshold: Config::DEFAULT_SUCCESS_THRESHOLD,
            recovery_timeout: Duration::from_millis(Config::DEFAULT_RECOVERY_TIMEOUT_MS as u64),
            request_timeout: Duration::from_millis(Config::DEFAULT_REQUEST_TIMEOUT_MS as u64),
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::Config("failure threshold must be at least 1".into()));
        }
        if self.success_threshold == 0 {
            return Err(Error::Config("success threshold must be at least 1".into()));
        }
        Ok(())
    }
}

/// Process-wide configuration, read once at startup and immutable afterwards.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
}

impl Config {
    const DEFAULT_TTL_MS: i64 = 300_000;
    const DEFAULT_MAX_SIZE: usize = 1000;
    const DEFAULT_REFRESH_THRESHOLD: f64 = 0.2;
    const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;
    const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
    const DEFAULT_RECOVERY_TIMEOUT_MS: i64 = 30_000;
    const DEFAULT_REQUEST_TIMEOUT_MS: i64 = 10_000;

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache = CacheConfig {
            default_ttl: millis(&lookup, "BULWARK_DEFAULT_TTL_MS", Self::DEFAULT_TTL_MS),
            max_size: parse_or(&lookup, "BULWARK_CACHE_MAX_SIZE", Self::DEFAULT_MAX_SIZE),
            background_refresh_threshold: parse_or(
                &lookup,
                "BULWARK_REFRESH_THRESHOLD",
                Self::DEFAULT_REFRESH_THRESHOLD,
            ),
            compression_enabled: parse_or(&lookup, "BULWARK_COMPRESSION_ENABLED", true),
            compression_threshold_bytes: parse_or(
                &lookup,
                "BULWARK_COMPRESSION_THRESHOLD_BYTES",
                Self::DEFAULT_COMPRESSION_THRESHOLD,
            ),
        };
        let breaker = BreakerConfig {
            failure_threshold: parse_or(
                &lookup,
                "BULWARK_FAILURE_THRESHOLD",
                Self::DEFAULT_FAILURE_THRESHOLD,
            ),
            success_threshold: parse_or(
                &lookup,
                "BULWARK_SUCCESS_THRESHOLD",
                Self::DEFAULT_SUCCESS_THRESHOLD,
            ),
            recovery_timeout: millis(
                &lookup,
                "BULWARK_RECOVERY_TIMEOUT_MS",
                Self::DEFAULT_RECOVERY_TIMEOUT_MS,
            ),
            request_timeout: millis(
                &lookup,
                "BULWARK_REQUEST_TIMEOUT_MS",
                Self::DEFAULT_REQUEST_TIMEOUT_MS,
            ),
        };

        cache.validate()?;
        breaker.validate()?;
        Ok(Self { cache, breaker })
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("{name}={raw:?} could not be parsed, using the default");
            default
        }),
        None => default,
    }
}

fn millis<F>(lookup: &F, name: &str, default: i64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    TtlMs::from_signed(parse_or(lookup, name, default)).as_duration()
}
