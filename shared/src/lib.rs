// shared/src/lib.rs

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("codec: {0}")]
    Codec(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Time-to-live in milliseconds as it arrives from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtlMs(pub u64);

impl TtlMs {
    /// Negative values clamp to zero, which means "expire immediately".
    pub fn from_signed(ms: i64) -> Self {
        TtlMs(ms.max(0) as u64)
    }

    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.0)
    }
}

impl From<TtlMs> for std::time::Duration {
    fn from(ttl: TtlMs) -> Self {
        ttl.as_duration()
    }
}

pub mod config;
