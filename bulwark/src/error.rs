use std::sync::Arc;
use std::time::Duration;

/// Everything `ExecutionPolicy::execute` can hand back to a caller.
///
/// The backend error sits behind an `Arc` so that one outcome can be cloned
/// out to every deduplicated subscriber unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E> {
    /// The backend call itself failed.
    #[error("backend call failed: {0}")]
    Backend(Arc<E>),

    /// The breaker is open, or a half-open probe is already running.
    #[error("circuit breaker for {operation} is open, retry after {retry_after:?}")]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },

    /// The backend did not answer within the request timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// The execution task panicked or was cancelled by the runtime.
    #[error("execution aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Storage(#[from] shared::Error),
}

impl<E> ExecuteError<E> {
    pub fn backend(err: E) -> Self {
        ExecuteError::Backend(Arc::new(err))
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ExecuteError::CircuitOpen { .. })
    }

    /// Backoff hint for callers, present only for fast failures.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExecuteError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn backend_error(&self) -> Option<&E> {
        match self {
            ExecuteError::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl<E> Clone for ExecuteError<E> {
    fn clone(&self) -> Self {
        match self {
            ExecuteError::Backend(err) => ExecuteError::Backend(Arc::clone(err)),
            ExecuteError::CircuitOpen {
                operation,
                retry_after,
            } => ExecuteError::CircuitOpen {
                operation: operation.clone(),
                retry_after: *retry_after,
            },
            ExecuteError::Timeout { operation, after } => ExecuteError::Timeout {
                operation: operation.clone(),
                after: *after,
            },
            ExecuteError::Aborted(reason) => ExecuteError::Aborted(reason.clone()),
            ExecuteError::Storage(err) => ExecuteError::Storage(err.clone()),
        }
    }
}
