use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The failure side of every [`Promise`](crate::Promise) settlement.
///
/// The type is cheap to clone so a single settlement can be observed by any
/// number of awaiters and `on_settle` callbacks.
#[derive(Debug, Clone, Error)]
pub enum AsyncError {
    #[error("operation `{name}` timed out after {elapsed:?} (deadline {deadline:?})")]
    Timeout { name: String, deadline: Duration, elapsed: Duration },

    #[error("operation cancelled: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Cancelled { reason: Option<String> },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("operation failed: {source}")]
    Failed { source: Arc<dyn Error + Send + Sync> },

    #[error("event loop stalled before the operation completed")]
    Stalled,
}

impl AsyncError {
    pub fn timeout<S: ToString>(name: S, deadline: Duration, elapsed: Duration) -> Self {
        Self::Timeout { name: name.to_string(), deadline, elapsed }
    }

    pub fn cancelled() -> Self {
        Self::Cancelled { reason: None }
    }

    pub fn cancelled_with<S: ToString>(reason: S) -> Self {
        Self::Cancelled { reason: Some(reason.to_string()) }
    }

    pub fn invalid_argument<S: ToString>(str: S) -> Self {
        Self::InvalidArgument { reason: str.to_string() }
    }

    pub fn failed<E: Into<Box<dyn Error + Send + Sync>>>(e: E) -> Self {
        Self::Failed { source: Arc::from(e.into()) }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<std::io::Error> for AsyncError {
    fn from(e: std::io::Error) -> Self {
        Self::failed(e)
    }
}
