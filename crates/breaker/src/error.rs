use std::time::Duration;

use thiserror::Error;

/// Why a protected call did not produce a value.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the call was not attempted.
    #[error("circuit '{name}' is open")]
    Open { name: String },

    #[error("call through '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("{0}")]
    Failed(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}
