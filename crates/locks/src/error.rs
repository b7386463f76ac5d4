use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("lock store unavailable: {message}")]
    Unavailable { message: String },
}

impl Error {
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of work run under a session lock.
#[derive(Debug, Error)]
pub enum ExclusiveError<E> {
    /// The lock could not be acquired within the retry budget.
    #[error("session lock unavailable for {key}")]
    Unavailable { key: String },

    /// The protected work itself failed; the lock was released.
    #[error("{0}")]
    Inner(E),
}

impl<E> ExclusiveError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Unavailable { .. } => None,
        }
    }
}
