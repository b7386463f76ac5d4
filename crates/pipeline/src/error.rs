use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Dedup(#[from] switchboard_dedup::Error),

    #[error(transparent)]
    Queue(#[from] switchboard_queue::Error),

    #[error(transparent)]
    Locks(#[from] switchboard_locks::Error),

    #[error(transparent)]
    RateLimit(#[from] switchboard_ratelimit::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
