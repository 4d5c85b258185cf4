use thiserror::Error;

/// Boxed error returned by [`Store`](crate::Store) implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur within the watch scheduler.
#[derive(Debug, Error)]
pub enum Error {
    /// A watch was registered with an empty `field` name.
    #[error("watch field is empty")]
    EmptyField,

    /// The scheduler was constructed with an empty namespace.
    #[error("namespace is empty")]
    EmptyNamespace,

    /// Another recovery pass holds the lock for this namespace. Retry after
    /// the lock TTL rather than treating this as fatal.
    #[error("recovery is locked by another instance")]
    LockHeld,

    /// A store round-trip failed on the write path.
    #[error("store round-trip failed: {0}")]
    Store(#[source] BoxError),

    /// Encoding or decoding a watch record failed.
    #[error("watch record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// The timer engine has been shut down and accepts no further commands.
    #[error("timer engine is shut down")]
    EngineClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
