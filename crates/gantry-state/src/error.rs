//! State backend error types.

/// Errors produced by [`StateBackend`](crate::StateBackend) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// `SQLite` failure annotated with the operation that hit it.
    #[error("{context}: {source}")]
    Operation {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row holds a value the current schema does not understand.
    #[error("corrupt state row: {0}")]
    Corrupt(String),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,
}

impl StateError {
    pub(crate) fn operation(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Operation { context, source }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
