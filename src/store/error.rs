//! Record store error types.

/// Storage faults. A missing identifier is reported as
/// [`Lookup::NotFound`](crate::core::record::Lookup), never as an error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("record store lock poisoned")]
    LockPoisoned,

    /// Blocking lookup task did not complete.
    #[error("lookup task failed: {0}")]
    Task(String),
}

/// Convenience alias used throughout the store module.
pub type Result<T> = std::result::Result<T, StoreError>;
