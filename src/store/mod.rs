//! Persistent identifier → record mapping.
//!
//! [`RecordStore`] is the contract the relay reads through; [`SqliteRecordStore`]
//! is the production backend. Seeding helpers live in [`seed`].

pub mod error;
pub mod seed;
pub mod sqlite;

use std::sync::Arc;

use crate::core::record::{Lookup, Record};

pub use error::StoreError;
pub use sqlite::SqliteRecordStore;

/// Storage contract for tag records.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn RecordStore>`.
pub trait RecordStore: Send + Sync {
    /// Point lookup by identifier. Returns the first match in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure only; no match is `Ok(Lookup::NotFound)`.
    fn lookup(&self, identifier: &str) -> error::Result<Lookup>;

    /// Insert a record, returning its row id. Used by seeding, not by the relay.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn insert(&self, record: &Record) -> error::Result<i64>;

    /// Number of stored records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn count(&self) -> error::Result<u64>;
}

/// Run a lookup on the blocking pool so the async consume loop is not stalled
/// by `SQLite` I/O.
pub async fn lookup_blocking(
    store: Arc<dyn RecordStore>,
    identifier: String,
) -> error::Result<Lookup> {
    tokio::task::spawn_blocking(move || store.lookup(&identifier))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}
