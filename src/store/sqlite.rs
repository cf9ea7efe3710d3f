//! `SQLite`-backed implementation of [`RecordStore`].
//!
//! One connection is opened for the lifetime of the store and shared behind a
//! `Mutex`; lookups are short point reads so contention stays low.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::core::record::{Lookup, Record};
use crate::store::error::{self, StoreError};
use crate::store::RecordStore;

/// Idempotent DDL. `identifier` is deliberately not unique.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS records (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    identifier TEXT NOT NULL,
    name       TEXT,
    size       TEXT,
    color      TEXT,
    quantity   INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_records_identifier ON records (identifier);
";

const SELECT_FIRST: &str = "SELECT identifier, name, size, color, quantity \
     FROM records WHERE identifier = ?1 ORDER BY id LIMIT 1";

/// `SQLite` record storage.
///
/// Create with [`SqliteRecordStore::open`] for file-backed persistence
/// or [`SqliteRecordStore::in_memory`] for tests.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open or create a record database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory can't be created,
    /// or [`StoreError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        debug!(path = %path.display(), "record store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the schema can't be created.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    #[cfg(test)]
    fn drop_table(&self) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch("DROP TABLE records")?;
        Ok(())
    }
}

impl RecordStore for SqliteRecordStore {
    fn lookup(&self, identifier: &str) -> error::Result<Lookup> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare_cached(SELECT_FIRST)?;
        let record = stmt
            .query_row(params![identifier], |row| {
                Ok(Record {
                    identifier: row.get(0)?,
                    name: row.get(1)?,
                    size: row.get(2)?,
                    color: row.get(3)?,
                    quantity: row.get(4)?,
                })
            })
            .optional()?;
        Ok(Lookup::from(record))
    }

    fn insert(&self, record: &Record) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO records (identifier, name, size, color, quantity) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.identifier,
                record.name,
                record.size,
                record.color,
                record.quantity
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn count(&self) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pants() -> Record {
        Record::new("MERT2025ABCD1234", Some("Kot Pantolon"), Some("L"), Some("Koyu Mavi"), 3)
    }

    #[test]
    fn lookup_returns_inserted_record() {
        let store = SqliteRecordStore::in_memory().unwrap();
        store.insert(&pants()).unwrap();

        match store.lookup("MERT2025ABCD1234").unwrap() {
            Lookup::Found(record) => assert_eq!(record, pants()),
            Lookup::NotFound => panic!("expected a record"),
        }
    }

    #[test]
    fn missing_identifier_is_not_found() {
        let store = SqliteRecordStore::in_memory().unwrap();
        assert_eq!(store.lookup("UNKNOWN999").unwrap(), Lookup::NotFound);
    }

    #[test]
    fn duplicate_identifiers_resolve_to_first_row() {
        let store = SqliteRecordStore::in_memory().unwrap();
        let first = store.insert(&pants()).unwrap();
        let second = store
            .insert(&Record::new("MERT2025ABCD1234", Some("Other"), None, None, 99))
            .unwrap();
        assert!(first < second);

        let lookup = store.lookup("MERT2025ABCD1234").unwrap();
        assert_eq!(lookup.payload(), "Kot Pantolon:L:Koyu Mavi:3");
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn lookup_is_exact_match() {
        let store = SqliteRecordStore::in_memory().unwrap();
        store.insert(&pants()).unwrap();
        assert_eq!(store.lookup("mert2025abcd1234").unwrap(), Lookup::NotFound);
        assert_eq!(store.lookup("MERT2025ABCD1234 ").unwrap(), Lookup::NotFound);
    }

    #[test]
    fn null_attributes_round_trip() {
        let store = SqliteRecordStore::in_memory().unwrap();
        store
            .insert(&Record::new("BARE", None, None, None, 0))
            .unwrap();
        assert_eq!(store.lookup("BARE").unwrap().payload(), ":::0");
    }

    #[test]
    fn storage_fault_is_an_error_not_not_found() {
        let store = SqliteRecordStore::in_memory().unwrap();
        store.drop_table().unwrap();
        let err = store.lookup("MERT2025ABCD1234").unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)), "got: {err}");
    }

    #[test]
    fn file_backed_store_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("records.db");

        {
            let store = SqliteRecordStore::open(&path).unwrap();
            store.insert(&pants()).unwrap();
        }

        let reopened = SqliteRecordStore::open(&path).unwrap();
        assert!(reopened.lookup("MERT2025ABCD1234").unwrap().is_found());
        assert_eq!(reopened.count().unwrap(), 1);
    }
}
