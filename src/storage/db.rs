use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::backends::InMemoryBackend;
use redb::{
    Database as RedbDatabase, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction,
};
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::tables::*;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
}

type BlobTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// redb-backed store. Cheap to clone; clones share one database handle.
#[derive(Clone)]
pub struct Database {
    db: Arc<RedbDatabase>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db_path = data_dir.as_ref().join("user-svc.redb");
        let db = RedbDatabase::create(db_path)?;
        Self::init(db)
    }

    /// Create a database that lives only in memory
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let db = RedbDatabase::builder().create_with_backend(InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: RedbDatabase) -> Result<Self, DatabaseError> {
        let write_txn = db.begin_write()?;
        {
            // Create tables if they don't exist
            let _ = write_txn.open_table(USERS)?;
            let _ = write_txn.open_table(USER_EMAILS)?;
            let _ = write_txn.open_table(SECRETS)?;
            let _ = write_txn.open_table(META)?;
            let _ = write_txn.open_table(TOKENS)?;
            let _ = write_txn.open_table(SECRET_TOKENS)?;
            let _ = write_txn.open_table(IDENTITY_TOKENS)?;
            let _ = write_txn.open_table(TOKEN_EXPIRY)?;
            let _ = write_txn.open_table(EMAIL_TOKENS)?;
            let _ = write_txn.open_table(IDENTITY_EMAIL_TOKENS)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Begin a read transaction
    pub fn begin_read(&self) -> Result<ReadTransaction, DatabaseError> {
        Ok(self.db.begin_read()?)
    }

    /// Begin a write transaction
    pub fn begin_write(&self) -> Result<WriteTransaction, DatabaseError> {
        Ok(self.db.begin_write()?)
    }

    /// Cheap reachability probe: open a read transaction and a table.
    pub fn ping(&self) -> Result<(), DatabaseError> {
        let read_txn = self.begin_read()?;
        let _ = read_txn.open_table(META)?;
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Build an expiration index key that sorts by time.
pub(crate) fn expiry_key(expires_at: &DateTime<Utc>, id: &str) -> String {
    format!("{:020}:{id}", expires_at.timestamp_millis().max(0))
}

/// Extract the millisecond timestamp from an expiration index key.
pub(crate) fn expiry_key_ms(key: &str) -> Option<i64> {
    key.split_once(':').and_then(|(ms, _)| ms.parse().ok())
}

pub(crate) fn read_record<T, R>(table: &R, key: &str) -> Result<Option<T>, DatabaseError>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
        None => Ok(None),
    }
}

/// Add `member` to the string list stored under `key`.
pub(crate) fn index_add(
    txn: &WriteTransaction,
    def: BlobTable,
    key: &str,
    member: &str,
) -> Result<(), DatabaseError> {
    let mut table = txn.open_table(def)?;
    let mut members: Vec<String> = read_record(&table, key)?.unwrap_or_default();
    if !members.iter().any(|m| m == member) {
        members.push(member.to_string());
        let data = rmp_serde::to_vec_named(&members)?;
        table.insert(key, data.as_slice())?;
    }
    Ok(())
}

/// Remove `member` from the list under `key`, dropping the key once empty.
pub(crate) fn index_remove(
    txn: &WriteTransaction,
    def: BlobTable,
    key: &str,
    member: &str,
) -> Result<(), DatabaseError> {
    let mut table = txn.open_table(def)?;
    let members: Option<Vec<String>> = read_record(&table, key)?;
    if let Some(mut members) = members {
        members.retain(|m| m != member);
        if members.is_empty() {
            table.remove(key)?;
        } else {
            let data = rmp_serde::to_vec_named(&members)?;
            table.insert(key, data.as_slice())?;
        }
    }
    Ok(())
}

/// Remove the whole list under `key` and return it.
pub(crate) fn index_take(
    txn: &WriteTransaction,
    def: BlobTable,
    key: &str,
) -> Result<Vec<String>, DatabaseError> {
    let mut table = txn.open_table(def)?;
    let members: Vec<String> = read_record(&table, key)?.unwrap_or_default();
    table.remove(key)?;
    Ok(members)
}
