use redb::{Database as RedbDatabase, ReadTransaction, ReadableTable, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::tables::*;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Commit error: {0}")]
    Commit(Box<redb::CommitError>),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Database error: {0}")]
    Redb(Box<redb::Error>),
    #[error("Database error: {0}")]
    RedbDatabase(Box<redb::DatabaseError>),
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("Storage error: {0}")]
    Storage(Box<redb::StorageError>),
    #[error("Table error: {0}")]
    Table(Box<redb::TableError>),
    #[error("Transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
}

impl From<redb::CommitError> for DatabaseError {
    fn from(e: redb::CommitError) -> Self {
        DatabaseError::Commit(Box::new(e))
    }
}

impl From<redb::DatabaseError> for DatabaseError {
    fn from(e: redb::DatabaseError) -> Self {
        DatabaseError::RedbDatabase(Box::new(e))
    }
}

impl From<redb::Error> for DatabaseError {
    fn from(e: redb::Error) -> Self {
        DatabaseError::Redb(Box::new(e))
    }
}

impl From<redb::StorageError> for DatabaseError {
    fn from(e: redb::StorageError) -> Self {
        DatabaseError::Storage(Box::new(e))
    }
}

impl From<redb::TableError> for DatabaseError {
    fn from(e: redb::TableError) -> Self {
        DatabaseError::Table(Box::new(e))
    }
}

impl From<redb::TransactionError> for DatabaseError {
    fn from(e: redb::TransactionError) -> Self {
        DatabaseError::Transaction(Box::new(e))
    }
}

pub struct Database {
    db: Arc<RedbDatabase>,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
        }
    }
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db_path = data_dir.as_ref().join("attachment-manager.redb");
        let db = Arc::new(RedbDatabase::create(db_path)?);

        // Initialize application tables
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ATTACHMENTS)?;
            let _ = write_txn.open_table(ATTACHMENT_PATHS)?;
            let _ = write_txn.open_table(ATTACHMENT_USAGES)?;
            let _ = write_txn.open_table(OWNER_ATTACHMENTS)?;
            let _ = write_txn.open_table(KV_ENTRIES)?;
            let _ = write_txn.open_table(COUNTERS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Begin a read transaction
    pub fn begin_read(&self) -> Result<ReadTransaction, DatabaseError> {
        Ok(self.db.begin_read()?)
    }

    /// Begin a write transaction
    pub fn begin_write(&self) -> Result<WriteTransaction, DatabaseError> {
        Ok(self.db.begin_write()?)
    }

    /// Drop every row in every application table, counters included.
    /// Returns the number of attachment rows removed. Backing for the
    /// test-mode purge route only.
    pub fn purge_all(&self) -> Result<u64, DatabaseError> {
        let write_txn = self.begin_write()?;
        let removed = {
            let table = write_txn.open_table(ATTACHMENTS)?;
            let mut count = 0u64;
            for row in table.iter()? {
                row?;
                count += 1;
            }
            count
        };
        write_txn.delete_table(ATTACHMENTS)?;
        write_txn.delete_table(ATTACHMENT_PATHS)?;
        write_txn.delete_table(ATTACHMENT_USAGES)?;
        write_txn.delete_table(OWNER_ATTACHMENTS)?;
        write_txn.delete_table(KV_ENTRIES)?;
        write_txn.delete_table(COUNTERS)?;
        {
            let _ = write_txn.open_table(ATTACHMENTS)?;
            let _ = write_txn.open_table(ATTACHMENT_PATHS)?;
            let _ = write_txn.open_table(ATTACHMENT_USAGES)?;
            let _ = write_txn.open_table(OWNER_ATTACHMENTS)?;
            let _ = write_txn.open_table(KV_ENTRIES)?;
            let _ = write_txn.open_table(COUNTERS)?;
        }
        write_txn.commit()?;
        Ok(removed)
    }

    /// Issue the next value of a named counter within an open write
    /// transaction.
    pub(crate) fn next_counter(
        write_txn: &WriteTransaction,
        name: &str,
    ) -> Result<u64, DatabaseError> {
        let mut table = write_txn.open_table(COUNTERS)?;
        let next = table.get(name)?.map(|v| v.value()).unwrap_or(0) + 1;
        table.insert(name, next)?;
        Ok(next)
    }
}
