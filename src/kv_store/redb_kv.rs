use async_trait::async_trait;
use chrono::Utc;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{glob_match, KvError, KvStore};
use crate::storage::{Database, KV_ENTRIES};

/// A TTL entry persisted in redb. Expiry is wall-clock so entries survive
/// process restarts with their deadline intact.
#[derive(Debug, Serialize, Deserialize)]
struct KvEntry {
    value: String,
    expires_at: i64,
}

/// TTL key-value store backed by the shared redb database.
///
/// Expiry is checked on read; stale entries are purged lazily on access and
/// during key scans rather than by a sweeper task.
pub struct RedbKvStore {
    db: Database,
}

impl RedbKvStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn read_live(&self, key: &str, now: i64) -> Result<Option<KvEntry>, KvError> {
        let read_txn = self.db.begin_read().map_err(KvError::from)?;
        let table = read_txn.open_table(KV_ENTRIES).map_err(|e| KvError::Store(e.to_string()))?;
        let entry: Option<KvEntry> = match table.get(key).map_err(|e| KvError::Store(e.to_string()))? {
            Some(data) => Some(
                rmp_serde::from_slice(data.value()).map_err(|e| KvError::Store(e.to_string()))?,
            ),
            None => None,
        };
        Ok(entry.filter(|e| e.expires_at > now))
    }

    fn write_entry(&self, key: &str, entry: &KvEntry) -> Result<(), KvError> {
        let write_txn = self.db.begin_write().map_err(KvError::from)?;
        {
            let mut table = write_txn
                .open_table(KV_ENTRIES)
                .map_err(|e| KvError::Store(e.to_string()))?;
            let data = rmp_serde::to_vec_named(entry).map_err(|e| KvError::Store(e.to_string()))?;
            table
                .insert(key, data.as_slice())
                .map_err(|e| KvError::Store(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| KvError::Store(e.to_string()))?;
        Ok(())
    }

    fn remove_keys(&self, keys: &[String]) -> Result<(), KvError> {
        let write_txn = self.db.begin_write().map_err(KvError::from)?;
        {
            let mut table = write_txn
                .open_table(KV_ENTRIES)
                .map_err(|e| KvError::Store(e.to_string()))?;
            for key in keys {
                table
                    .remove(key.as_str())
                    .map_err(|e| KvError::Store(e.to_string()))?;
            }
        }
        write_txn.commit().map_err(|e| KvError::Store(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for RedbKvStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let entry = KvEntry {
            value: value.to_string(),
            expires_at: Utc::now().timestamp() + ttl.as_secs() as i64,
        };
        self.write_entry(key, &entry)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Utc::now().timestamp();
        Ok(self.read_live(key, now)?.map(|e| e.value))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, KvError> {
        let now = Utc::now().timestamp();
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.read_live(key, now)?.map(|e| e.value));
        }
        Ok(values)
    }

    async fn del(&self, keys: &[String]) -> Result<(), KvError> {
        self.remove_keys(keys)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Utc::now().timestamp();
        match self.read_live(key, now)? {
            Some(mut entry) => {
                entry.expires_at = now + ttl.as_secs() as i64;
                self.write_entry(key, &entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let now = Utc::now().timestamp();
        let mut live = Vec::new();
        let mut stale = Vec::new();
        {
            let read_txn = self.db.begin_read().map_err(KvError::from)?;
            let table = read_txn
                .open_table(KV_ENTRIES)
                .map_err(|e| KvError::Store(e.to_string()))?;
            for result in table.iter().map_err(|e| KvError::Store(e.to_string()))? {
                let (key, value) = result.map_err(|e| KvError::Store(e.to_string()))?;
                let entry: KvEntry = rmp_serde::from_slice(value.value())
                    .map_err(|e| KvError::Store(e.to_string()))?;
                let key = key.value().to_string();
                if entry.expires_at <= now {
                    stale.push(key);
                } else if glob_match(pattern, &key) {
                    live.push(key);
                }
            }
        }
        if !stale.is_empty() {
            self.remove_keys(&stale)?;
        }
        Ok(live)
    }
}
