use chrono::{DateTime, Utc};
use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::{path_index_key, AttachmentRecord, UsageRecord};
use super::tables::*;

const ATTACHMENT_COUNTER: &str = "attachments";

/// Fields for a new attachment row; the id is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub name: String,
    pub name_original: String,
    pub group: Option<String>,
    pub private: bool,
    pub creator_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Database {
    // ========================================================================
    // Attachment operations
    // ========================================================================

    /// Insert a new attachment row and its path index entry.
    ///
    /// Fails with `Conflict` if the name is already taken within the same
    /// (group, visibility) pair.
    pub fn insert_attachment(
        &self,
        new: NewAttachment,
    ) -> Result<AttachmentRecord, DatabaseError> {
        let write_txn = self.begin_write()?;
        let record = {
            let path_key = path_index_key(new.private, new.group.as_deref(), &new.name);
            {
                let path_table = write_txn.open_table(ATTACHMENT_PATHS)?;
                if path_table.get(path_key.as_str())?.is_some() {
                    return Err(DatabaseError::Conflict(format!(
                        "attachment name '{path_key}' is already in use"
                    )));
                }
            }

            let id = Self::next_counter(&write_txn, ATTACHMENT_COUNTER)?;
            let record = AttachmentRecord {
                id,
                name: new.name,
                name_original: new.name_original,
                group: new.group,
                private: new.private,
                creator_id: new.creator_id,
                created_at: new.created_at,
            };

            let data = rmp_serde::to_vec_named(&record)?;
            let mut table = write_txn.open_table(ATTACHMENTS)?;
            table.insert(record.id, data.as_slice())?;

            let mut path_table = write_txn.open_table(ATTACHMENT_PATHS)?;
            path_table.insert(path_key.as_str(), record.id)?;
            record
        };
        write_txn.commit()?;
        Ok(record)
    }

    /// Get an attachment by id.
    pub fn get_attachment(&self, id: u64) -> Result<Option<AttachmentRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(ATTACHMENTS)?;

        match table.get(id)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Resolve an attachment from a relative file path `{group?}/{name}`
    /// within the given visibility class.
    pub fn get_attachment_by_path(
        &self,
        private: bool,
        rel_path: &str,
    ) -> Result<Option<AttachmentRecord>, DatabaseError> {
        let vis = if private { "private" } else { "public" };
        let key = format!("{vis}:{rel_path}");

        let read_txn = self.begin_read()?;
        let path_table = read_txn.open_table(ATTACHMENT_PATHS)?;
        let id = match path_table.get(key.as_str())? {
            Some(v) => v.value(),
            None => return Ok(None),
        };

        let table = read_txn.open_table(ATTACHMENTS)?;
        match table.get(id)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Rename a stored attachment (format conversion). Updates the path
    /// index; `name_original` is never touched.
    pub fn rename_attachment(&self, id: u64, new_name: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let renamed = {
            let existing: Option<AttachmentRecord> = {
                let table = write_txn.open_table(ATTACHMENTS)?;
                // Bound so the access guard drops before the table handle
                let found = match table.get(id)? {
                    Some(data) => Some(rmp_serde::from_slice(data.value())?),
                    None => None,
                };
                found
            };

            match existing {
                Some(mut record) => {
                    let new_key = path_index_key(record.private, record.group.as_deref(), new_name);
                    let old_key = record.path_index_key();
                    {
                        let path_table = write_txn.open_table(ATTACHMENT_PATHS)?;
                        if new_key != old_key && path_table.get(new_key.as_str())?.is_some() {
                            return Err(DatabaseError::Conflict(format!(
                                "attachment name '{new_key}' is already in use"
                            )));
                        }
                    }

                    record.name = new_name.to_string();
                    let data = rmp_serde::to_vec_named(&record)?;
                    let mut table = write_txn.open_table(ATTACHMENTS)?;
                    table.insert(id, data.as_slice())?;

                    let mut path_table = write_txn.open_table(ATTACHMENT_PATHS)?;
                    path_table.remove(old_key.as_str())?;
                    path_table.insert(new_key.as_str(), id)?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(renamed)
    }

    /// Delete an attachment row, its path index entry, and all of its usage
    /// edges (including the owner index side).
    pub fn delete_attachment(&self, id: u64) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;

        let existing: Option<AttachmentRecord> = {
            let table = write_txn.open_table(ATTACHMENTS)?;
            let found = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            found
        };

        let deleted = match existing {
            Some(record) => {
                {
                    let mut table = write_txn.open_table(ATTACHMENTS)?;
                    table.remove(id)?;
                }
                {
                    let mut path_table = write_txn.open_table(ATTACHMENT_PATHS)?;
                    path_table.remove(record.path_index_key().as_str())?;
                }

                // Drop usage edges and unlink from each owner's index
                let usages: Vec<UsageRecord> = {
                    let usage_table = write_txn.open_table(ATTACHMENT_USAGES)?;
                    let found = match usage_table.get(id)? {
                        Some(data) => rmp_serde::from_slice(data.value())?,
                        None => Vec::new(),
                    };
                    found
                };
                {
                    let mut usage_table = write_txn.open_table(ATTACHMENT_USAGES)?;
                    usage_table.remove(id)?;
                }
                for usage in &usages {
                    let owner_key = format!("{}:{}", usage.owner_type, usage.owner_id);
                    let ids: Option<Vec<u64>> = {
                        let owner_table = write_txn.open_table(OWNER_ATTACHMENTS)?;
                        let found = match owner_table.get(owner_key.as_str())? {
                            Some(data) => Some(rmp_serde::from_slice(data.value())?),
                            None => None,
                        };
                        found
                    };
                    if let Some(mut ids) = ids {
                        ids.retain(|aid| *aid != id);
                        let mut owner_table = write_txn.open_table(OWNER_ATTACHMENTS)?;
                        if ids.is_empty() {
                            owner_table.remove(owner_key.as_str())?;
                        } else {
                            let data = rmp_serde::to_vec_named(&ids)?;
                            owner_table.insert(owner_key.as_str(), data.as_slice())?;
                        }
                    }
                }
                true
            }
            None => false,
        };

        write_txn.commit()?;
        Ok(deleted)
    }

    /// Collect up to `limit` attachments created strictly before `cutoff`
    /// that have no usage edges. The comparison is on the full instant, not
    /// the date, so rows created seconds ago are never swept early.
    pub fn list_expired_orphans(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AttachmentRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(ATTACHMENTS)?;
        let usage_table = read_txn.open_table(ATTACHMENT_USAGES)?;

        let mut orphans = Vec::new();
        for result in table.iter()? {
            if orphans.len() >= limit {
                break;
            }
            let (id, value) = result?;
            let record: AttachmentRecord = rmp_serde::from_slice(value.value())?;
            if record.created_at >= cutoff {
                continue;
            }
            let used = match usage_table.get(id.value())? {
                Some(data) => {
                    let usages: Vec<UsageRecord> = rmp_serde::from_slice(data.value())?;
                    !usages.is_empty()
                }
                None => false,
            };
            if !used {
                orphans.push(record);
            }
        }

        Ok(orphans)
    }
}
