use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::{OwnerRef, UsageRecord};
use super::tables::*;

impl Database {
    // ========================================================================
    // Usage edge operations
    // ========================================================================

    /// Add a usage edge. Idempotent: the existence check and the insert run
    /// in the same write transaction, so concurrent calls for the same edge
    /// cannot produce duplicates.
    pub fn add_usage(
        &self,
        attachment_id: u64,
        owner: &OwnerRef,
        tag: &str,
    ) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let added = {
            let mut usages: Vec<UsageRecord> = {
                let table = write_txn.open_table(ATTACHMENT_USAGES)?;
                // Bound so the access guard drops before the table handle
                let found = match table.get(attachment_id)? {
                    Some(data) => rmp_serde::from_slice(data.value())?,
                    None => Vec::new(),
                };
                found
            };

            let edge = UsageRecord {
                owner_id: owner.owner_id.clone(),
                owner_type: owner.owner_type.clone(),
                tag: tag.to_string(),
            };
            if usages.contains(&edge) {
                false
            } else {
                usages.push(edge);
                let data = rmp_serde::to_vec_named(&usages)?;
                let mut table = write_txn.open_table(ATTACHMENT_USAGES)?;
                table.insert(attachment_id, data.as_slice())?;

                Self::link_owner(&write_txn, owner, attachment_id)?;
                true
            }
        };
        write_txn.commit()?;
        Ok(added)
    }

    /// Remove all usage edges between an attachment and an owner, across
    /// tags. Owner type matching is exact.
    pub fn remove_usage(&self, attachment_id: u64, owner: &OwnerRef) -> Result<u64, DatabaseError> {
        self.remove_usage_edges(attachment_id, owner, None)
    }

    /// Remove the usage edge with one specific tag.
    pub fn remove_usage_tagged(
        &self,
        attachment_id: u64,
        owner: &OwnerRef,
        tag: &str,
    ) -> Result<u64, DatabaseError> {
        self.remove_usage_edges(attachment_id, owner, Some(tag))
    }

    fn remove_usage_edges(
        &self,
        attachment_id: u64,
        owner: &OwnerRef,
        tag: Option<&str>,
    ) -> Result<u64, DatabaseError> {
        let write_txn = self.begin_write()?;
        let removed = {
            let mut usages: Vec<UsageRecord> = {
                let table = write_txn.open_table(ATTACHMENT_USAGES)?;
                // Bound so the access guard drops before the table handle
                let found = match table.get(attachment_id)? {
                    Some(data) => rmp_serde::from_slice(data.value())?,
                    None => Vec::new(),
                };
                found
            };

            let before = usages.len();
            usages.retain(|u| {
                !(u.owner_id == owner.owner_id
                    && u.owner_type == owner.owner_type
                    && tag.map(|t| u.tag == t).unwrap_or(true))
            });
            let removed = (before - usages.len()) as u64;

            if removed > 0 {
                let mut table = write_txn.open_table(ATTACHMENT_USAGES)?;
                if usages.is_empty() {
                    table.remove(attachment_id)?;
                } else {
                    let data = rmp_serde::to_vec_named(&usages)?;
                    table.insert(attachment_id, data.as_slice())?;
                }

                // Unlink the owner index only when no edge for this owner
                // remains under any tag.
                let owner_still_linked = usages
                    .iter()
                    .any(|u| u.owner_id == owner.owner_id && u.owner_type == owner.owner_type);
                if !owner_still_linked {
                    Self::unlink_owner(&write_txn, owner, attachment_id)?;
                }
            }
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Check whether any edge exists between an attachment and an owner.
    pub fn has_usage(&self, attachment_id: u64, owner: &OwnerRef) -> Result<bool, DatabaseError> {
        Ok(self
            .usages_for(attachment_id)?
            .iter()
            .any(|u| u.owner_id == owner.owner_id && u.owner_type == owner.owner_type))
    }

    /// All usage edges of an attachment.
    pub fn usages_for(&self, attachment_id: u64) -> Result<Vec<UsageRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(ATTACHMENT_USAGES)?;
        match table.get(attachment_id)? {
            Some(data) => Ok(rmp_serde::from_slice(data.value())?),
            None => Ok(Vec::new()),
        }
    }

    /// Distinct owners referencing an attachment (reverse lookup for the
    /// access decision).
    pub fn owners_of(&self, attachment_id: u64) -> Result<Vec<OwnerRef>, DatabaseError> {
        let mut owners: Vec<OwnerRef> = Vec::new();
        for usage in self.usages_for(attachment_id)? {
            let owner = OwnerRef::new(usage.owner_type, usage.owner_id);
            if !owners.contains(&owner) {
                owners.push(owner);
            }
        }
        Ok(owners)
    }

    /// Attachment ids referenced by an owner.
    pub fn attachments_of(&self, owner: &OwnerRef) -> Result<Vec<u64>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(OWNER_ATTACHMENTS)?;
        match table.get(owner.index_key().as_str())? {
            Some(data) => Ok(rmp_serde::from_slice(data.value())?),
            None => Ok(Vec::new()),
        }
    }

    /// Owner deletion cascade: drop every edge the owner holds. Attachment
    /// rows are never touched; orphaning them is intentional, the garbage
    /// collector picks them up later.
    pub fn remove_owner_usages(&self, owner: &OwnerRef) -> Result<u64, DatabaseError> {
        let attachment_ids = self.attachments_of(owner)?;
        let mut removed = 0;
        for attachment_id in attachment_ids {
            removed += self.remove_usage(attachment_id, owner)?;
        }
        Ok(removed)
    }

    // ========================================================================
    // Owner index maintenance (within an open write transaction)
    // ========================================================================

    fn link_owner(
        write_txn: &redb::WriteTransaction,
        owner: &OwnerRef,
        attachment_id: u64,
    ) -> Result<(), DatabaseError> {
        let key = owner.index_key();
        let mut ids: Vec<u64> = {
            let table = write_txn.open_table(OWNER_ATTACHMENTS)?;
            let found = match table.get(key.as_str())? {
                Some(data) => rmp_serde::from_slice(data.value())?,
                None => Vec::new(),
            };
            found
        };
        if !ids.contains(&attachment_id) {
            ids.push(attachment_id);
            let data = rmp_serde::to_vec_named(&ids)?;
            let mut table = write_txn.open_table(OWNER_ATTACHMENTS)?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        Ok(())
    }

    fn unlink_owner(
        write_txn: &redb::WriteTransaction,
        owner: &OwnerRef,
        attachment_id: u64,
    ) -> Result<(), DatabaseError> {
        let key = owner.index_key();
        let ids: Option<Vec<u64>> = {
            let table = write_txn.open_table(OWNER_ATTACHMENTS)?;
            let found = match table.get(key.as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            found
        };
        if let Some(mut ids) = ids {
            ids.retain(|id| *id != attachment_id);
            let mut table = write_txn.open_table(OWNER_ATTACHMENTS)?;
            if ids.is_empty() {
                table.remove(key.as_str())?;
            } else {
                let data = rmp_serde::to_vec_named(&ids)?;
                table.insert(key.as_str(), data.as_slice())?;
            }
        }
        Ok(())
    }
}
