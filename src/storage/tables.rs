use redb::TableDefinition;

/// Attachment records: id -> AttachmentRecord (msgpack)
pub const ATTACHMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("attachments");

/// Path index: "{public|private}:{group?/}name" -> attachment id.
/// Enforces name uniqueness within a (group, visibility) pair and backs
/// lookups by relative file path.
pub const ATTACHMENT_PATHS: TableDefinition<&str, u64> = TableDefinition::new("attachment_paths");

/// Usage edges: attachment id -> msgpack Vec of UsageRecord
pub const ATTACHMENT_USAGES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("attachment_usages");

/// Owner index: "{owner_type}:{owner_id}" -> msgpack Vec of attachment ids
pub const OWNER_ATTACHMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("owner_attachments");

/// TTL key-value entries (token store): key -> KvEntry (msgpack)
pub const KV_ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("kv_entries");

/// Monotonic counters: name -> last issued value
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
