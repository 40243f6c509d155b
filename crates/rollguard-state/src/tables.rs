//! redb table definitions for the rollguard state store.

use redb::TableDefinition;

/// All flags keyed by their well-known key; values are JSON-serialized [`crate::Flag`] rows.
pub const FLAGS: TableDefinition<&str, &[u8]> = TableDefinition::new("flags");
