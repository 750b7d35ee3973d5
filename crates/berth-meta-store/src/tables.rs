//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Key: path components joined by "\x00" (e.g. "v1\x00default\x00images\x00alpine"),
// Value: raw field bytes, empty for bucket markers
pub const META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("meta");
