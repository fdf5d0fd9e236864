//! redb table definitions for the Berth state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Scheduled jobs keyed by `{app_id}/{version}/{process_type}/{instance:010}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Stack assignments keyed by `{app_id}`.
pub const STACKS: TableDefinition<&str, &[u8]> = TableDefinition::new("stacks");
