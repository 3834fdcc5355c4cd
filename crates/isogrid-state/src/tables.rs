//! redb table definitions for the IsoGrid instance store.
//!
//! Document tables use `&str` keys and `&[u8]` values (JSON-serialized
//! domain types). The outbox is keyed by a monotonically increasing sequence.

use redb::TableDefinition;

/// Instances keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Isolation groups keyed by `{isolation_id}`.
pub const ISOLATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("isolations");

/// Auto-isolation configurations keyed by the master `{instance_id}`.
pub const AUTO_ISOLATION_CONFIGS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("auto_isolation_configs");

/// Queued messages keyed by publish sequence.
pub const OUTBOX: TableDefinition<u64, &[u8]> = TableDefinition::new("outbox");
