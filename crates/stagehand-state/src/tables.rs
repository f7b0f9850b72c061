//! redb table definitions for the Stagehand state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Feature flags keyed by `{flag_id}`.
pub const FEATURE_FLAGS: TableDefinition<&str, &[u8]> = TableDefinition::new("feature_flags");

/// Rollout schedules keyed by `{schedule_id}`.
pub const SCHEDULES: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout_schedules");

/// Rollout stages keyed by `{schedule_id}:{stage_id}`.
pub const STAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("rollout_stages");

/// Stage → owning schedule index, keyed by `{stage_id}`. Values are the
/// UTF-8 schedule id.
pub const STAGE_OWNERS: TableDefinition<&str, &str> = TableDefinition::new("stage_owners");
