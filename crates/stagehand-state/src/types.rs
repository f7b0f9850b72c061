//! Domain types for the Stagehand state store.
//!
//! These types represent the persisted state of feature flags, rollout
//! schedules, and rollout stages. All types are serializable to/from JSON
//! for storage in redb tables. Timestamps are unix epoch seconds.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a feature flag.
pub type FlagId = String;

/// Unique identifier for a rollout schedule.
pub type ScheduleId = String;

/// Unique identifier for a rollout stage.
pub type StageId = String;

/// Identifier of the user owning a schedule.
pub type OwnerId = String;

/// Trigger-specific settings for a stage, e.g. `{"duration": 6}`.
pub type TriggerConfiguration = BTreeMap<String, serde_json::Value>;

// ── Feature flag ──────────────────────────────────────────────────

/// The slice of a feature flag record the rollout engine reads and writes.
///
/// Flags are owned by the wider flag system; the engine only ever changes
/// `rollout_percentage` and `updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureFlag {
    pub id: FlagId,
    pub key: String,
    /// Share of traffic that sees the flag enabled (0-100).
    pub rollout_percentage: u32,
    pub updated_at: u64,
}

// ── Schedule ──────────────────────────────────────────────────────

/// A plan to raise one flag's rollout percentage through ordered stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutSchedule {
    pub id: ScheduleId,
    pub name: String,
    pub description: Option<String>,
    pub feature_flag_id: FlagId,
    pub owner_id: OwnerId,
    pub status: ScheduleStatus,
    pub start_date: Option<u64>,
    /// Once passed, the processor stops driving this schedule.
    pub end_date: Option<u64>,
    /// Upper bound for every stage's target percentage (0-100).
    pub max_percentage: u32,
    /// Minimum dwell, in hours, between two stage activations.
    pub min_stage_duration: Option<u32>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle status of a rollout schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed and Cancelled schedules never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Stage ─────────────────────────────────────────────────────────

/// One step of a schedule: a target percentage plus the trigger that
/// decides when the step starts and ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutStage {
    pub id: StageId,
    pub rollout_schedule_id: ScheduleId,
    pub name: String,
    pub description: Option<String>,
    /// Position within the schedule, 0-based and gap-free.
    pub stage_order: u32,
    pub target_percentage: u32,
    pub status: StageStatus,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_configuration: TriggerConfiguration,
    /// Earliest activation time for time-based stages. `None` means immediately.
    pub start_date: Option<u64>,
    pub completed_date: Option<u64>,
    /// When the stage last moved to `InProgress`.
    #[serde(default)]
    pub activated_at: Option<u64>,
    pub created_at: u64,
    /// Reference point for duration-based completion.
    pub updated_at: u64,
}

/// Lifecycle status of a rollout stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What drives a stage forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Starts at `start_date`, ends after `trigger_configuration["duration"]` hours.
    TimeBased,
    /// Reserved for metric gates; never fires on its own.
    MetricBased,
    /// Only moves when an operator advances it.
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeBased => "time_based",
            Self::MetricBased => "metric_based",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RolloutStage {
    /// Build the composite key for the stages table.
    pub fn table_key(&self) -> String {
        stage_key(&self.rollout_schedule_id, &self.id)
    }
}

/// Composite stages-table key for a stage of a schedule.
pub fn stage_key(schedule_id: &str, stage_id: &str) -> String {
    format!("{schedule_id}:{stage_id}")
}
