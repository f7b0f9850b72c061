//! Trigger evaluation: may a stage start, may it finish?
//!
//! Pure functions of the stage record and the current time. Metric-based
//! triggers are an extension point: no metric source is wired in, so they
//! never fire on their own. Manual triggers never fire on their own either;
//! they move only through [`crate::RolloutService::manually_advance_stage`].

use stagehand_state::{RolloutStage, StageStatus, TriggerType};

/// Dwell time for a time-based stage whose configuration names none.
pub const DEFAULT_STAGE_DURATION_HOURS: f64 = 24.0;

/// Configuration key holding a time-based stage's dwell time, in hours.
pub const DURATION_KEY: &str = "duration";

const SECS_PER_HOUR: f64 = 3600.0;

/// Whether a pending stage may be activated at `now`.
pub fn eligible_for_activation(stage: &RolloutStage, now: u64) -> bool {
    if stage.status != StageStatus::Pending {
        return false;
    }
    match stage.trigger_type {
        TriggerType::TimeBased => stage.start_date.is_none_or(|start| start <= now),
        TriggerType::MetricBased => false,
        TriggerType::Manual => false,
    }
}

/// Whether an in-progress stage may be completed at `now`.
pub fn eligible_for_completion(stage: &RolloutStage, now: u64) -> bool {
    if stage.status != StageStatus::InProgress {
        return false;
    }
    match stage.trigger_type {
        TriggerType::TimeBased => {
            now.saturating_sub(stage.updated_at) >= stage_duration_secs(stage)
        }
        TriggerType::MetricBased => false,
        TriggerType::Manual => false,
    }
}

/// Configured dwell time of a time-based stage, in seconds.
///
/// Reads `trigger_configuration["duration"]` as hours. Accepts a JSON
/// number or a numeric string; anything else (missing, negative, garbage)
/// yields [`DEFAULT_STAGE_DURATION_HOURS`].
pub fn stage_duration_secs(stage: &RolloutStage) -> u64 {
    let hours = stage
        .trigger_configuration
        .get(DURATION_KEY)
        .and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|h| h.is_finite() && *h >= 0.0)
        .unwrap_or(DEFAULT_STAGE_DURATION_HOURS);
    (hours * SECS_PER_HOUR).round() as u64
}
