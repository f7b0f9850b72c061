//! Rollout engine error types.

use stagehand_state::{StageId, StateError, TriggerType};
use thiserror::Error;

/// Errors surfaced by rollout operations.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("schedule {0} has no stages")]
    EmptySchedule(String),

    #[error("stage ordering violation: {0}")]
    OrderingViolation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("feature flag {flag_id} could not be updated for stage {stage_id}")]
    FlagUpdateFailed { flag_id: String, stage_id: StageId },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("stage {stage_id} uses a {trigger} trigger and cannot be advanced manually")]
    ManualAdvanceRejected {
        stage_id: StageId,
        trigger: TriggerType,
    },

    #[error("schedule {id} is inconsistent: {reason}")]
    CorruptSchedule { id: String, reason: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl RolloutError {
    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;
