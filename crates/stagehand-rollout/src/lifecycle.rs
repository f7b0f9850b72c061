//! Schedule and stage state machine.
//!
//! ```text
//! Schedule:  Draft ──► Active ──► Completed
//!              │        │  ▲
//!              │        ▼  │
//!              │       Paused
//!              ▼        │
//!           Cancelled ◄─┘   (also from Active)
//!
//! Stage:     Pending ──► InProgress ──► Completed
//!                             └──────► Failed
//! ```
//!
//! Besides status edges this module owns the structural rules of a stage
//! plan: gap-free `stage_order` starting at 0, non-decreasing target
//! percentages, the schedule's `max_percentage` bound, and at most one
//! in-progress stage.

use stagehand_state::{RolloutSchedule, RolloutStage, ScheduleStatus, StageStatus};
use tracing::debug;

use crate::error::{RolloutError, RolloutResult};

/// Highest valid rollout percentage.
pub const FULL_ROLLOUT: u32 = 100;

// ── Schedule transitions ───────────────────────────────────────────

/// Whether `from -> to` is a legal schedule edge.
pub fn schedule_transition_allowed(from: ScheduleStatus, to: ScheduleStatus) -> bool {
    use ScheduleStatus::*;
    matches!(
        (from, to),
        (Draft, Active)
            | (Draft, Cancelled)
            | (Active, Paused)
            | (Active, Completed)
            | (Active, Cancelled)
            | (Paused, Active)
            | (Paused, Cancelled)
    )
}

/// Move a schedule to `to`, enforcing the legal edges.
///
/// Activation also requires at least one stage. On error the schedule is
/// left untouched.
pub fn transition_schedule(
    schedule: &mut RolloutSchedule,
    to: ScheduleStatus,
    stage_count: usize,
    now: u64,
) -> RolloutResult<()> {
    if !schedule_transition_allowed(schedule.status, to) {
        return Err(RolloutError::InvalidTransition {
            entity: "schedule",
            id: schedule.id.clone(),
            from: schedule.status.to_string(),
            to: to.to_string(),
        });
    }
    if to == ScheduleStatus::Active && stage_count == 0 {
        return Err(RolloutError::EmptySchedule(schedule.id.clone()));
    }
    debug!(schedule = %schedule.id, from = %schedule.status, %to, "schedule transition");
    schedule.status = to;
    schedule.updated_at = now;
    Ok(())
}

// ── Stage transitions ──────────────────────────────────────────────

/// Whether `from -> to` is a legal stage edge.
pub fn stage_transition_allowed(from: StageStatus, to: StageStatus) -> bool {
    use StageStatus::*;
    matches!(
        (from, to),
        (Pending, InProgress) | (InProgress, Completed) | (InProgress, Failed)
    )
}

/// Move a stage to `to` and stamp the matching timestamps.
pub fn transition_stage(stage: &mut RolloutStage, to: StageStatus, now: u64) -> RolloutResult<()> {
    if !stage_transition_allowed(stage.status, to) {
        return Err(RolloutError::InvalidTransition {
            entity: "stage",
            id: stage.id.clone(),
            from: stage.status.to_string(),
            to: to.to_string(),
        });
    }
    match to {
        StageStatus::InProgress => stage.activated_at = Some(now),
        StageStatus::Completed => stage.completed_date = Some(now),
        StageStatus::Pending | StageStatus::Failed => {}
    }
    stage.status = to;
    stage.updated_at = now;
    Ok(())
}

// ── Plan structure ─────────────────────────────────────────────────

/// Check the structural invariants of a schedule's stages.
///
/// `stages` must be sorted by `stage_order`.
pub fn validate_plan(stages: &[RolloutStage], max_percentage: u32) -> RolloutResult<()> {
    if max_percentage > FULL_ROLLOUT {
        return Err(RolloutError::Validation(format!(
            "max_percentage {max_percentage} exceeds {FULL_ROLLOUT}"
        )));
    }

    let mut previous: Option<&RolloutStage> = None;
    for (position, stage) in stages.iter().enumerate() {
        if stage.stage_order as usize != position {
            return Err(RolloutError::OrderingViolation(format!(
                "stage '{}' has order {} but position {position}; orders must be sequential from 0",
                stage.name, stage.stage_order
            )));
        }
        if stage.target_percentage > FULL_ROLLOUT {
            return Err(RolloutError::Validation(format!(
                "stage '{}' targets {}%, above {FULL_ROLLOUT}%",
                stage.name, stage.target_percentage
            )));
        }
        if stage.target_percentage > max_percentage {
            return Err(RolloutError::OrderingViolation(format!(
                "stage '{}' targets {}%, above the schedule maximum of {max_percentage}%",
                stage.name, stage.target_percentage
            )));
        }
        if let Some(prev) = previous
            && stage.target_percentage < prev.target_percentage
        {
            return Err(RolloutError::OrderingViolation(format!(
                "stage '{}' targets {}%, below the preceding stage '{}' at {}%",
                stage.name, stage.target_percentage, prev.name, prev.target_percentage
            )));
        }
        previous = Some(stage);
    }
    Ok(())
}

/// The single in-progress stage of a schedule, if any.
///
/// More than one in-progress stage means the stored schedule is corrupt.
pub fn active_stage<'a>(
    schedule_id: &str,
    stages: &'a [RolloutStage],
) -> RolloutResult<Option<&'a RolloutStage>> {
    let mut in_progress = stages.iter().filter(|s| s.status == StageStatus::InProgress);
    let first = in_progress.next();
    if let Some(second) = in_progress.next() {
        return Err(RolloutError::CorruptSchedule {
            id: schedule_id.to_string(),
            reason: format!(
                "stages {} and {} are both in progress",
                first.map(|s| s.id.as_str()).unwrap_or_default(),
                second.id
            ),
        });
    }
    Ok(first)
}

/// Lowest-order pending stage.
pub fn first_pending(stages: &[RolloutStage]) -> Option<&RolloutStage> {
    stages
        .iter()
        .filter(|s| s.status == StageStatus::Pending)
        .min_by_key(|s| s.stage_order)
}

/// Lowest-order pending stage strictly after `order`.
pub fn next_pending_after(stages: &[RolloutStage], order: u32) -> Option<&RolloutStage> {
    stages
        .iter()
        .filter(|s| s.status == StageStatus::Pending && s.stage_order > order)
        .min_by_key(|s| s.stage_order)
}

/// Most recent activation instant across a schedule's stages.
pub fn last_activation(stages: &[RolloutStage]) -> Option<u64> {
    stages.iter().filter_map(|s| s.activated_at).max()
}

/// Reassign `stage_order` to match each stage's position.
///
/// Returns the ids of stages whose order changed.
pub fn renumber(stages: &mut [RolloutStage]) -> Vec<String> {
    let mut changed = Vec::new();
    for (position, stage) in stages.iter_mut().enumerate() {
        let order = position as u32;
        if stage.stage_order != order {
            stage.stage_order = order;
            changed.push(stage.id.clone());
        }
    }
    changed
}

/// Move one stage to `new_order`, shifting the stages in between.
///
/// `stages` must be sorted by `stage_order`. Only pending stages may move,
/// and a move may not jump over a stage that has already started. Returns
/// the ids of stages whose order changed.
pub fn reorder_stage(
    stages: &mut Vec<RolloutStage>,
    stage_id: &str,
    new_order: u32,
) -> RolloutResult<Vec<String>> {
    let from = stages
        .iter()
        .position(|s| s.id == stage_id)
        .ok_or_else(|| RolloutError::not_found("stage", stage_id))?;
    let stage = &stages[from];
    if stage.status != StageStatus::Pending {
        return Err(RolloutError::InvalidTransition {
            entity: "stage",
            id: stage.id.clone(),
            from: stage.status.to_string(),
            to: "reordered".to_string(),
        });
    }
    let to = new_order as usize;
    if to >= stages.len() {
        return Err(RolloutError::OrderingViolation(format!(
            "order {new_order} is out of range for {} stages",
            stages.len()
        )));
    }
    let (lo, hi) = if from < to { (from, to) } else { (to, from) };
    if let Some(started) = stages[lo..=hi]
        .iter()
        .find(|s| s.id != stage_id && s.status != StageStatus::Pending)
    {
        return Err(RolloutError::OrderingViolation(format!(
            "cannot move stage across '{}' which is already {}",
            started.name, started.status
        )));
    }

    let moving = stages.remove(from);
    stages.insert(to, moving);
    Ok(renumber(stages))
}
