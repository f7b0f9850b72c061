//! Stage progression shared by the processor and operator actions.
//!
//! Every function here runs inside one [`UnitOfWork`] while the caller holds
//! the schedule flag's [`FlagGuard`]. Nothing is committed here.

use stagehand_state::{
    FlagGuard, RolloutSchedule, RolloutStage, ScheduleStatus, StageId, StageStatus, UnitOfWork,
};
use tracing::{info, warn};

use crate::error::RolloutResult;
use crate::lifecycle::{
    active_stage, first_pending, last_activation, next_pending_after, transition_schedule,
    transition_stage,
};
use crate::mutator::{activate_flag, FlagWrite};
use crate::trigger::{eligible_for_activation, eligible_for_completion};

const SECS_PER_HOUR: u64 = 3600;

/// What one progression step did to a schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    /// Stages moved to `InProgress`.
    pub activated: Vec<StageId>,
    /// Stages moved to `Completed`.
    pub completed: Vec<StageId>,
    /// Eligible stage held back by the schedule's minimum stage duration.
    pub deferred: Option<StageId>,
    /// The schedule itself reached `Completed`.
    pub schedule_completed: bool,
    /// Activated stages whose flag could not be updated.
    pub flag_failures: Vec<StageId>,
}

impl StepOutcome {
    pub fn is_noop(&self) -> bool {
        self == &Self::default()
    }
}

/// Advance one active schedule as far as its triggers allow at `now`.
pub(crate) fn step_schedule(
    uow: &mut UnitOfWork,
    guard: &FlagGuard,
    schedule: &mut RolloutSchedule,
    now: u64,
) -> RolloutResult<StepOutcome> {
    let mut stages = uow.stages_for_schedule(&schedule.id)?;
    let mut outcome = StepOutcome::default();

    let current = active_stage(&schedule.id, &stages)?.map(|s| s.id.clone());
    match current {
        None => {
            if let Some(next) = first_pending(&stages).map(|s| s.id.clone()) {
                activate_if_eligible(uow, guard, schedule, &mut stages, &next, now, &mut outcome)?;
            }
        }
        Some(current) => {
            let idx = index_of(&stages, &current);
            if eligible_for_completion(&stages[idx], now) {
                complete_stage(uow, &mut stages[idx], now, &mut outcome)?;
                continue_after(uow, guard, schedule, &mut stages, idx, now, &mut outcome)?;
            }
        }
    }
    Ok(outcome)
}

/// Activate a stage unconditionally: status, flag, and row write.
pub(crate) fn activate_stage(
    uow: &mut UnitOfWork,
    guard: &FlagGuard,
    schedule: &RolloutSchedule,
    stage: &mut RolloutStage,
    now: u64,
    outcome: &mut StepOutcome,
) -> RolloutResult<()> {
    transition_stage(stage, StageStatus::InProgress, now)?;
    let write = activate_flag(
        uow,
        guard,
        &schedule.feature_flag_id,
        stage.target_percentage,
        now,
    )?;
    // The stage advances even when the flag could not be written.
    uow.put_stage(stage)?;
    outcome.activated.push(stage.id.clone());

    match write {
        FlagWrite::Applied { previous } => info!(
            schedule = %schedule.id,
            stage = %stage.id,
            from = previous,
            to = stage.target_percentage,
            "stage activated"
        ),
        FlagWrite::Missing | FlagWrite::NotLocked => {
            warn!(
                schedule = %schedule.id,
                stage = %stage.id,
                flag = %schedule.feature_flag_id,
                outcome = ?write,
                "stage activated but feature flag was not updated"
            );
            outcome.flag_failures.push(stage.id.clone());
        }
    }
    Ok(())
}

/// Mark an in-progress stage completed.
pub(crate) fn complete_stage(
    uow: &mut UnitOfWork,
    stage: &mut RolloutStage,
    now: u64,
    outcome: &mut StepOutcome,
) -> RolloutResult<()> {
    transition_stage(stage, StageStatus::Completed, now)?;
    uow.put_stage(stage)?;
    outcome.completed.push(stage.id.clone());
    info!(schedule = %stage.rollout_schedule_id, stage = %stage.id, "stage completed");
    Ok(())
}

/// After `stages[completed_idx]` completed: start the next pending stage if
/// its trigger and the dwell time allow, or finish the schedule when no
/// pending stage remains.
pub(crate) fn continue_after(
    uow: &mut UnitOfWork,
    guard: &FlagGuard,
    schedule: &mut RolloutSchedule,
    stages: &mut [RolloutStage],
    completed_idx: usize,
    now: u64,
    outcome: &mut StepOutcome,
) -> RolloutResult<()> {
    let order = stages[completed_idx].stage_order;
    match next_pending_after(stages, order).map(|s| s.id.clone()) {
        Some(next) => activate_if_eligible(uow, guard, schedule, stages, &next, now, outcome),
        None => {
            let stage_count = stages.len();
            transition_schedule(schedule, ScheduleStatus::Completed, stage_count, now)?;
            uow.put_schedule(schedule)?;
            outcome.schedule_completed = true;
            info!(schedule = %schedule.id, "rollout schedule completed");
            Ok(())
        }
    }
}

/// Activate `stage_id` if its trigger fires and the schedule's minimum
/// stage duration has elapsed since the previous activation.
fn activate_if_eligible(
    uow: &mut UnitOfWork,
    guard: &FlagGuard,
    schedule: &RolloutSchedule,
    stages: &mut [RolloutStage],
    stage_id: &str,
    now: u64,
    outcome: &mut StepOutcome,
) -> RolloutResult<()> {
    let idx = index_of(stages, stage_id);
    if !eligible_for_activation(&stages[idx], now) {
        return Ok(());
    }
    if let Some(remaining) = dwell_remaining(schedule, stages, now) {
        info!(
            schedule = %schedule.id,
            stage = %stage_id,
            remaining_secs = remaining,
            "deferring stage activation until minimum stage duration elapses"
        );
        outcome.deferred = Some(stage_id.to_string());
        return Ok(());
    }
    activate_stage(uow, guard, schedule, &mut stages[idx], now, outcome)
}

/// Seconds left before the schedule's minimum stage duration allows another
/// activation, or `None` if activation may proceed.
pub fn dwell_remaining(schedule: &RolloutSchedule, stages: &[RolloutStage], now: u64) -> Option<u64> {
    let hours = schedule.min_stage_duration?;
    let last = last_activation(stages)?;
    let ready_at = last.saturating_add(u64::from(hours) * SECS_PER_HOUR);
    (now < ready_at).then(|| ready_at - now)
}

/// Position of a stage known to be in `stages`.
pub(crate) fn index_of(stages: &[RolloutStage], stage_id: &str) -> usize {
    stages
        .iter()
        .position(|s| s.id == stage_id)
        .unwrap_or_else(|| unreachable!("stage {stage_id} was taken from this list"))
}
