//! Rollout service: operator actions on schedules and stages.
//!
//! Every mutation follows the same discipline as the processor: take the
//! schedule flag's lock, open one unit of work, re-read the schedule inside
//! it, apply the change, commit. A failed check drops the unit of work and
//! nothing is written.

use std::sync::Arc;

use serde::Serialize;
use stagehand_state::{
    FeatureFlag, FlagGuard, RolloutSchedule, RolloutStage, ScheduleId, ScheduleStatus,
    StageStatus, StateStore, TriggerType, UnitOfWork,
};
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{RolloutError, RolloutResult};
use crate::lifecycle::{
    active_stage, first_pending, renumber, reorder_stage, transition_schedule, validate_plan,
};
use crate::plan::{NewSchedule, NewStage, StageUpdate};
use crate::progression::{activate_stage, complete_stage, continue_after, index_of, StepOutcome};

/// A schedule with its stages and the flag it drives.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleOverview {
    pub schedule: RolloutSchedule,
    pub stages: Vec<RolloutStage>,
    /// `None` if the flag has been deleted.
    pub flag: Option<FeatureFlag>,
}

/// Operator-facing entry point to the rollout engine.
#[derive(Clone)]
pub struct RolloutService {
    store: StateStore,
    clock: Arc<dyn Clock>,
}

impl RolloutService {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Schedules ───────────────────────────────────────────────────

    /// Create a draft schedule with its stages.
    pub fn create_schedule(&self, plan: NewSchedule, owner_id: &str) -> RolloutResult<RolloutSchedule> {
        require_name("schedule", &plan.name)?;
        if let (Some(start), Some(end)) = (plan.start_date, plan.end_date)
            && end <= start
        {
            return Err(RolloutError::Validation(format!(
                "end_date {end} must be after start_date {start}"
            )));
        }
        if plan.stages.is_empty() {
            return Err(RolloutError::Validation(
                "a schedule needs at least one stage".to_string(),
            ));
        }

        let mut uow = self.store.begin()?;
        if uow.get_flag(&plan.feature_flag_id)?.is_none() {
            return Err(RolloutError::not_found("feature flag", &plan.feature_flag_id));
        }

        let now = self.clock.now();
        let schedule = RolloutSchedule {
            id: new_id(),
            name: plan.name,
            description: plan.description,
            feature_flag_id: plan.feature_flag_id,
            owner_id: owner_id.to_string(),
            status: ScheduleStatus::Draft,
            start_date: plan.start_date,
            end_date: plan.end_date,
            max_percentage: plan.max_percentage,
            min_stage_duration: plan.min_stage_duration,
            created_at: now,
            updated_at: now,
        };
        let stages = build_stages(&schedule.id, plan.stages, now)?;
        validate_plan(&stages, schedule.max_percentage)?;

        uow.put_schedule(&schedule)?;
        for stage in &stages {
            uow.put_stage(stage)?;
        }
        uow.commit()?;

        info!(
            schedule = %schedule.id,
            flag = %schedule.feature_flag_id,
            stages = stages.len(),
            "rollout schedule created"
        );
        Ok(schedule)
    }

    /// Start a draft schedule or resume a paused one.
    pub async fn activate_schedule(&self, schedule_id: &str) -> RolloutResult<RolloutSchedule> {
        self.with_schedule(schedule_id, |uow, _guard, mut schedule, now| {
            let stages = uow.stages_for_schedule(&schedule.id)?;
            transition_schedule(&mut schedule, ScheduleStatus::Active, stages.len(), now)?;
            validate_plan(&stages, schedule.max_percentage)?;
            uow.put_schedule(&schedule)?;
            Ok(schedule)
        })
        .await
        .inspect(|s| info!(schedule = %s.id, "rollout schedule activated"))
    }

    /// Stop driving an active schedule. Its in-progress stage stays in progress.
    pub async fn pause_schedule(&self, schedule_id: &str) -> RolloutResult<RolloutSchedule> {
        self.move_schedule(schedule_id, ScheduleStatus::Paused).await
    }

    /// Abandon a schedule for good. The flag keeps its current percentage.
    pub async fn cancel_schedule(&self, schedule_id: &str) -> RolloutResult<RolloutSchedule> {
        self.move_schedule(schedule_id, ScheduleStatus::Cancelled).await
    }

    async fn move_schedule(&self, schedule_id: &str, to: ScheduleStatus) -> RolloutResult<RolloutSchedule> {
        self.with_schedule(schedule_id, |uow, _guard, mut schedule, now| {
            let stage_count = uow.stages_for_schedule(&schedule.id)?.len();
            transition_schedule(&mut schedule, to, stage_count, now)?;
            uow.put_schedule(&schedule)?;
            Ok(schedule)
        })
        .await
        .inspect(|s| info!(schedule = %s.id, status = %s.status, "rollout schedule status changed"))
    }

    pub fn get_schedule(&self, schedule_id: &str) -> RolloutResult<RolloutSchedule> {
        self.store
            .get_schedule(schedule_id)?
            .ok_or_else(|| RolloutError::not_found("schedule", schedule_id))
    }

    /// All schedules, or only those with `status`.
    pub fn list_schedules(&self, status: Option<ScheduleStatus>) -> RolloutResult<Vec<RolloutSchedule>> {
        Ok(match status {
            Some(status) => self.store.list_schedules_with_status(status)?,
            None => self.store.list_schedules()?,
        })
    }

    /// Stages of a schedule in order.
    pub fn stages(&self, schedule_id: &str) -> RolloutResult<Vec<RolloutStage>> {
        self.get_schedule(schedule_id)?;
        Ok(self.store.list_stages_for_schedule(schedule_id)?)
    }

    pub fn overview(&self, schedule_id: &str) -> RolloutResult<ScheduleOverview> {
        let schedule = self.get_schedule(schedule_id)?;
        let stages = self.store.list_stages_for_schedule(schedule_id)?;
        let flag = self.store.get_flag(&schedule.feature_flag_id)?;
        Ok(ScheduleOverview {
            schedule,
            stages,
            flag,
        })
    }

    // ── Stages ──────────────────────────────────────────────────────

    /// Insert a stage. Later stages shift down by one.
    ///
    /// The stage may not be placed before a stage that has already started.
    pub async fn add_stage(&self, schedule_id: &str, new: NewStage) -> RolloutResult<RolloutStage> {
        self.with_schedule(schedule_id, |uow, _guard, mut schedule, now| {
            reject_if_terminal(&schedule, "stage added")?;
            let mut stages = uow.stages_for_schedule(&schedule.id)?;

            let position = new.stage_order.map_or(stages.len(), |o| o as usize);
            if position > stages.len() {
                return Err(RolloutError::OrderingViolation(format!(
                    "order {position} is out of range for {} stages",
                    stages.len()
                )));
            }
            if let Some(started) = stages[position..]
                .iter()
                .find(|s| s.status != StageStatus::Pending)
            {
                return Err(RolloutError::OrderingViolation(format!(
                    "cannot insert before stage '{}' which is already {}",
                    started.name, started.status
                )));
            }

            let stage = stage_row(&schedule.id, new, position as u32, now)?;
            let stage_id = stage.id.clone();
            stages.insert(position, stage);
            let mut changed = renumber(&mut stages);
            changed.push(stage_id.clone());
            validate_plan(&stages, schedule.max_percentage)?;

            write_changed(uow, &mut stages, &changed, now)?;
            schedule.updated_at = now;
            uow.put_schedule(&schedule)?;
            Ok(stages.swap_remove(index_of(&stages, &stage_id)))
        })
        .await
        .inspect(|s| info!(schedule = %s.rollout_schedule_id, stage = %s.id, order = s.stage_order, "stage added"))
    }

    /// Edit a pending stage, including moving it to another position.
    pub async fn update_stage(&self, stage_id: &str, update: StageUpdate) -> RolloutResult<RolloutStage> {
        let schedule_id = self.schedule_of(stage_id)?;
        self.with_schedule(&schedule_id, |uow, _guard, mut schedule, now| {
            reject_if_terminal(&schedule, "stage updated")?;
            let mut stages = uow.stages_for_schedule(&schedule.id)?;
            let idx = position_of(&stages, stage_id)?;
            reject_unless_pending(&stages[idx], "updated")?;

            let stage = &mut stages[idx];
            if let Some(name) = update.name {
                require_name("stage", &name)?;
                stage.name = name;
            }
            if let Some(description) = update.description {
                stage.description = description;
            }
            if let Some(pct) = update.target_percentage {
                stage.target_percentage = pct;
            }
            if let Some(trigger) = update.trigger_type {
                stage.trigger_type = trigger;
            }
            if let Some(config) = update.trigger_configuration {
                stage.trigger_configuration = config;
            }
            if let Some(start) = update.start_date {
                stage.start_date = start;
            }

            let mut changed = vec![stage_id.to_string()];
            if let Some(order) = update.stage_order
                && order != stages[idx].stage_order
            {
                changed.extend(reorder_stage(&mut stages, stage_id, order)?);
            }
            validate_plan(&stages, schedule.max_percentage)?;

            write_changed(uow, &mut stages, &changed, now)?;
            schedule.updated_at = now;
            uow.put_schedule(&schedule)?;
            Ok(stages.swap_remove(index_of(&stages, stage_id)))
        })
        .await
        .inspect(|s| info!(stage = %s.id, "stage updated"))
    }

    /// Remove a pending stage from a schedule that is not active.
    pub async fn delete_stage(&self, stage_id: &str) -> RolloutResult<()> {
        let schedule_id = self.schedule_of(stage_id)?;
        self.with_schedule(&schedule_id, |uow, _guard, mut schedule, now| {
            let mut stages = uow.stages_for_schedule(&schedule.id)?;
            let idx = position_of(&stages, stage_id)?;
            reject_unless_pending(&stages[idx], "deleted")?;
            if schedule.status == ScheduleStatus::Active {
                return Err(RolloutError::InvalidTransition {
                    entity: "schedule",
                    id: schedule.id.clone(),
                    from: schedule.status.to_string(),
                    to: "stage deleted".to_string(),
                });
            }

            let removed = stages.remove(idx);
            uow.delete_stage(&removed)?;
            let changed = renumber(&mut stages);
            write_changed(uow, &mut stages, &changed, now)?;
            schedule.updated_at = now;
            uow.put_schedule(&schedule)?;
            Ok(())
        })
        .await
        .inspect(|()| info!(schedule = %schedule_id, stage = %stage_id, "stage deleted"))
    }

    /// Move a manual stage one step: pending to in progress, or in progress
    /// to completed.
    ///
    /// Completing a stage starts the next pending stage when its trigger
    /// allows, or completes the schedule after the last stage. If a stage
    /// was activated but the flag could not be written, the change is still
    /// committed and `FlagUpdateFailed` is returned.
    pub async fn manually_advance_stage(&self, stage_id: &str) -> RolloutResult<RolloutStage> {
        let schedule_id = self.schedule_of(stage_id)?;
        let (stage, outcome, flag_id) =
            self.with_schedule(&schedule_id, |uow, guard, mut schedule, now| {
                let mut stages = uow.stages_for_schedule(&schedule.id)?;
                let idx = position_of(&stages, stage_id)?;
                let trigger = stages[idx].trigger_type;
                if trigger != TriggerType::Manual {
                    return Err(RolloutError::ManualAdvanceRejected {
                        stage_id: stage_id.to_string(),
                        trigger,
                    });
                }
                reject_unless_active(&schedule, "stage advanced")?;

                let mut outcome = StepOutcome::default();
                match stages[idx].status {
                    StageStatus::Pending => {
                        if let Some(current) = active_stage(&schedule.id, &stages)? {
                            return Err(RolloutError::OrderingViolation(format!(
                                "stage '{}' is still in progress",
                                current.name
                            )));
                        }
                        if let Some(first) = first_pending(&stages)
                            && first.id != stage_id
                        {
                            return Err(RolloutError::OrderingViolation(format!(
                                "stage '{}' must be advanced first",
                                first.name
                            )));
                        }
                        activate_stage(uow, guard, &schedule, &mut stages[idx], now, &mut outcome)?;
                    }
                    StageStatus::InProgress => {
                        complete_stage(uow, &mut stages[idx], now, &mut outcome)?;
                        continue_after(uow, guard, &mut schedule, &mut stages, idx, now, &mut outcome)?;
                    }
                    StageStatus::Completed | StageStatus::Failed => {
                        return Err(RolloutError::InvalidTransition {
                            entity: "stage",
                            id: stage_id.to_string(),
                            from: stages[idx].status.to_string(),
                            to: "advanced".to_string(),
                        });
                    }
                }
                let flag_id = schedule.feature_flag_id.clone();
                Ok((stages.swap_remove(idx), outcome, flag_id))
            })
            .await?;

        info!(
            stage = %stage.id,
            status = %stage.status,
            schedule_completed = outcome.schedule_completed,
            "stage advanced manually"
        );
        if let Some(failed) = outcome.flag_failures.into_iter().next() {
            return Err(RolloutError::FlagUpdateFailed {
                flag_id,
                stage_id: failed,
            });
        }
        Ok(stage)
    }

    // ── Plumbing ────────────────────────────────────────────────────

    fn schedule_of(&self, stage_id: &str) -> RolloutResult<ScheduleId> {
        self.store
            .get_stage(stage_id)?
            .map(|s| s.rollout_schedule_id)
            .ok_or_else(|| RolloutError::not_found("stage", stage_id))
    }

    /// Run `f` on a fresh copy of the schedule, under its flag lock, in one
    /// unit of work. Commits only if `f` succeeds.
    async fn with_schedule<T>(
        &self,
        schedule_id: &str,
        f: impl FnOnce(&mut UnitOfWork, &FlagGuard, RolloutSchedule, u64) -> RolloutResult<T>,
    ) -> RolloutResult<T> {
        let flag_id = self.get_schedule(schedule_id)?.feature_flag_id;
        let guard = self.store.lock_flag(&flag_id).await;

        let mut uow = self.store.begin()?;
        let schedule = uow
            .get_schedule(schedule_id)?
            .ok_or_else(|| RolloutError::not_found("schedule", schedule_id))?;
        let value = f(&mut uow, &guard, schedule, self.clock.now())?;
        uow.commit()?;
        Ok(value)
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn require_name(kind: &str, name: &str) -> RolloutResult<()> {
    if name.trim().is_empty() {
        return Err(RolloutError::Validation(format!("{kind} name must not be empty")));
    }
    Ok(())
}

fn reject_if_terminal(schedule: &RolloutSchedule, action: &str) -> RolloutResult<()> {
    if schedule.status.is_terminal() {
        return Err(RolloutError::InvalidTransition {
            entity: "schedule",
            id: schedule.id.clone(),
            from: schedule.status.to_string(),
            to: action.to_string(),
        });
    }
    Ok(())
}

fn reject_unless_active(schedule: &RolloutSchedule, action: &str) -> RolloutResult<()> {
    if schedule.status != ScheduleStatus::Active {
        return Err(RolloutError::InvalidTransition {
            entity: "schedule",
            id: schedule.id.clone(),
            from: schedule.status.to_string(),
            to: action.to_string(),
        });
    }
    Ok(())
}

fn reject_unless_pending(stage: &RolloutStage, action: &str) -> RolloutResult<()> {
    if stage.status != StageStatus::Pending {
        return Err(RolloutError::InvalidTransition {
            entity: "stage",
            id: stage.id.clone(),
            from: stage.status.to_string(),
            to: action.to_string(),
        });
    }
    Ok(())
}

fn position_of(stages: &[RolloutStage], stage_id: &str) -> RolloutResult<usize> {
    stages
        .iter()
        .position(|s| s.id == stage_id)
        .ok_or_else(|| RolloutError::not_found("stage", stage_id))
}

/// Stamp and write every stage whose id is in `changed`.
fn write_changed(
    uow: &mut UnitOfWork,
    stages: &mut [RolloutStage],
    changed: &[String],
    now: u64,
) -> RolloutResult<()> {
    for stage in stages.iter_mut().filter(|s| changed.contains(&s.id)) {
        stage.updated_at = now;
        uow.put_stage(stage)?;
    }
    Ok(())
}

fn stage_row(schedule_id: &str, new: NewStage, order: u32, now: u64) -> RolloutResult<RolloutStage> {
    require_name("stage", &new.name)?;
    Ok(RolloutStage {
        id: new_id(),
        rollout_schedule_id: schedule_id.to_string(),
        name: new.name,
        description: new.description,
        stage_order: order,
        target_percentage: new.target_percentage,
        status: StageStatus::Pending,
        trigger_type: new.trigger_type,
        trigger_configuration: new.trigger_configuration,
        start_date: new.start_date,
        completed_date: None,
        activated_at: None,
        created_at: now,
        updated_at: now,
    })
}

/// Rows for a new schedule's stages, sorted by order.
///
/// Orders are either given for every stage or for none; without them the
/// plan position is the order.
fn build_stages(schedule_id: &str, stages: Vec<NewStage>, now: u64) -> RolloutResult<Vec<RolloutStage>> {
    let explicit = stages.iter().filter(|s| s.stage_order.is_some()).count();
    if explicit != 0 && explicit != stages.len() {
        return Err(RolloutError::OrderingViolation(
            "either every stage sets stage_order or none does".to_string(),
        ));
    }

    let mut rows = stages
        .into_iter()
        .enumerate()
        .map(|(position, new)| {
            let order = new.stage_order.unwrap_or(position as u32);
            stage_row(schedule_id, new, order, now)
        })
        .collect::<RolloutResult<Vec<_>>>()?;
    rows.sort_by_key(|s| s.stage_order);
    Ok(rows)
}
