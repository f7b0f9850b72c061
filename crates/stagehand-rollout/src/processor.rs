//! Schedule processor: one pass over every active rollout schedule.
//!
//! Each schedule is handled in its own unit of work under its flag's lock,
//! so a failure in one schedule rolls back only that schedule and the pass
//! moves on to the next.

use stagehand_state::{ScheduleId, ScheduleStatus, StateStore};
use tracing::{debug, error, info};

use crate::error::{RolloutError, RolloutResult};
use crate::progression::{step_schedule, StepOutcome};

/// Summary of one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// Active schedules that were stepped.
    pub examined: usize,
    /// Active schedules skipped because their end date has passed.
    pub expired: usize,
    pub activated: usize,
    pub completed: usize,
    pub deferred: usize,
    pub schedules_completed: usize,
    /// Activations whose flag could not be updated.
    pub flag_failures: usize,
    /// Schedules whose step failed, with the error message.
    pub failed: Vec<(ScheduleId, String)>,
}

impl IterationReport {
    fn absorb(&mut self, outcome: &StepOutcome) {
        self.activated += outcome.activated.len();
        self.completed += outcome.completed.len();
        self.deferred += usize::from(outcome.deferred.is_some());
        self.schedules_completed += usize::from(outcome.schedule_completed);
        self.flag_failures += outcome.flag_failures.len();
    }
}

/// Drives active schedules forward based on their stage triggers.
#[derive(Clone)]
pub struct ScheduleProcessor {
    store: StateStore,
}

impl ScheduleProcessor {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Step every active, unexpired schedule once.
    ///
    /// Per-schedule failures are logged and collected in the report. Only a
    /// failure to list schedules at all is returned as an error.
    pub async fn run_iteration(&self, now: u64) -> RolloutResult<IterationReport> {
        let schedules = self
            .store
            .list_schedules_with_status(ScheduleStatus::Active)?;
        let mut report = IterationReport::default();

        for schedule in &schedules {
            if schedule.end_date.is_some_and(|end| end <= now) {
                debug!(schedule = %schedule.id, "schedule past its end date, skipping");
                report.expired += 1;
                continue;
            }

            report.examined += 1;
            match self.process_schedule(&schedule.id, now).await {
                Ok(outcome) => report.absorb(&outcome),
                Err(e) => {
                    error!(schedule = %schedule.id, error = %e, "failed to process rollout schedule");
                    report.failed.push((schedule.id.clone(), e.to_string()));
                }
            }
        }

        info!(
            examined = report.examined,
            activated = report.activated,
            completed = report.completed,
            deferred = report.deferred,
            schedules_completed = report.schedules_completed,
            failed = report.failed.len(),
            "rollout iteration finished"
        );
        Ok(report)
    }

    /// Step a single schedule in its own unit of work.
    pub async fn process_schedule(&self, schedule_id: &str, now: u64) -> RolloutResult<StepOutcome> {
        let flag_id = self
            .store
            .get_schedule(schedule_id)?
            .ok_or_else(|| RolloutError::not_found("schedule", schedule_id))?
            .feature_flag_id;

        let guard = self.store.lock_flag(&flag_id).await;
        let mut uow = self.store.begin()?;

        // Re-read under the lock: an operator may have paused or cancelled it.
        let mut schedule = uow
            .get_schedule(schedule_id)?
            .ok_or_else(|| RolloutError::not_found("schedule", schedule_id))?;
        if schedule.status != ScheduleStatus::Active {
            debug!(schedule = %schedule_id, status = %schedule.status, "schedule no longer active");
            uow.rollback()?;
            return Ok(StepOutcome::default());
        }

        let outcome = step_schedule(&mut uow, &guard, &mut schedule, now)?;
        if outcome.is_noop() {
            uow.rollback()?;
        } else {
            uow.commit()?;
        }
        Ok(outcome)
    }
}
