//! UnitOfWork: one redb write transaction spanning several row changes.
//!
//! Nothing written through a unit of work is visible to readers until
//! [`UnitOfWork::commit`]. Dropping it without committing discards every
//! change.

use redb::{ReadableTable, WriteTransaction};
use tracing::trace;

use crate::error::StateResult;
use crate::store::{encode, read_json, scan_prefix};
use crate::tables::*;
use crate::types::*;

/// An open write transaction over the rollout tables.
pub struct UnitOfWork {
    txn: WriteTransaction,
}

impl UnitOfWork {
    pub(crate) fn new(txn: WriteTransaction) -> Self {
        Self { txn }
    }

    /// Make every change visible atomically.
    pub fn commit(self) -> StateResult<()> {
        self.txn.commit().map_err(map_err!(Commit))?;
        trace!("unit of work committed");
        Ok(())
    }

    /// Discard every change made so far.
    pub fn rollback(self) -> StateResult<()> {
        self.txn.abort().map_err(map_err!(Commit))?;
        trace!("unit of work rolled back");
        Ok(())
    }

    // ── Feature flags ──────────────────────────────────────────────

    pub fn get_flag(&self, flag_id: &str) -> StateResult<Option<FeatureFlag>> {
        let table = self.txn.open_table(FEATURE_FLAGS).map_err(map_err!(Table))?;
        read_json(&table, flag_id)
    }

    pub fn put_flag(&mut self, flag: &FeatureFlag) -> StateResult<()> {
        let value = encode(flag)?;
        let mut table = self.txn.open_table(FEATURE_FLAGS).map_err(map_err!(Table))?;
        table
            .insert(flag.id.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    // ── Schedules ──────────────────────────────────────────────────

    pub fn get_schedule(&self, schedule_id: &str) -> StateResult<Option<RolloutSchedule>> {
        let table = self.txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        read_json(&table, schedule_id)
    }

    pub fn put_schedule(&mut self, schedule: &RolloutSchedule) -> StateResult<()> {
        let value = encode(schedule)?;
        let mut table = self.txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        table
            .insert(schedule.id.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    // ── Stages ─────────────────────────────────────────────────────

    /// Get a stage by id via the stage → schedule index.
    pub fn get_stage(&self, stage_id: &str) -> StateResult<Option<RolloutStage>> {
        let schedule_id = {
            let owners = self.txn.open_table(STAGE_OWNERS).map_err(map_err!(Table))?;
            match owners.get(stage_id).map_err(map_err!(Read))? {
                Some(guard) => guard.value().to_string(),
                None => return Ok(None),
            }
        };
        let table = self.txn.open_table(STAGES).map_err(map_err!(Table))?;
        read_json(&table, &stage_key(&schedule_id, stage_id))
    }

    /// Insert or update a stage and its index entry.
    pub fn put_stage(&mut self, stage: &RolloutStage) -> StateResult<()> {
        let key = stage.table_key();
        let value = encode(stage)?;
        {
            let mut table = self.txn.open_table(STAGES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        let mut owners = self.txn.open_table(STAGE_OWNERS).map_err(map_err!(Table))?;
        owners
            .insert(stage.id.as_str(), stage.rollout_schedule_id.as_str())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Remove a stage and its index entry. Returns true if it existed.
    pub fn delete_stage(&mut self, stage: &RolloutStage) -> StateResult<bool> {
        let existed = {
            let mut table = self.txn.open_table(STAGES).map_err(map_err!(Table))?;
            table
                .remove(stage.table_key().as_str())
                .map_err(map_err!(Write))?
                .is_some()
        };
        let mut owners = self.txn.open_table(STAGE_OWNERS).map_err(map_err!(Table))?;
        owners.remove(stage.id.as_str()).map_err(map_err!(Write))?;
        Ok(existed)
    }

    /// Stages of a schedule as seen by this transaction, ordered by `stage_order`.
    pub fn stages_for_schedule(&self, schedule_id: &str) -> StateResult<Vec<RolloutStage>> {
        let table = self.txn.open_table(STAGES).map_err(map_err!(Table))?;
        let mut stages: Vec<RolloutStage> = scan_prefix(&table, &format!("{schedule_id}:"))?;
        stages.sort_by_key(|s| s.stage_order);
        Ok(stages)
    }
}
