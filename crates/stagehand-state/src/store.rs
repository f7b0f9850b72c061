//! StateStore: redb-backed persistence for flags, schedules, and stages.
//!
//! Reads run in their own read transaction. Writes that must land together
//! go through [`UnitOfWork`]. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::lock::{FlagGuard, FlagLocks};
use crate::tables::*;
use crate::types::*;
use crate::unit_of_work::UnitOfWork;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    locks: Arc<FlagLocks>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            locks: Arc::new(FlagLocks::default()),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Begin))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(FEATURE_FLAGS).map_err(map_err!(Table))?;
        txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        txn.open_table(STAGES).map_err(map_err!(Table))?;
        txn.open_table(STAGE_OWNERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Commit))?;
        Ok(())
    }

    /// Wait for exclusive access to one feature flag.
    ///
    /// Take the guard before [`StateStore::begin`] and keep it until the
    /// unit of work has committed.
    pub async fn lock_flag(&self, flag_id: &str) -> FlagGuard {
        self.locks.acquire(flag_id).await
    }

    /// Open a unit of work (one redb write transaction).
    ///
    /// Blocks while another unit of work is open.
    pub fn begin(&self) -> StateResult<UnitOfWork> {
        let txn = self.db.begin_write().map_err(map_err!(Begin))?;
        Ok(UnitOfWork::new(txn))
    }

    // ── Feature flags ──────────────────────────────────────────────

    /// Insert or update a feature flag outside of any unit of work.
    pub fn put_flag(&self, flag: &FeatureFlag) -> StateResult<()> {
        let mut uow = self.begin()?;
        uow.put_flag(flag)?;
        uow.commit()?;
        debug!(flag = %flag.id, key = %flag.key, "feature flag stored");
        Ok(())
    }

    /// Get a feature flag by id.
    pub fn get_flag(&self, flag_id: &str) -> StateResult<Option<FeatureFlag>> {
        let txn = self.db.begin_read().map_err(map_err!(Begin))?;
        let table = txn.open_table(FEATURE_FLAGS).map_err(map_err!(Table))?;
        read_json(&table, flag_id)
    }

    /// List all feature flags.
    pub fn list_flags(&self) -> StateResult<Vec<FeatureFlag>> {
        let txn = self.db.begin_read().map_err(map_err!(Begin))?;
        let table = txn.open_table(FEATURE_FLAGS).map_err(map_err!(Table))?;
        scan_prefix(&table, "")
    }

    /// Delete a feature flag. Returns true if it existed.
    pub fn delete_flag(&self, flag_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Begin))?;
        let existed;
        {
            let mut table = txn.open_table(FEATURE_FLAGS).map_err(map_err!(Table))?;
            existed = table.remove(flag_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Commit))?;
        debug!(flag = %flag_id, existed, "feature flag deleted");
        Ok(existed)
    }

    // ── Schedules ──────────────────────────────────────────────────

    /// Get a schedule by id.
    pub fn get_schedule(&self, schedule_id: &str) -> StateResult<Option<RolloutSchedule>> {
        let txn = self.db.begin_read().map_err(map_err!(Begin))?;
        let table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        read_json(&table, schedule_id)
    }

    /// List all schedules.
    pub fn list_schedules(&self) -> StateResult<Vec<RolloutSchedule>> {
        let txn = self.db.begin_read().map_err(map_err!(Begin))?;
        let table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        scan_prefix(&table, "")
    }

    /// List schedules currently in `status`.
    pub fn list_schedules_with_status(
        &self,
        status: ScheduleStatus,
    ) -> StateResult<Vec<RolloutSchedule>> {
        let mut schedules = self.list_schedules()?;
        schedules.retain(|s| s.status == status);
        Ok(schedules)
    }

    // ── Stages ─────────────────────────────────────────────────────

    /// Get a stage by its id.
    pub fn get_stage(&self, stage_id: &str) -> StateResult<Option<RolloutStage>> {
        let txn = self.db.begin_read().map_err(map_err!(Begin))?;
        let owners = txn.open_table(STAGE_OWNERS).map_err(map_err!(Table))?;
        let schedule_id = match owners.get(stage_id).map_err(map_err!(Read))? {
            Some(guard) => guard.value().to_string(),
            None => return Ok(None),
        };
        let table = txn.open_table(STAGES).map_err(map_err!(Table))?;
        read_json(&table, &stage_key(&schedule_id, stage_id))
    }

    /// List the stages of a schedule, ordered by `stage_order`.
    pub fn list_stages_for_schedule(&self, schedule_id: &str) -> StateResult<Vec<RolloutStage>> {
        let txn = self.db.begin_read().map_err(map_err!(Begin))?;
        let table = txn.open_table(STAGES).map_err(map_err!(Table))?;
        let mut stages: Vec<RolloutStage> = scan_prefix(&table, &format!("{schedule_id}:"))?;
        stages.sort_by_key(|s| s.stage_order);
        Ok(stages)
    }
}

// ── Row codec helpers ─────────────────────────────────────────────

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Encode))
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::CorruptRow {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Read and decode one JSON row.
pub(crate) fn read_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value: T = decode(key, guard.value())?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Decode every row whose key starts with `prefix` (empty prefix = all rows).
pub(crate) fn scan_prefix<T, R>(table: &R, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            let row: T = decode(key.value(), value.value())?;
            results.push(row);
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_row_reports_its_key() {
        let store = StateStore::open_in_memory().unwrap();
        let txn = store.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(FEATURE_FLAGS).unwrap();
            table.insert("broken", b"not json".as_slice()).unwrap();
        }
        txn.commit().unwrap();

        match store.get_flag("broken") {
            Err(StateError::CorruptRow { key, .. }) => assert_eq!(key, "broken"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("corrupt row decoded"),
        }
        assert!(matches!(
            store.list_flags(),
            Err(StateError::CorruptRow { .. })
        ));
    }

    fn test_flag(id: &str) -> FeatureFlag {
        FeatureFlag {
            id: id.to_string(),
            key: format!("{id}-key"),
            rollout_percentage: 0,
            updated_at: 1000,
        }
    }

    fn test_schedule(id: &str, status: ScheduleStatus) -> RolloutSchedule {
        RolloutSchedule {
            id: id.to_string(),
            name: format!("{id} rollout"),
            description: None,
            feature_flag_id: "flag-1".to_string(),
            owner_id: "owner-1".to_string(),
            status,
            start_date: None,
            end_date: None,
            max_percentage: 100,
            min_stage_duration: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_stage(schedule_id: &str, id: &str, order: u32) -> RolloutStage {
        RolloutStage {
            id: id.to_string(),
            rollout_schedule_id: schedule_id.to_string(),
            name: format!("stage {order}"),
            description: None,
            stage_order: order,
            target_percentage: (order + 1) * 25,
            status: StageStatus::Pending,
            trigger_type: TriggerType::TimeBased,
            trigger_configuration: TriggerConfiguration::new(),
            start_date: None,
            completed_date: None,
            activated_at: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn seed(store: &StateStore, schedule: &RolloutSchedule, stages: &[RolloutStage]) {
        let mut uow = store.begin().unwrap();
        uow.put_schedule(schedule).unwrap();
        for stage in stages {
            uow.put_stage(stage).unwrap();
        }
        uow.commit().unwrap();
    }

    // ── Flags ──────────────────────────────────────────────────────

    #[test]
    fn flag_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let flag = test_flag("flag-1");

        store.put_flag(&flag).unwrap();
        assert_eq!(store.get_flag("flag-1").unwrap(), Some(flag));
        assert!(store.get_flag("nope").unwrap().is_none());
    }

    #[test]
    fn flag_list_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_flag(&test_flag("flag-1")).unwrap();
        store.put_flag(&test_flag("flag-2")).unwrap();
        assert_eq!(store.list_flags().unwrap().len(), 2);

        assert!(store.delete_flag("flag-1").unwrap());
        assert!(!store.delete_flag("flag-1").unwrap());
        assert_eq!(store.list_flags().unwrap().len(), 1);
    }

    // ── Schedules and stages ───────────────────────────────────────

    #[test]
    fn schedule_round_trip_with_stages() {
        let store = StateStore::open_in_memory().unwrap();
        let schedule = test_schedule("sched-1", ScheduleStatus::Draft);
        // Insert out of order; listing must sort by stage_order.
        let stages = vec![
            test_stage("sched-1", "st-c", 2),
            test_stage("sched-1", "st-a", 0),
            test_stage("sched-1", "st-b", 1),
        ];
        seed(&store, &schedule, &stages);

        assert_eq!(store.get_schedule("sched-1").unwrap(), Some(schedule));
        let listed = store.list_stages_for_schedule("sched-1").unwrap();
        let ids: Vec<_> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["st-a", "st-b", "st-c"]);
    }

    #[test]
    fn stages_are_scoped_to_their_schedule() {
        let store = StateStore::open_in_memory().unwrap();
        seed(
            &store,
            &test_schedule("sched-1", ScheduleStatus::Draft),
            &[test_stage("sched-1", "st-a", 0)],
        );
        seed(
            &store,
            &test_schedule("sched-2", ScheduleStatus::Draft),
            &[test_stage("sched-2", "st-b", 0), test_stage("sched-2", "st-c", 1)],
        );

        assert_eq!(store.list_stages_for_schedule("sched-1").unwrap().len(), 1);
        assert_eq!(store.list_stages_for_schedule("sched-2").unwrap().len(), 2);
        assert!(store.list_stages_for_schedule("sched-3").unwrap().is_empty());
    }

    #[test]
    fn get_stage_by_id_uses_owner_index() {
        let store = StateStore::open_in_memory().unwrap();
        let stage = test_stage("sched-1", "st-a", 0);
        seed(&store, &test_schedule("sched-1", ScheduleStatus::Draft), &[stage.clone()]);

        assert_eq!(store.get_stage("st-a").unwrap(), Some(stage));
        assert!(store.get_stage("missing").unwrap().is_none());
    }

    #[test]
    fn list_schedules_filters_by_status() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store, &test_schedule("a", ScheduleStatus::Active), &[]);
        seed(&store, &test_schedule("b", ScheduleStatus::Paused), &[]);
        seed(&store, &test_schedule("c", ScheduleStatus::Active), &[]);

        assert_eq!(store.list_schedules().unwrap().len(), 3);
        let active = store
            .list_schedules_with_status(ScheduleStatus::Active)
            .unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|s| s.status == ScheduleStatus::Active));
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_flag(&test_flag("flag-1")).unwrap();
            seed(
                &store,
                &test_schedule("sched-1", ScheduleStatus::Active),
                &[test_stage("sched-1", "st-a", 0)],
            );
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_flag("flag-1").unwrap().is_some());
        assert_eq!(
            store.get_schedule("sched-1").unwrap().unwrap().status,
            ScheduleStatus::Active
        );
        assert_eq!(store.get_stage("st-a").unwrap().unwrap().stage_order, 0);
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_flags().unwrap().is_empty());
        assert!(store.list_schedules().unwrap().is_empty());
        assert!(store.get_schedule("any").unwrap().is_none());
        assert!(store.list_stages_for_schedule("any").unwrap().is_empty());
        assert!(!store.delete_flag("nope").unwrap());
    }

    #[test]
    fn stage_without_activation_timestamp_still_decodes() {
        // Rows written before `activated_at` existed carry no such field.
        let json = r#"{
            "id": "st-a", "rollout_schedule_id": "sched-1", "name": "canary",
            "description": null, "stage_order": 0, "target_percentage": 10,
            "status": "pending", "trigger_type": "manual",
            "start_date": null, "completed_date": null,
            "created_at": 1, "updated_at": 1
        }"#;
        let stage: RolloutStage = serde_json::from_str(json).unwrap();
        assert_eq!(stage.activated_at, None);
        assert!(stage.trigger_configuration.is_empty());
        assert_eq!(stage.trigger_type, TriggerType::Manual);
    }
}
