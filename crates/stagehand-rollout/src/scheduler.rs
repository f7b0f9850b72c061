//! Rollout scheduler: background loop that runs the processor on an interval.
//!
//! One loop per scheduler. `start` is a no-op while a loop is running and
//! `stop` signals the loop, waits up to the grace period for the current
//! iteration to finish, then aborts it. Aborting is safe: each schedule is
//! stepped in its own transaction, so an interrupted iteration rolls back
//! at most the schedule it was working on.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{RolloutError, RolloutResult};
use crate::processor::{IterationReport, ScheduleProcessor};

/// Timing of the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Pause between successful iterations.
    pub interval: Duration,
    /// Pause after an iteration failed as a whole. Shorter than `interval`.
    pub error_backoff: Duration,
    /// How long `stop` waits before aborting the loop.
    pub stop_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            error_backoff: Duration::from_secs(60),
            stop_grace: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn with_interval_minutes(mut self, minutes: u64) -> Self {
        self.interval = Duration::from_secs(minutes.saturating_mul(60));
        self
    }

    /// Check that the loop neither spins nor retries slower than it polls.
    pub fn validate(&self) -> RolloutResult<()> {
        if self.interval.is_zero() {
            return Err(RolloutError::Validation(
                "scheduler interval must be greater than zero".to_string(),
            ));
        }
        if self.error_backoff.is_zero() {
            return Err(RolloutError::Validation(
                "scheduler error backoff must be greater than zero".to_string(),
            ));
        }
        if self.error_backoff >= self.interval {
            return Err(RolloutError::Validation(format!(
                "scheduler error backoff ({}s) must be shorter than the interval ({}s)",
                self.error_backoff.as_secs(),
                self.interval.as_secs()
            )));
        }
        Ok(())
    }
}

/// One pass of the scheduler loop.
pub trait RolloutPass: Send + Sync + 'static {
    fn run_pass(&self, now: u64) -> impl Future<Output = RolloutResult<IterationReport>> + Send;
}

impl RolloutPass for ScheduleProcessor {
    fn run_pass(&self, now: u64) -> impl Future<Output = RolloutResult<IterationReport>> + Send {
        self.run_iteration(now)
    }
}

/// A running loop: its task and the signal that stops it.
struct LoopSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns the background loop that drives rollout schedules.
pub struct RolloutScheduler<P = ScheduleProcessor> {
    processor: Arc<P>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    slot: Mutex<Option<LoopSlot>>,
}

impl<P: RolloutPass> RolloutScheduler<P> {
    pub fn new(processor: P, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            processor: Arc::new(processor),
            clock,
            config,
            slot: Mutex::new(None),
        }
    }

    /// Spawn the loop. The first iteration runs immediately.
    pub async fn start(&self) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            warn!("rollout scheduler already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_scheduler_loop(
            self.processor.clone(),
            self.clock.clone(),
            self.config,
            shutdown_rx,
        ));
        *slot = Some(LoopSlot {
            handle,
            shutdown_tx,
        });

        info!(
            interval_secs = self.config.interval.as_secs(),
            "rollout scheduler started"
        );
    }

    /// Signal the loop and wait for it to exit.
    ///
    /// The slot is released before waiting, so `is_running` and `start`
    /// do not block on the grace period.
    pub async fn stop(&self) {
        let taken = self.slot.lock().await.take();
        let Some(LoopSlot {
            mut handle,
            shutdown_tx,
        }) = taken
        else {
            debug!("rollout scheduler not running");
            return;
        };

        let _ = shutdown_tx.send(true);
        match tokio::time::timeout(self.config.stop_grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => error!(error = %e, "rollout scheduler task failed"),
            Err(_) => {
                warn!(
                    grace_secs = self.config.stop_grace.as_secs(),
                    "rollout scheduler did not stop in time, aborting"
                );
                handle.abort();
                let _ = handle.await;
            }
        }
        info!("rollout scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_scheduler_loop<P: RolloutPass>(
    processor: Arc<P>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        // The iteration runs in its own task so a panic is reported here
        // instead of ending the loop. If this loop is aborted, so is it.
        let now = clock.now();
        let worker = processor.clone();
        let mut iteration = AbortOnDrop(tokio::spawn(async move { worker.run_pass(now).await }));

        let pause = match (&mut iteration.0).await {
            Ok(Ok(report)) => {
                if !report.failed.is_empty() {
                    warn!(
                        failed = report.failed.len(),
                        "rollout iteration finished with failed schedules"
                    );
                }
                config.interval
            }
            Ok(Err(e)) => {
                error!(error = %e, "rollout iteration failed");
                config.error_backoff
            }
            Err(e) if e.is_panic() => {
                error!(error = %e, "rollout iteration panicked");
                config.error_backoff
            }
            Err(_) => break,
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = shutdown.changed() => {
                debug!("rollout scheduler loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use stagehand_state::{
        FeatureFlag, RolloutSchedule, RolloutStage, ScheduleStatus, StageStatus, StateStore,
        TriggerConfiguration, TriggerType,
    };

    const T0: u64 = 1_700_000_000;

    fn fast() -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(5),
            stop_grace: Duration::from_secs(1),
        }
    }

    fn seed(store: &StateStore) {
        store
            .put_flag(&FeatureFlag {
                id: "f1".to_string(),
                key: "checkout".to_string(),
                rollout_percentage: 0,
                updated_at: 0,
            })
            .unwrap();
        let mut uow = store.begin().unwrap();
        uow.put_schedule(&RolloutSchedule {
            id: "s1".to_string(),
            name: "checkout".to_string(),
            description: None,
            feature_flag_id: "f1".to_string(),
            owner_id: "owner".to_string(),
            status: ScheduleStatus::Active,
            start_date: None,
            end_date: None,
            max_percentage: 100,
            min_stage_duration: None,
            created_at: T0,
            updated_at: T0,
        })
        .unwrap();
        uow.put_stage(&RolloutStage {
            id: "a".to_string(),
            rollout_schedule_id: "s1".to_string(),
            name: "canary".to_string(),
            description: None,
            stage_order: 0,
            target_percentage: 10,
            status: StageStatus::Pending,
            trigger_type: TriggerType::TimeBased,
            trigger_configuration: TriggerConfiguration::new(),
            start_date: None,
            completed_date: None,
            activated_at: None,
            created_at: T0,
            updated_at: T0,
        })
        .unwrap();
        uow.commit().unwrap();
    }

    fn scheduler(store: &StateStore, config: SchedulerConfig) -> RolloutScheduler {
        RolloutScheduler::new(
            ScheduleProcessor::new(store.clone()),
            Arc::new(ManualClock::new(T0)),
            config,
        )
    }

    #[tokio::test]
    async fn loop_processes_schedules_until_stopped() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store);
        let sched = scheduler(&store, fast());

        sched.start().await;
        assert!(sched.is_running().await);

        let mut activated = false;
        for _ in 0..100 {
            if store.get_flag("f1").unwrap().unwrap().rollout_percentage == 10 {
                activated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(activated, "first iteration should activate the canary stage");

        sched.stop().await;
        assert!(!sched.is_running().await);
    }

    #[tokio::test]
    async fn start_twice_keeps_one_loop() {
        let store = StateStore::open_in_memory().unwrap();
        let sched = scheduler(&store, fast());

        sched.start().await;
        sched.start().await;
        assert!(sched.is_running().await);

        sched.stop().await;
        assert!(!sched.is_running().await);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let store = StateStore::open_in_memory().unwrap();
        let sched = scheduler(&store, fast());
        sched.stop().await;
        assert!(!sched.is_running().await);
    }

    #[tokio::test]
    async fn stop_interrupts_a_long_sleep() {
        let store = StateStore::open_in_memory().unwrap();
        let config = SchedulerConfig {
            interval: Duration::from_secs(3600),
            ..fast()
        };
        let sched = scheduler(&store, config);

        sched.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stopped = tokio::time::timeout(Duration::from_millis(500), sched.stop()).await;
        assert!(stopped.is_ok(), "stop must not wait for the interval");
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let store = StateStore::open_in_memory().unwrap();
        let sched = scheduler(&store, fast());

        sched.start().await;
        sched.stop().await;
        sched.start().await;
        assert!(sched.is_running().await);
        sched.stop().await;
    }

    /// Fails its first pass, panics on the second, then succeeds.
    struct FlakyPass {
        calls: Arc<AtomicUsize>,
        succeeded_at: Arc<std::sync::Mutex<Vec<Instant>>>,
    }

    impl RolloutPass for FlakyPass {
        fn run_pass(&self, _now: u64) -> impl Future<Output = RolloutResult<IterationReport>> + Send {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= 2 {
                self.succeeded_at.lock().unwrap().push(Instant::now());
            }
            async move {
                match call {
                    0 => Err(RolloutError::Validation("store unavailable".to_string())),
                    1 => panic!("iteration blew up"),
                    _ => Ok(IterationReport::default()),
                }
            }
        }
    }

    #[tokio::test]
    async fn loop_backs_off_after_error_and_panic() {
        let calls = Arc::new(AtomicUsize::new(0));
        let succeeded_at = Arc::new(std::sync::Mutex::new(Vec::new()));
        let config = SchedulerConfig {
            interval: Duration::from_secs(3600),
            error_backoff: Duration::from_millis(50),
            stop_grace: Duration::from_secs(1),
        };
        let sched = RolloutScheduler::new(
            FlakyPass {
                calls: calls.clone(),
                succeeded_at: succeeded_at.clone(),
            },
            Arc::new(ManualClock::new(T0)),
            config,
        );

        let started = Instant::now();
        sched.start().await;
        for _ in 0..200 {
            if !succeeded_at.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let first_success = succeeded_at.lock().unwrap().first().copied();
        let first_success = first_success.expect("loop should recover after a failed and a panicked pass");
        let waited = first_success - started;
        assert!(waited >= Duration::from_millis(100), "two back-offs expected, waited {waited:?}");
        assert!(waited < Duration::from_secs(5), "back-off must not wait for the interval");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(sched.is_running().await);

        sched.stop().await;
        assert!(!sched.is_running().await);
    }

    /// Never finishes, so `stop` has to wait out the grace period.
    struct StuckPass;

    impl RolloutPass for StuckPass {
        fn run_pass(&self, _now: u64) -> impl Future<Output = RolloutResult<IterationReport>> + Send {
            std::future::pending()
        }
    }

    #[tokio::test]
    async fn is_running_answers_while_stop_waits() {
        let config = SchedulerConfig {
            stop_grace: Duration::from_millis(500),
            ..fast()
        };
        let sched = Arc::new(RolloutScheduler::new(
            StuckPass,
            Arc::new(ManualClock::new(T0)),
            config,
        ));
        sched.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stopping = tokio::spawn({
            let sched = sched.clone();
            async move { sched.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let answered = tokio::time::timeout(Duration::from_millis(100), sched.is_running()).await;
        assert_eq!(answered, Ok(false));

        stopping.await.unwrap();
    }

    #[test]
    fn validate_rejects_bad_timing() {
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(fast().validate().is_ok());

        let err = SchedulerConfig::default()
            .with_interval_minutes(1)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("shorter than the interval"));

        let zero = SchedulerConfig::default().with_interval_minutes(0);
        assert!(zero.validate().unwrap_err().to_string().contains("greater than zero"));

        let no_backoff = SchedulerConfig {
            error_backoff: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        assert!(no_backoff.validate().is_err());
    }

    #[test]
    fn huge_interval_saturates() {
        let config = SchedulerConfig::default().with_interval_minutes(u64::MAX);
        assert_eq!(config.interval, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn default_timing() {
        let config = SchedulerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(900));
        assert_eq!(config.error_backoff, Duration::from_secs(60));
        assert_eq!(config.stop_grace, Duration::from_secs(30));
        assert_eq!(
            config.with_interval_minutes(5).interval,
            Duration::from_secs(300)
        );
    }
}
