//! Stagehand rollout engine: staged feature-flag rollouts.
//!
//! A rollout schedule raises one feature flag's rollout percentage through
//! ordered stages. Each stage names a target percentage and a trigger that
//! decides when it starts and finishes. The engine advances schedules in the
//! background and applies each activated stage's percentage to the flag.
//!
//! # Components
//!
//! - **`trigger`**: Activation and completion eligibility per trigger type
//! - **`lifecycle`**: Schedule and stage state machine, plan structure rules
//! - **`mutator`**: Writes a stage's target percentage to its flag
//! - **`progression`**: Shared activate/complete/continue path
//! - **`processor`**: One pass over all active schedules
//! - **`scheduler`**: Background loop running the processor on an interval
//! - **`service`**: Operator actions: create, activate, pause, cancel, edit, advance
//! - **`plan`**: Input shapes for schedules and stages

pub mod clock;
pub mod error;
pub mod lifecycle;
pub mod mutator;
pub mod plan;
pub mod processor;
pub mod progression;
pub mod scheduler;
pub mod service;
pub mod trigger;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{RolloutError, RolloutResult};
pub use mutator::FlagWrite;
pub use plan::{NewSchedule, NewStage, StageUpdate};
pub use processor::{IterationReport, ScheduleProcessor};
pub use progression::StepOutcome;
pub use scheduler::{RolloutPass, RolloutScheduler, SchedulerConfig};
pub use service::{RolloutService, ScheduleOverview};
