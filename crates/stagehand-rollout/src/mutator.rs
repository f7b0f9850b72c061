//! Flag mutator: applies a stage's target percentage to its feature flag.
//!
//! The write happens inside the caller's [`UnitOfWork`], next to the stage
//! status change it belongs to, and only while the caller holds the flag's
//! [`FlagGuard`]. Percentage and `updated_at` change together or not at all.

use stagehand_state::{FlagGuard, UnitOfWork};
use tracing::{debug, warn};

use crate::error::RolloutResult;

/// Outcome of a flag write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagWrite {
    /// The flag now carries the target percentage.
    Applied { previous: u32 },
    /// No flag with that id exists; nothing was written.
    Missing,
    /// The supplied guard protects a different flag; nothing was written.
    NotLocked,
}

/// Set `flag_id`'s rollout percentage to `target_percentage`.
///
/// Store failures are returned as errors. A missing flag is not an error
/// here: stage bookkeeping proceeds and the caller decides how to report it.
pub fn activate_flag(
    uow: &mut UnitOfWork,
    guard: &FlagGuard,
    flag_id: &str,
    target_percentage: u32,
    now: u64,
) -> RolloutResult<FlagWrite> {
    if !guard.covers(flag_id) {
        warn!(
            flag = %flag_id,
            locked = %guard.flag_id(),
            "refusing flag write without holding its lock"
        );
        return Ok(FlagWrite::NotLocked);
    }

    let Some(mut flag) = uow.get_flag(flag_id)? else {
        warn!(flag = %flag_id, target_percentage, "feature flag not found");
        return Ok(FlagWrite::Missing);
    };

    let previous = flag.rollout_percentage;
    flag.rollout_percentage = target_percentage;
    flag.updated_at = now;
    uow.put_flag(&flag)?;

    debug!(
        flag = %flag_id,
        key = %flag.key,
        from = previous,
        to = target_percentage,
        "rollout percentage updated"
    );
    Ok(FlagWrite::Applied { previous })
}
