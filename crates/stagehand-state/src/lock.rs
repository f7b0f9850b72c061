//! Exclusive per-flag locks.
//!
//! redb already serializes write transactions, but a read-modify-write of a
//! flag spans more than the write itself: the caller decides what to write
//! from stage state it has just read. A `FlagGuard` pins one flag for the
//! whole decision, the way `SELECT … FOR UPDATE` pins a row.
//!
//! Lock order is always guard first, then [`crate::UnitOfWork`]. No code
//! path waits on a guard while holding an open write transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Registry of per-flag mutexes, keyed by flag id.
#[derive(Default)]
pub(crate) struct FlagLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FlagLocks {
    /// Wait for exclusive access to `flag_id`.
    pub(crate) async fn acquire(&self, flag_id: &str) -> FlagGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            // Drop slots nobody holds or waits on so the map tracks live flags only.
            slots.retain(|_, m| Arc::strong_count(m) > 1);
            slots
                .entry(flag_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = slot.lock_owned().await;
        trace!(flag = %flag_id, "flag lock acquired");
        FlagGuard {
            flag_id: flag_id.to_string(),
            _guard: guard,
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Proof that the holder has exclusive access to one feature flag.
///
/// Released on drop.
pub struct FlagGuard {
    flag_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl FlagGuard {
    /// The flag this guard protects.
    pub fn flag_id(&self) -> &str {
        &self.flag_id
    }

    /// True if this guard protects `flag_id`.
    pub fn covers(&self, flag_id: &str) -> bool {
        self.flag_id == flag_id
    }
}

impl std::fmt::Debug for FlagGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagGuard").field("flag_id", &self.flag_id).finish()
    }
}
