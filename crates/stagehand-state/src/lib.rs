//! stagehand-state: embedded state store for staged flag rollouts.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for feature flags, rollout schedules, and rollout stages.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Stage rows use the composite key `{schedule_id}:{stage_id}` so that all
//! stages of a schedule can be collected with a prefix scan.
//!
//! Writes that belong together go through a [`UnitOfWork`], a thin wrapper
//! over a single redb write transaction. Writers that touch a flag's rollout
//! percentage first take that flag's [`FlagGuard`] and hold it until the unit
//! of work has committed:
//!
//! ```text
//! lock_flag(flag_id).await  ──►  begin()  ──►  read / write rows  ──►  commit()
//! ```
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod lock;
pub mod store;
pub mod tables;
pub mod types;
pub mod unit_of_work;

pub use error::{StateError, StateResult};
pub use lock::FlagGuard;
pub use store::StateStore;
pub use types::*;
pub use unit_of_work::UnitOfWork;
