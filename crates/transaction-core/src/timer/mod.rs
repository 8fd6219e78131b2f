//! Timer subsystem: sorted-expiry lists, the list set with its tick, the
//! clock abstraction and the periodic driver task.
//!
//! This module re-exports key components:
//! - [`TimerList`]: one sorted-expiry list over a slot arena.
//! - [`TimerManager`]: the named lists and `schedule`/`cancel`/`reschedule`/`tick`.
//! - [`TimerSettings`]: all configured durations.
//! - [`TimerDriver`]: the tokio task calling the engine's tick.

pub mod clock;
pub mod driver;
pub mod list;
pub mod manager;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use driver::TimerDriver;
pub use list::{EntryId, TimerList};
pub use manager::{TimerHandle, TimerManager, TimerSlot};
pub use types::{Backoff, ListId, TimerSettings};
