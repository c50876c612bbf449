//! Tick arithmetic.
//!
//! The scheduler clock counts discrete ticks at a fixed base resolution
//! of one second. Every sampling period is expressed as a tick id; an
//! entity is due for sampling on tick `t` iff `t % tick_id == 0`.

use std::time::Duration;

/// Convert a human sampling period into a tick id.
///
/// Sub-second periods clamp to the base resolution.
pub fn tick_id_from_period(period: Duration) -> u64 {
    period.as_secs().max(1)
}

/// Whether an entity with the given tick id is due at `tick`.
///
/// A zero tick id never fires.
#[inline]
pub fn is_due(tick: u64, tick_id: u64) -> bool {
    tick_id != 0 && tick % tick_id == 0
}
