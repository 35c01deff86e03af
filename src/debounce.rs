//! Per-project debounce state
//!
//! Two states: `Idle`, or `PendingNotify(deadline)`. Every raw event moves the
//! deadline to `now + quiet`; polling at or past the deadline fires once and
//! returns to `Idle`.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebounceState {
    #[default]
    Idle,
    PendingNotify(Instant),
}

impl DebounceState {
    /// Record a raw event, replacing any pending deadline
    pub fn trigger(&mut self, now: Instant, quiet: Duration) {
        *self = DebounceState::PendingNotify(now + quiet);
    }

    /// Returns true exactly once per quiet window, when the deadline passes
    pub fn poll(&mut self, now: Instant) -> bool {
        match *self {
            DebounceState::PendingNotify(deadline) if now >= deadline => {
                *self = DebounceState::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self {
            DebounceState::Idle => None,
            DebounceState::PendingNotify(deadline) => Some(*deadline),
        }
    }
}
