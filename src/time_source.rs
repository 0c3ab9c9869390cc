//! Injectable wall-clock time, so interval-boundary arithmetic can be tested
//! deterministically.
//!
//! Generalized from the teacher's `pipeline::aggregator::TimeSource`: there it
//! picked between a timer clock and a wall clock for batching cadence; here
//! the engine only ever needs "now" in whole seconds since the epoch, so the
//! two cases collapse to a single `now_s` accessor.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" for interval alignment. Defaults to the real wall clock;
/// tests substitute a deterministic closure.
pub enum TimeSource {
    /// The default time source.
    SystemTime,
    /// A caller-supplied clock, primarily for tests.
    Dynamic(Box<dyn Fn() -> u64 + Send + Sync>),
}

impl std::fmt::Debug for TimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SystemTime => write!(f, "SystemTime"),
            Self::Dynamic(_) => f.debug_tuple("Dynamic").finish(),
        }
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::SystemTime
    }
}

impl TimeSource {
    /// Current wall-clock time, in whole seconds since the epoch.
    pub fn now_s(&self) -> u64 {
        match self {
            Self::SystemTime => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system clock is before the unix epoch")
                .as_secs(),
            Self::Dynamic(now) => now(),
        }
    }
}

/// `floor(now_s / step_s) * step_s`, the wall-clock left edge of the window
/// containing `now_s`.
pub fn aligned_start(now_s: u64, step_s: u32) -> u64 {
    let step_s = step_s as u64;
    (now_s / step_s) * step_s
}
