//! Monotonic time and deadlines.
//!
//! All scheduling in the runtime is driven by a single 64-bit monotonic
//! deadline value in 100 ns units, measured from process start. Smaller is
//! more urgent; `INFINITE_DEADLINE` runs at lowest priority but still counts
//! as an activity.

use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

/// Deadline value: 100 ns units since process start. Smaller is more urgent.
pub type DeadlineTime = u64;

/// Lowest possible priority. Still counted as a scheduler activity.
pub const INFINITE_DEADLINE: DeadlineTime = u64::MAX;

/// One millisecond in deadline units.
pub const MILLISECOND: DeadlineTime = 10_000;

/// One second in deadline units.
pub const SECOND: DeadlineTime = 1_000 * MILLISECOND;

/// Construction deadline for most binder and service constructions.
pub const DEFAULT_CONSTRUCTION_DEADLINE: DeadlineTime = MILLISECOND;

/// Construction deadline for cross-domain unmarshal (may call the peer).
pub const CROSS_DOMAIN_DEADLINE: DeadlineTime = 10 * MILLISECOND;

/// Construction deadline for file-access duplication.
pub const FILE_DUP_DEADLINE: DeadlineTime = 100 * MILLISECOND;

/// Deadline of the deferred revive-or-die pass over dropped references.
pub const PROXY_GC_DEADLINE: DeadlineTime = SECOND;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// The process-wide monotonic clock.
pub struct Clock;

impl Clock {
    /// Current monotonic time in deadline units.
    pub fn now() -> DeadlineTime {
        let elapsed = EPOCH.elapsed();
        (elapsed.as_nanos() / 100) as DeadlineTime
    }

    /// A deadline `interval` units from now. Saturates at `INFINITE_DEADLINE`.
    pub fn make_deadline(interval: DeadlineTime) -> DeadlineTime {
        Clock::now().saturating_add(interval)
    }

    /// Time remaining until `deadline`, or zero if it has passed.
    ///
    /// `INFINITE_DEADLINE` maps to `None` (no bound).
    pub fn remaining(deadline: DeadlineTime) -> Option<Duration> {
        if deadline == INFINITE_DEADLINE {
            return None;
        }
        let now = Clock::now();
        let left = deadline.saturating_sub(now);
        Some(Duration::from_nanos(left * 100))
    }

    /// Whether `deadline` has already passed.
    pub fn expired(deadline: DeadlineTime) -> bool {
        deadline != INFINITE_DEADLINE && Clock::now() >= deadline
    }
}
