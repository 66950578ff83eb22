//! Monotonic-clock helpers shared by the timer heap and the readiness wait.

use std::time::{Duration, Instant};

/// A timeout long enough to be treated as "never".
pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + timeout`, saturating at a deadline far enough in the future to
/// never fire instead of overflowing `Instant` arithmetic.
pub(crate) fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .unwrap_or_else(|| now + INFINITY.min(timeout))
}

/// The earlier of two optional deadlines.
pub(crate) fn min_deadline(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
