//! Job scheduling constants, retry backoff, and the queue state machine.
//!
//! Lives in `core` so the queue, executor and any CLI tooling agree on the
//! same priorities and transition rules.

use std::time::Duration;

use crate::job::JobStatus;

// ---------------------------------------------------------------------------
// Priority constants
// ---------------------------------------------------------------------------

/// Priority value for urgent jobs. Dispatched before all others.
pub const PRIORITY_URGENT: i32 = 10;

/// Priority value for normal jobs. Default.
pub const PRIORITY_NORMAL: i32 = 0;

/// Priority value for background jobs. Dispatched last.
pub const PRIORITY_BACKGROUND: i32 = -10;

/// Attempts allowed per job when the caller does not specify a budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Retry backoff
// ---------------------------------------------------------------------------

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
/// clamped to `ceiling`.
///
/// With a 1 s base this yields 1 s, 2 s, 4 s, 8 s, ...
pub fn retry_backoff(attempt: u32, base: Duration, ceiling: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(ceiling).min(ceiling)
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub mod state_machine {
    use super::JobStatus;

    /// Statuses reachable from `from`.
    ///
    /// Terminal states (Completed, Failed, Cancelled) return an empty slice.
    pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
        use JobStatus::*;
        match from {
            Pending => &[Running, Cancelled],
            Running => &[Completed, Failed, RetryScheduled, Cancelled],
            RetryScheduled => &[Running, Cancelled],
            Completed | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        valid_transitions(from).contains(&to)
    }
}
