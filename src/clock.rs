//! Epoch-nanosecond clock readings.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as nanoseconds since the Unix epoch.
///
/// Deadlines are persisted across process restarts, so they are anchored to
/// the epoch rather than to a process-local monotonic instant. Within one
/// rule, readings are ordered by the rule mutex.
pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_nanos() as i64
}
