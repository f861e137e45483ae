//! Decides when an [`AttributeSync`] is due for its next synchronization.
//!
//! Every synchronization writes the status of the AttributeSync, which triggers another watch
//! event for the same object. Only a spec change (a new generation), an elapsed schedule or an
//! elapsed error backoff make a synchronization due, all other events are answered with the
//! time remaining until the next due point.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::jiff::Timestamp;

use crate::{
    crd::AttributeSync,
    schedule::Schedule,
    status::condition::{SyncConditionSet, SyncConditionType},
};

/// Delay before the first retry of a failed synchronization.
pub const ERROR_BACKOFF_BASE: Duration = Duration::from_secs(10);

/// Upper bound for the delay between retries of a failing synchronization.
pub const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1000);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Due {
    Now,

    /// Not due yet, check again after the given time.
    After(Duration),

    /// Only a change of the AttributeSync makes it due again.
    OnChange,
}

/// Delay before retrying after the given number of consecutive failures, doubling with every
/// failure.
pub fn error_backoff(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    ERROR_BACKOFF_BASE
        .saturating_mul(1 << exponent)
        .min(ERROR_BACKOFF_MAX)
}

/// Determines whether `attribute_sync` should be synchronized at `now`, based on the outcome of
/// its last synchronization as recorded in its status.
pub fn sync_due(
    attribute_sync: &AttributeSync,
    schedule: Option<&Schedule>,
    now: DateTime<Utc>,
) -> Due {
    let Some(status) = &attribute_sync.status else {
        return Due::Now;
    };

    let conditions = SyncConditionSet::from(status.conditions.clone());
    let last_outcome = [SyncConditionType::Success, SyncConditionType::Error]
        .into_iter()
        .filter_map(|type_| conditions.get(type_).map(|condition| (type_, condition)))
        .max_by_key(|(_, condition)| condition.last_transition_time.0);
    let Some((outcome, condition)) = last_outcome else {
        return Due::Now;
    };

    // Also covers conditions written before the AttributeSync was changed
    if condition.observed_generation != attribute_sync.metadata.generation {
        return Due::Now;
    }

    let finished_at = to_chrono(condition.last_transition_time.0);
    let wait = match (outcome, schedule) {
        (SyncConditionType::Error, _) => error_backoff(status.consecutive_failures),
        (SyncConditionType::Success, None) => return Due::OnChange,
        (SyncConditionType::Success, Some(schedule)) => match schedule.next_run(finished_at) {
            Ok(wait) => wait,
            Err(_) => return Due::Now,
        },
    };

    let elapsed = (now - finished_at).to_std().unwrap_or_default();
    match wait.checked_sub(elapsed) {
        Some(remaining) if !remaining.is_zero() => Due::After(remaining),
        _ => Due::Now,
    }
}

fn to_chrono(timestamp: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(
        timestamp.as_second(),
        timestamp.subsec_nanosecond().unsigned_abs(),
    )
    .unwrap_or_default()
}
