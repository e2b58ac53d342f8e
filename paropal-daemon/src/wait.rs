use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleeps for `d` unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_cancellable(cancel: &CancellationToken, d: Duration) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if d.is_zero() {
        return true;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

/// Time left until `cutoff`, zero once it has passed.
pub fn remaining_until(cutoff: DateTime<Utc>) -> Duration {
    (cutoff - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Sleeps for `d`, never past `cutoff`.
///
/// Returns `true` only when the sleep completed and the cutoff is still ahead.
pub async fn sleep_until_cutoff(
    cancel: &CancellationToken,
    d: Duration,
    cutoff: DateTime<Utc>,
) -> bool {
    let remaining = remaining_until(cutoff);
    if remaining.is_zero() {
        return false;
    }
    if !sleep_cancellable(cancel, d.min(remaining)).await {
        return false;
    }
    Utc::now() < cutoff
}
