use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;

/// A job that fires once per day at a computed wall-clock time.
#[async_trait]
pub trait DailyJob: Send + Sync {
    fn name(&self) -> &'static str;

    /// First trigger after process start, including catch-up.
    fn first_trigger(&self, now: DateTime<Utc>) -> DateTime<Tz>;

    fn next_trigger(&self, now: DateTime<Utc>) -> DateTime<Tz>;

    async fn fire(&self, scheduled: DateTime<Tz>, cancel: &CancellationToken);
}

/// Waits for each trigger in turn and fires the job, until `cancel` fires.
///
/// The next trigger is computed from the clock after `fire` returns, so a run
/// that overshoots its slot skips to the following day instead of piling up.
pub async fn run_daily<J: DailyJob + ?Sized>(job: &J, cancel: CancellationToken) {
    let mut next = job.first_trigger(Utc::now());
    tracing::info!(job = job.name(), next = %next, "job scheduled");

    loop {
        let wait = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or_default();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(job = job.name(), "job stopped");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        job.fire(next, &cancel).await;
        if cancel.is_cancelled() {
            tracing::info!(job = job.name(), "job stopped");
            return;
        }

        next = job.next_trigger(Utc::now());
        tracing::info!(job = job.name(), next = %next, "job rescheduled");
    }
}
