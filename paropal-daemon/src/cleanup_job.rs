use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::schedule::{self, DailyTime, Window};
use crate::scheduler::DailyJob;
use crate::settings;
use crate::wait::sleep_until_cutoff;
use paropal_providers::CloudProvider;

/// Delays used by the destroy-all loop.
#[derive(Clone, Copy, Debug)]
pub struct CleanupTuning {
    /// Wait after a clean delete pass before re-listing.
    pub settle_delay: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Pause between two successful deletes.
    pub delete_interval: Duration,
}

impl Default for CleanupTuning {
    fn default() -> Self {
        Self {
            settle_delay: settings::CLEANUP_SETTLE_DELAY,
            backoff_min: settings::CLEANUP_BACKOFF_MIN,
            backoff_max: settings::CLEANUP_BACKOFF_MAX,
            delete_interval: settings::CLEANUP_DELETE_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// A listing came back empty.
    Converged,
    CutoffReached,
    Cancelled,
}

fn interrupted(cancel: &CancellationToken, cutoff: DateTime<Utc>) -> CleanupOutcome {
    if cancel.is_cancelled() {
        return CleanupOutcome::Cancelled;
    }
    tracing::warn!(%cutoff, "job-cleanup: cutoff reached");
    CleanupOutcome::CutoffReached
}

/// Deletes every instance in the account until a listing comes back empty,
/// the cutoff passes, or `cancel` fires.
///
/// Each pass re-lists from scratch; nothing is remembered across passes, so
/// instances that appear mid-run are picked up on the next listing.
pub async fn reconcile_destroy_all(
    provider: &dyn CloudProvider,
    tuning: CleanupTuning,
    cancel: &CancellationToken,
    cutoff: DateTime<Utc>,
) -> CleanupOutcome {
    let mut backoff = Backoff::new(tuning.backoff_min, tuning.backoff_max);

    loop {
        if cancel.is_cancelled() {
            return CleanupOutcome::Cancelled;
        }
        if Utc::now() >= cutoff {
            tracing::warn!(%cutoff, "job-cleanup: cutoff reached");
            return CleanupOutcome::CutoffReached;
        }

        let instances = match provider.list_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                let delay = backoff.current();
                tracing::error!(error = %e, retry_in = ?delay, "job-cleanup: list instances failed");
                if !sleep_until_cutoff(cancel, delay, cutoff).await {
                    return interrupted(cancel, cutoff);
                }
                backoff.advance();
                continue;
            }
        };

        if instances.is_empty() {
            tracing::info!("job-cleanup: no instances left");
            return CleanupOutcome::Converged;
        }
        tracing::info!(count = instances.len(), "job-cleanup: deleting instances");

        let mut failed = false;
        for instance in &instances {
            if cancel.is_cancelled() {
                return CleanupOutcome::Cancelled;
            }
            if Utc::now() >= cutoff {
                tracing::warn!(%cutoff, "job-cleanup: cutoff reached mid-pass");
                return CleanupOutcome::CutoffReached;
            }
            if instance.id.trim().is_empty() {
                tracing::warn!(label = %instance.label, "job-cleanup: instance without id");
                failed = true;
                continue;
            }

            if let Err(e) = provider.delete_instance(&instance.id).await {
                tracing::error!(instance_id = %instance.id, error = %e, "job-cleanup: delete failed");
                failed = true;
                continue;
            }
            tracing::info!(instance_id = %instance.id, label = %instance.label, "job-cleanup: deleted");

            if !sleep_until_cutoff(cancel, tuning.delete_interval, cutoff).await {
                return interrupted(cancel, cutoff);
            }
        }

        if failed {
            let delay = backoff.current();
            tracing::error!(retry_in = ?delay, "job-cleanup: pass had failures");
            if !sleep_until_cutoff(cancel, delay, cutoff).await {
                return interrupted(cancel, cutoff);
            }
            backoff.advance();
            continue;
        }

        if !sleep_until_cutoff(cancel, tuning.settle_delay, cutoff).await {
            return interrupted(cancel, cutoff);
        }
        backoff.reset();
    }
}

/// job-cleanup: empties the account once a day inside the cleanup window.
pub struct CleanupJob {
    provider: Arc<dyn CloudProvider>,
    zone: Tz,
    at: DailyTime,
    window: Window,
    tuning: CleanupTuning,
}

impl CleanupJob {
    pub fn new(provider: Arc<dyn CloudProvider>, zone: Tz) -> Self {
        Self {
            provider,
            zone,
            at: settings::CLEANUP_AT,
            window: settings::CLEANUP_WINDOW,
            tuning: CleanupTuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: CleanupTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Runs one cleanup if `now` is inside today's window.
    pub async fn run_once(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Option<CleanupOutcome> {
        if !self.window.contains(now, &self.zone) {
            tracing::info!(now = %now.with_timezone(&self.zone), "job-cleanup: outside window, skipping");
            return None;
        }
        let (_, end) = self.window.bounds(now, &self.zone);
        let outcome =
            reconcile_destroy_all(self.provider.as_ref(), self.tuning, cancel, end.with_timezone(&Utc)).await;
        tracing::info!(?outcome, "job-cleanup: finished");
        Some(outcome)
    }
}

#[async_trait]
impl DailyJob for CleanupJob {
    fn name(&self) -> &'static str {
        "job-cleanup"
    }

    fn first_trigger(&self, now: DateTime<Utc>) -> DateTime<Tz> {
        schedule::first_cleanup_trigger(now, &self.zone, self.at, self.window)
    }

    fn next_trigger(&self, now: DateTime<Utc>) -> DateTime<Tz> {
        schedule::next_trigger(now, &self.zone, self.at)
    }

    async fn fire(&self, scheduled: DateTime<Tz>, cancel: &CancellationToken) {
        tracing::info!(%scheduled, "job-cleanup: triggered");
        self.run_once(Utc::now(), cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use paropal_common::Instance;
    use paropal_providers::mock::MockProvider;
    use std::io;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Collects formatted log output for the current thread.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn lines(&self) -> Vec<String> {
            let buf = self.0.lock().unwrap();
            String::from_utf8_lossy(&buf).lines().map(str::to_string).collect()
        }

        fn has(&self, level: &str, message: &str) -> bool {
            self.lines().iter().any(|l| l.contains(level) && l.contains(message))
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture_logs() -> (Captured, tracing::subscriber::DefaultGuard) {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (captured, guard)
    }

    fn cancel_after(ms: u64) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            trigger.cancel();
        });
        cancel
    }

    fn fast() -> CleanupTuning {
        CleanupTuning {
            settle_delay: Duration::from_millis(5),
            backoff_min: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            delete_interval: Duration::from_millis(1),
        }
    }

    fn instance(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            label: format!("label-{id}"),
            status: "active".to_string(),
            main_ip: Some("192.0.2.1".to_string()),
        }
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::seconds(30)
    }

    #[tokio::test]
    async fn deletes_everything_and_converges() {
        let provider = MockProvider::with_instances(vec![instance("a"), instance("b"), instance("c")]);
        let cancel = CancellationToken::new();

        let outcome = reconcile_destroy_all(&provider, fast(), &cancel, later()).await;

        assert_eq!(outcome, CleanupOutcome::Converged);
        assert!(provider.instances().is_empty());
        let calls = provider.calls();
        assert_eq!(calls.delete, 3);
        assert!(calls.list >= 2);
    }

    #[tokio::test]
    async fn past_cutoff_makes_no_calls() {
        let provider = MockProvider::with_instances(vec![instance("a")]);
        let cancel = CancellationToken::new();
        let cutoff = Utc::now() - ChronoDuration::seconds(1);

        let outcome = reconcile_destroy_all(&provider, fast(), &cancel, cutoff).await;

        assert_eq!(outcome, CleanupOutcome::CutoffReached);
        assert_eq!(provider.calls().list, 0);
        assert_eq!(provider.calls().delete, 0);
        assert_eq!(provider.instances().len(), 1);
    }

    #[tokio::test]
    async fn retries_after_list_failure() {
        let provider = MockProvider::with_instances(vec![instance("a")]);
        provider.fail_next_lists(2);
        let cancel = CancellationToken::new();

        let outcome = reconcile_destroy_all(&provider, fast(), &cancel, later()).await;

        assert_eq!(outcome, CleanupOutcome::Converged);
        assert!(provider.instances().is_empty());
        assert!(provider.calls().list >= 4);
    }

    #[tokio::test]
    async fn retries_after_delete_failure() {
        let provider = MockProvider::with_instances(vec![instance("a"), instance("b")]);
        provider.fail_next_deletes(1);
        let cancel = CancellationToken::new();

        let outcome = reconcile_destroy_all(&provider, fast(), &cancel, later()).await;

        assert_eq!(outcome, CleanupOutcome::Converged);
        assert!(provider.instances().is_empty());
        assert_eq!(provider.calls().delete, 3);
    }

    #[tokio::test]
    async fn empty_account_converges_on_first_list() {
        let provider = MockProvider::new();
        let cancel = CancellationToken::new();

        let outcome = reconcile_destroy_all(&provider, fast(), &cancel, later()).await;

        assert_eq!(outcome, CleanupOutcome::Converged);
        assert_eq!(provider.calls().list, 1);
    }

    #[tokio::test]
    async fn cancelled_run_stops_without_calls() {
        let provider = MockProvider::with_instances(vec![instance("a")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = reconcile_destroy_all(&provider, fast(), &cancel, later()).await;

        assert_eq!(outcome, CleanupOutcome::Cancelled);
        assert_eq!(provider.calls().list, 0);
    }

    #[tokio::test]
    async fn persistent_list_failure_stops_at_cutoff() {
        let provider = MockProvider::with_instances(vec![instance("a")]);
        provider.fail_next_lists(usize::MAX);
        let cancel = CancellationToken::new();
        let cutoff = Utc::now() + ChronoDuration::milliseconds(100);

        let outcome = reconcile_destroy_all(&provider, fast(), &cancel, cutoff).await;

        assert_eq!(outcome, CleanupOutcome::CutoffReached);
        assert_eq!(provider.instances().len(), 1);
    }

    #[tokio::test]
    async fn run_once_skips_outside_window() {
        let provider = Arc::new(MockProvider::with_instances(vec![instance("a")]));
        let job = CleanupJob::new(provider.clone(), Tz::Asia__Seoul).with_tuning(fast());
        let noon = chrono::TimeZone::with_ymd_and_hms(&Tz::Asia__Seoul, 2026, 2, 17, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);

        let outcome = job.run_once(noon, &CancellationToken::new()).await;

        assert_eq!(outcome, None);
        assert_eq!(provider.calls().list, 0);
    }

    #[tokio::test]
    async fn deletes_are_paced() {
        let provider = MockProvider::with_instances(vec![instance("a"), instance("b"), instance("c")]);
        let tuning = CleanupTuning {
            delete_interval: Duration::from_millis(40),
            ..fast()
        };

        let outcome = reconcile_destroy_all(&provider, tuning, &CancellationToken::new(), later()).await;

        assert_eq!(outcome, CleanupOutcome::Converged);
        let times = provider.delete_times();
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            assert!(
                pair[1].duration_since(pair[0]) >= Duration::from_millis(40),
                "deletes {:?} apart",
                pair[1].duration_since(pair[0])
            );
        }
    }

    #[tokio::test]
    async fn cancel_during_settle_stops_promptly() {
        let provider = MockProvider::with_instances(vec![instance("a")]);
        let tuning = CleanupTuning {
            settle_delay: Duration::from_secs(60),
            ..fast()
        };
        let cancel = cancel_after(30);

        let started = Instant::now();
        let outcome = reconcile_destroy_all(&provider, tuning, &cancel, later()).await;

        assert_eq!(outcome, CleanupOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(provider.calls().list, 1);
    }

    #[tokio::test]
    async fn cancel_during_backoff_stops_promptly() {
        let provider = MockProvider::with_instances(vec![instance("a")]);
        provider.fail_next_lists(usize::MAX);
        let tuning = CleanupTuning {
            backoff_min: Duration::from_secs(60),
            backoff_max: Duration::from_secs(300),
            ..fast()
        };
        let cancel = cancel_after(30);

        let started = Instant::now();
        let outcome = reconcile_destroy_all(&provider, tuning, &cancel, later()).await;

        assert_eq!(outcome, CleanupOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(provider.calls().list, 1);
    }

    #[tokio::test]
    async fn upstream_failures_log_at_error() {
        let (logs, _guard) = capture_logs();
        let provider = MockProvider::with_instances(vec![instance("a")]);
        provider.fail_next_lists(1);
        provider.fail_next_deletes(1);

        let outcome = reconcile_destroy_all(&provider, fast(), &CancellationToken::new(), later()).await;

        assert_eq!(outcome, CleanupOutcome::Converged);
        assert!(logs.has("ERROR", "list instances failed"), "{:#?}", logs.lines());
        assert!(logs.has("ERROR", "delete failed"), "{:#?}", logs.lines());
    }

    #[tokio::test]
    async fn cutoff_during_backoff_is_logged() {
        let (logs, _guard) = capture_logs();
        let provider = MockProvider::with_instances(vec![instance("a")]);
        provider.fail_next_lists(usize::MAX);
        let tuning = CleanupTuning {
            backoff_min: Duration::from_secs(60),
            backoff_max: Duration::from_secs(300),
            ..fast()
        };
        let cutoff = Utc::now() + ChronoDuration::milliseconds(50);

        let outcome = reconcile_destroy_all(&provider, tuning, &CancellationToken::new(), cutoff).await;

        assert_eq!(outcome, CleanupOutcome::CutoffReached);
        assert_eq!(provider.calls().list, 1);
        assert!(logs.has("WARN", "cutoff reached"), "{:#?}", logs.lines());
    }
}
