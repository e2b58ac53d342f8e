use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::cloud_init::{self, CloudInit};
use crate::schedule::{self, DailyTime};
use crate::scheduler::DailyJob;
use crate::settings;
use crate::wait::sleep_cancellable;
use paropal_common::LABEL_PREFIX;
use paropal_providers::{CloudProvider, InstanceSpec};

#[derive(Clone, Copy, Debug)]
pub struct ProvisionTuning {
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for ProvisionTuning {
    fn default() -> Self {
        Self {
            backoff_min: settings::PROVISION_BACKOFF_MIN,
            backoff_max: settings::PROVISION_BACKOFF_MAX,
        }
    }
}

/// What the managed instance looks like and where its volume goes.
#[derive(Clone, Debug)]
pub struct ProvisionTarget {
    pub region: String,
    pub plan: String,
    pub os_id: u32,
    pub ssh_key_ids: Vec<String>,
    pub user_scheme: String,
    pub block_storage_id: String,
    pub attach_live: bool,
    pub cloud_init: CloudInit,
}

impl Default for ProvisionTarget {
    fn default() -> Self {
        Self {
            region: settings::PROVISION_REGION.to_string(),
            plan: settings::PROVISION_PLAN.to_string(),
            os_id: settings::PROVISION_OS_ID,
            ssh_key_ids: vec![settings::PROVISION_SSH_KEY_ID.to_string()],
            user_scheme: settings::PROVISION_USER_SCHEME.to_string(),
            block_storage_id: settings::PROVISION_BLOCK_STORAGE_ID.to_string(),
            attach_live: settings::PROVISION_BLOCK_ATTACH_LIVE,
            cloud_init: CloudInit::default(),
        }
    }
}

/// Memory of one reconcile run. Once an instance has been created, later
/// attempts in the same run only retry the attach, whatever listings say.
#[derive(Clone, Debug, Default)]
pub struct ProvisionRunState {
    pub instance_id: Option<String>,
    pub label: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Ready,
    Cancelled,
}

/// `paropal-MM-DD_HH-MM-SS` in `zone`.
pub fn new_instance_label(now: DateTime<Utc>, zone: &Tz) -> String {
    format!("{}{}", LABEL_PREFIX, now.with_timezone(zone).format("%m-%d_%H-%M-%S"))
}

async fn attach(
    provider: &dyn CloudProvider,
    target: &ProvisionTarget,
    instance_id: &str,
    accept_already_attached: bool,
) -> Result<()> {
    match provider
        .attach_block_storage(&target.block_storage_id, instance_id, target.attach_live)
        .await
    {
        Ok(()) => {
            tracing::info!(
                block_storage_id = %target.block_storage_id,
                instance_id,
                live = target.attach_live,
                "job-provision: block storage attach requested"
            );
            Ok(())
        }
        Err(e) if accept_already_attached && e.is_already_attached() => {
            tracing::info!(
                block_storage_id = %target.block_storage_id,
                instance_id,
                "job-provision: block storage already attached; continuing"
            );
            Ok(())
        }
        Err(e) => Err(e).context("attach block storage"),
    }
}

/// One attempt at "a managed instance exists and the volume is attached to it".
pub async fn ensure_instance_and_block(
    provider: &dyn CloudProvider,
    target: &ProvisionTarget,
    label_zone: &Tz,
    state: &mut ProvisionRunState,
) -> Result<()> {
    if let Some(instance_id) = state.instance_id.as_deref() {
        return attach(provider, target, instance_id, true).await;
    }

    let existing = provider
        .find_instance_with_label_prefix(LABEL_PREFIX)
        .await
        .context("list instances")?;

    let existing = existing.filter(|instance| {
        if instance.is_terminating() {
            tracing::warn!(
                instance_id = %instance.id,
                label = %instance.label,
                status = %instance.status,
                "job-provision: ignoring terminating instance"
            );
            return false;
        }
        true
    });

    if let Some(instance) = existing {
        tracing::info!(
            instance_id = %instance.id,
            label = %instance.label,
            status = %instance.status,
            ip = instance.main_ip.as_deref().unwrap_or(""),
            "job-provision: instance already exists; skipping create"
        );
        return attach(provider, target, &instance.id, true).await;
    }

    let user_data = cloud_init::encode_user_data(&target.cloud_init.render());
    let label = new_instance_label(Utc::now(), label_zone);
    let spec = InstanceSpec {
        region: target.region.clone(),
        plan: target.plan.clone(),
        os_id: target.os_id,
        label: label.clone(),
        ssh_key_ids: target.ssh_key_ids.clone(),
        user_scheme: target.user_scheme.clone(),
        user_data,
    };

    let instance_id = provider
        .create_instance(&spec)
        .await
        .context("create instance")?;
    tracing::warn!(instance_id = %instance_id, label = %label, "job-provision: created new instance");

    state.instance_id = Some(instance_id.clone());
    state.label = Some(label);

    // Freshly created: an "already attached" answer means the volume sits on
    // some other machine.
    attach(provider, target, &instance_id, false).await
}

/// Retries `ensure_instance_and_block` with backoff until it succeeds or
/// `cancel` fires. There is no cutoff.
pub async fn reconcile_ensure_instance(
    provider: &dyn CloudProvider,
    target: &ProvisionTarget,
    label_zone: &Tz,
    tuning: ProvisionTuning,
    cancel: &CancellationToken,
) -> ProvisionOutcome {
    let mut backoff = Backoff::new(tuning.backoff_min, tuning.backoff_max);
    let mut state = ProvisionRunState::default();

    loop {
        if cancel.is_cancelled() {
            return ProvisionOutcome::Cancelled;
        }

        match ensure_instance_and_block(provider, target, label_zone, &mut state).await {
            Ok(()) => return ProvisionOutcome::Ready,
            Err(e) => {
                let delay = backoff.advance();
                tracing::error!(error = %format!("{e:#}"), retry_in = ?delay, "job-provision: attempt failed");
                if !sleep_cancellable(cancel, delay).await {
                    return ProvisionOutcome::Cancelled;
                }
            }
        }
    }
}

/// job-provision: makes sure the managed instance exists once a day.
pub struct ProvisionJob {
    provider: Arc<dyn CloudProvider>,
    schedule_zone: Tz,
    label_zone: Tz,
    at: DailyTime,
    target: ProvisionTarget,
    tuning: ProvisionTuning,
}

impl ProvisionJob {
    pub fn new(provider: Arc<dyn CloudProvider>, schedule_zone: Tz, label_zone: Tz) -> Self {
        Self {
            provider,
            schedule_zone,
            label_zone,
            at: settings::PROVISION_AT,
            target: ProvisionTarget::default(),
            tuning: ProvisionTuning::default(),
        }
    }
}

#[async_trait]
impl DailyJob for ProvisionJob {
    fn name(&self) -> &'static str {
        "job-provision"
    }

    fn first_trigger(&self, now: DateTime<Utc>) -> DateTime<Tz> {
        schedule::first_provision_trigger(now, &self.schedule_zone, self.at)
    }

    fn next_trigger(&self, now: DateTime<Utc>) -> DateTime<Tz> {
        schedule::next_trigger(now, &self.schedule_zone, self.at)
    }

    async fn fire(&self, scheduled: DateTime<Tz>, cancel: &CancellationToken) {
        tracing::warn!(%scheduled, "job-provision: starting scheduled run");
        let outcome = reconcile_ensure_instance(
            self.provider.as_ref(),
            &self.target,
            &self.label_zone,
            self.tuning,
            cancel,
        )
        .await;
        tracing::info!(?outcome, "job-provision: finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use paropal_common::Instance;
    use paropal_providers::mock::{AttachFailure, MockProvider};

    const BLOCK: &str = "blk-test";

    fn target() -> ProvisionTarget {
        ProvisionTarget {
            block_storage_id: BLOCK.to_string(),
            ..ProvisionTarget::default()
        }
    }

    fn fast() -> ProvisionTuning {
        ProvisionTuning {
            backoff_min: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        }
    }

    fn managed(id: &str, status: &str) -> Instance {
        Instance {
            id: id.to_string(),
            label: format!("{LABEL_PREFIX}02-17_07-10-00"),
            status: status.to_string(),
            main_ip: Some("192.0.2.7".to_string()),
        }
    }

    async fn reconcile(provider: &MockProvider) -> ProvisionOutcome {
        reconcile_ensure_instance(provider, &target(), &Tz::Asia__Tokyo, fast(), &CancellationToken::new()).await
    }

    #[test]
    fn label_uses_label_zone() {
        // 22:10:05 UTC on Feb 16 is 07:10:05 on Feb 17 in Tokyo.
        let now = Utc.with_ymd_and_hms(2026, 2, 16, 22, 10, 5).unwrap();
        assert_eq!(new_instance_label(now, &Tz::Asia__Tokyo), "paropal-02-17_07-10-05");
    }

    #[tokio::test]
    async fn creates_once_when_attach_fails_after_create() {
        let provider = MockProvider::new();
        provider.push_attach_failure(AttachFailure::Upstream);

        assert_eq!(reconcile(&provider).await, ProvisionOutcome::Ready);

        let calls = provider.calls();
        assert_eq!(calls.create, 1);
        assert!(calls.attach >= 2);
        assert_eq!(provider.attached_to(BLOCK).as_deref(), Some("mock-1"));
    }

    #[tokio::test]
    async fn existing_attached_instance_is_left_alone() {
        let provider = MockProvider::with_instances(vec![managed("keep", "active")]);
        provider.preattach(BLOCK, "keep");

        assert_eq!(reconcile(&provider).await, ProvisionOutcome::Ready);

        let calls = provider.calls();
        assert_eq!(calls.create, 0);
        assert_eq!(calls.attach, 1);
        assert_eq!(provider.attached_to(BLOCK).as_deref(), Some("keep"));
    }

    #[tokio::test]
    async fn existing_instance_gets_volume_attached() {
        let provider = MockProvider::with_instances(vec![managed("keep", "active")]);

        assert_eq!(reconcile(&provider).await, ProvisionOutcome::Ready);

        assert_eq!(provider.calls().create, 0);
        assert_eq!(provider.attached_to(BLOCK).as_deref(), Some("keep"));
    }

    #[tokio::test]
    async fn terminating_instance_is_replaced() {
        let provider = MockProvider::with_instances(vec![managed("old", "destroying")]);

        assert_eq!(reconcile(&provider).await, ProvisionOutcome::Ready);

        assert_eq!(provider.calls().create, 1);
        assert_eq!(provider.attached_to(BLOCK).as_deref(), Some("mock-1"));
    }

    #[tokio::test]
    async fn already_attached_right_after_create_is_retried() {
        let provider = MockProvider::new();
        provider.push_attach_failure(AttachFailure::AlreadyAttached);

        assert_eq!(reconcile(&provider).await, ProvisionOutcome::Ready);

        let calls = provider.calls();
        assert_eq!(calls.create, 1);
        assert_eq!(calls.attach, 2);
    }

    #[tokio::test]
    async fn list_lag_does_not_duplicate_create() {
        let provider = MockProvider::new();
        provider.set_list_lag(true);
        provider.push_attach_failure(AttachFailure::Upstream);
        provider.push_attach_failure(AttachFailure::Upstream);

        assert_eq!(reconcile(&provider).await, ProvisionOutcome::Ready);

        assert_eq!(provider.calls().create, 1);
        assert_eq!(provider.calls().list, 1);
        assert_eq!(provider.instances().len(), 1);
    }

    #[tokio::test]
    async fn create_failure_is_retried() {
        let provider = MockProvider::new();
        provider.fail_next_creates(1);

        assert_eq!(reconcile(&provider).await, ProvisionOutcome::Ready);

        assert_eq!(provider.calls().create, 2);
        assert_eq!(provider.instances().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_makes_no_calls() {
        let provider = MockProvider::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = reconcile_ensure_instance(&provider, &target(), &Tz::Asia__Tokyo, fast(), &cancel).await;

        assert_eq!(outcome, ProvisionOutcome::Cancelled);
        assert_eq!(provider.calls(), Default::default());
    }

    #[tokio::test]
    async fn first_attempt_records_run_state() {
        let provider = MockProvider::new();
        provider.push_attach_failure(AttachFailure::Upstream);
        let mut state = ProvisionRunState::default();

        let err = ensure_instance_and_block(&provider, &target(), &Tz::Asia__Tokyo, &mut state)
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("attach block storage"));
        assert_eq!(state.instance_id.as_deref(), Some("mock-1"));
        assert!(state.label.as_deref().unwrap().starts_with(LABEL_PREFIX));
    }

    #[tokio::test]
    async fn cancel_during_backoff_stops_promptly() {
        let provider = MockProvider::new();
        provider.fail_next_lists(usize::MAX);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let slow = ProvisionTuning {
            backoff_min: Duration::from_secs(60),
            backoff_max: Duration::from_secs(300),
        };

        let started = std::time::Instant::now();
        let outcome = reconcile_ensure_instance(&provider, &target(), &Tz::Asia__Tokyo, slow, &cancel).await;

        assert_eq!(outcome, ProvisionOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(provider.calls().list, 1);
        assert_eq!(provider.calls().create, 0);
    }
}
