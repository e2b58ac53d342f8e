use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;

use paropal_daemon::api::{self, AppState};
use paropal_daemon::cleanup_job::CleanupJob;
use paropal_daemon::provisioning_job::ProvisionJob;
use paropal_daemon::scheduler::{self, DailyJob};
use paropal_daemon::settings::{self, Settings};
use paropal_daemon::shutdown::{join_background, ShutdownHandle};
use paropal_providers::vultr::VultrProvider;
use paropal_providers::CloudProvider;

fn spawn_daily<J: DailyJob + 'static>(job: J, shutdown: &ShutdownHandle) -> tokio::task::JoinHandle<()> {
    let cancel = shutdown.background();
    tokio::spawn(async move { scheduler::run_daily(&job, cancel).await })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env()?;
    let provider: Arc<dyn CloudProvider> =
        Arc::new(VultrProvider::new(settings.api_key.clone()).context("failed to build vultr client")?);
    let shutdown = ShutdownHandle::new();

    let jobs = vec![
        ("job-cleanup", spawn_daily(CleanupJob::new(provider.clone(), settings.schedule_tz), &shutdown)),
        (
            "job-provision",
            spawn_daily(
                ProvisionJob::new(provider.clone(), settings.schedule_tz, settings.label_tz),
                &shutdown,
            ),
        ),
    ];

    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("ctrl-c received");
            on_ctrl_c.trigger();
        }
    });

    let listener = TcpListener::bind(settings::LISTEN_ADDR)
        .await
        .with_context(|| format!("failed to bind {}", settings::LISTEN_ADDR))?;
    tracing::info!(addr = settings::LISTEN_ADDR, "starting daemon");

    let state = Arc::new(AppState {
        provider,
        shutdown_token: settings.shutdown_token.clone(),
        shutdown: shutdown.clone(),
    });
    let served = api::serve(listener, state).await;

    // Server errors also stop the reconcilers.
    shutdown.trigger();
    join_background(jobs, settings::SHUTDOWN_TIMEOUT).await;

    served
}
