use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Process-wide stop signal.
///
/// `trigger` cancels the background token (reconcilers) first and then the
/// listener token, which starts the HTTP server's graceful drain.
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    background: CancellationToken,
    listener: CancellationToken,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if self.listener.is_cancelled() {
            return;
        }
        tracing::info!("shutdown requested");
        self.background.cancel();
        self.listener.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.listener.is_cancelled()
    }

    /// Token handed to the reconcilers.
    pub fn background(&self) -> CancellationToken {
        self.background.clone()
    }

    pub async fn listener_stopped(&self) {
        self.listener.cancelled().await
    }
}

/// How a background task ended after shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobExit {
    Stopped,
    Failed,
    TimedOut,
}

/// Awaits the background tasks against one shared deadline. Tasks that are
/// still running when it passes are aborted.
pub async fn join_background(jobs: Vec<(&'static str, JoinHandle<()>)>, limit: Duration) -> Vec<JobExit> {
    let deadline = Instant::now() + limit;
    let mut exits = Vec::with_capacity(jobs.len());
    for (name, mut handle) in jobs {
        let exit = match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => JobExit::Stopped,
            Ok(Err(e)) => {
                tracing::error!(job = name, error = %e, "background job failed");
                JobExit::Failed
            }
            Err(_) => {
                tracing::warn!(job = name, timeout = ?limit, "background job did not stop in time");
                handle.abort();
                JobExit::TimedOut
            }
        };
        exits.push(exit);
    }
    exits
}
