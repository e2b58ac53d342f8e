use std::sync::Arc;

use axum::Router;
use paropal_common::Instance;
use paropal_daemon::api::{self, AppState};
use paropal_daemon::shutdown::ShutdownHandle;
use paropal_providers::mock::MockProvider;

pub const TOKEN: &str = "test-shutdown-token";

pub struct TestApp {
    pub router: Router,
    pub provider: Arc<MockProvider>,
    pub shutdown: ShutdownHandle,
}

/// Router backed by an in-memory provider.
pub fn test_app(provider: MockProvider) -> TestApp {
    let provider = Arc::new(provider);
    let shutdown = ShutdownHandle::new();
    let state = Arc::new(AppState {
        provider: provider.clone(),
        shutdown_token: TOKEN.to_string(),
        shutdown: shutdown.clone(),
    });
    TestApp {
        router: api::router(state),
        provider,
        shutdown,
    }
}

pub fn instance(id: &str, label: &str, status: &str, ip: Option<&str>) -> Instance {
    Instance {
        id: id.to_string(),
        label: label.to_string(),
        status: status.to_string(),
        main_ip: ip.map(str::to_string),
    }
}
