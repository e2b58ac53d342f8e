use anyhow::Context;
use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::settings::SHUTDOWN_TIMEOUT;
use crate::shutdown::ShutdownHandle;
use paropal_common::LABEL_PREFIX;
use paropal_providers::CloudProvider;

const INDEX_HTML: &str = include_str!("../static/index.html");
const SHUTDOWN_REALM: &str = "Bearer realm=\"daemon-shutdown\"";

pub struct AppState {
    pub provider: Arc<dyn CloudProvider>,
    pub shutdown_token: String,
    pub shutdown: ShutdownHandle,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/charges", get(charges))
        .route("/api/instance", get(instance))
        .route("/api/shutdown", post(shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn charges(State(state): State<Arc<AppState>>) -> Response {
    match state.provider.pending_charges().await {
        Ok(pending) => Json(json!({ "pending_charges": pending })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to fetch pending charges");
            error_json(StatusCode::BAD_GATEWAY, "failed to fetch pending charges from Vultr")
        }
    }
}

async fn instance(State(state): State<Arc<AppState>>) -> Response {
    match state.provider.find_instance_with_label_prefix(LABEL_PREFIX).await {
        Ok(Some(instance)) => Json(json!({
            "status": instance.status,
            "ip": instance.main_ip.unwrap_or_default(),
            "label": instance.label,
        }))
        .into_response(),
        Ok(None) => error_json(
            StatusCode::NOT_FOUND,
            &format!("no instance found with label prefix {}", LABEL_PREFIX),
        ),
        Err(e) => {
            tracing::error!(error = %e, "failed to fetch instance");
            error_json(StatusCode::BAD_GATEWAY, "failed to fetch instances from Vultr")
        }
    }
}

async fn shutdown(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !auth::authorized(&headers, &state.shutdown_token) {
        let mut resp = error_json(StatusCode::UNAUTHORIZED, "unauthorized");
        resp.headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(SHUTDOWN_REALM));
        return resp;
    }

    tracing::warn!("shutdown requested over http");
    state.shutdown.trigger();
    (StatusCode::ACCEPTED, Json(json!({ "status": "shutting down" }))).into_response()
}

/// Serves until the shutdown handle fires, then drains in-flight requests for
/// at most `SHUTDOWN_TIMEOUT`.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let drain_signal = shutdown.clone();
    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { drain_signal.listener_stopped().await })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        res = &mut server => return res.context("http server"),
        _ = shutdown.listener_stopped() => {}
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, server).await {
        Ok(res) => {
            res.context("http server")?;
            tracing::info!("graceful shutdown complete");
        }
        Err(_) => tracing::error!(timeout = ?SHUTDOWN_TIMEOUT, "graceful shutdown timed out"),
    }
    Ok(())
}
