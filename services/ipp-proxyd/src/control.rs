//! Status and session control API
//!
//! Endpoints:
//! - GET  /health                 session summary (state, usage, pass validity)
//! - GET  /metrics                Prometheus text exposition
//! - POST /session/start          activate, returns the settled state
//! - POST /session/stop           deactivate
//! - POST /session/rotate         fetch a fresh pass now
//! - POST /session/refresh-usage  re-check usage
//! - POST /session/reset          back to not_ready; `?clear_usage=true` also
//!   forgets the usage snapshot
//!
//! Bind it to loopback or a trusted interface: the routes are not
//! authenticated. Responses never include the pass token.

use std::time::Instant;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use proxy_session::{ProxySessionManager, ProxyState};
use serde::Deserialize;
use tracing::info;

use crate::metrics::record_control_action;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: ProxySessionManager,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the router. A concurrency limit caps in-flight control requests.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/session/start", post(start))
        .route("/session/stop", post(stop))
        .route("/session/rotate", post(rotate))
        .route("/session/refresh-usage", post(refresh_usage))
        .route("/session/reset", post(reset))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

fn state_body(state: ProxyState) -> serde_json::Value {
    serde_json::json!({ "state": state.label() })
}

/// GET /health. Always 200 while the process serves; the session state is
/// in the body.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.manager.health().await;
    body["uptime_seconds"] = state.started_at.elapsed().as_secs().into();
    json(StatusCode::OK, body)
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn start(State(state): State<AppState>) -> impl IntoResponse {
    record_control_action("start");
    let settled = state.manager.start().await;
    info!(state = settled.label(), "start requested via control API");
    json(StatusCode::OK, state_body(settled))
}

async fn stop(State(state): State<AppState>) -> impl IntoResponse {
    record_control_action("stop");
    let settled = state.manager.stop().await;
    info!(state = settled.label(), "stop requested via control API");
    json(StatusCode::OK, state_body(settled))
}

/// POST /session/rotate. 409 when there is no session to rotate.
async fn rotate(State(state): State<AppState>) -> impl IntoResponse {
    record_control_action("rotate");
    let before = state.manager.state();
    if !matches!(before, ProxyState::Active | ProxyState::Paused) {
        return json(
            StatusCode::CONFLICT,
            serde_json::json!({
                "error": "nothing to rotate",
                "state": before.label(),
            }),
        );
    }

    let pass = state.manager.rotate_proxy_pass().await;
    json(
        StatusCode::OK,
        serde_json::json!({
            "state": state.manager.state().label(),
            "rotated": pass.is_some(),
            "pass_expires_at": pass.map(|p| p.not_after().to_rfc3339()),
        }),
    )
}

async fn refresh_usage(State(state): State<AppState>) -> impl IntoResponse {
    record_control_action("refresh_usage");
    let settled = state.manager.refresh_usage().await;
    let usage = state.manager.usage_info().await;
    json(
        StatusCode::OK,
        serde_json::json!({
            "state": settled.label(),
            "remaining_bytes": usage.as_ref().map(|u| u.remaining),
            "max_bytes": usage.as_ref().map(|u| u.max),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct ResetParams {
    #[serde(default)]
    clear_usage: bool,
}

async fn reset(
    State(state): State<AppState>,
    Query(params): Query<ResetParams>,
) -> impl IntoResponse {
    record_control_action("reset");
    state.manager.reset(params.clear_usage).await;
    info!(clear_usage = params.clear_usage, "reset requested via control API");
    json(StatusCode::OK, state_body(state.manager.state()))
}
