//! Administrative endpoints (spec §6): health/config echo, a loopback-only
//! shutdown, a pipeline-readiness probe, and a static admin page.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::info;

use crate::config::ProviderProfile;
use crate::state::GatewayState;

pub async fn health(State(state): State<Arc<GatewayState>>) -> Response {
	Json(json!({
		"status": "ok",
		"server": format!("{}:{}", state.settings.host, state.settings.port),
		"version": env!("CARGO_PKG_VERSION"),
	}))
	.into_response()
}

pub async fn config(State(state): State<Arc<GatewayState>>) -> Response {
	Json(json!({ "host": state.settings.host, "port": state.settings.port })).into_response()
}

/// Only the loopback caller may shut the process down. The SIGTERM in the
/// spec's `{ok:true}` then SIGTERM-after-50ms contract is approximated with
/// a direct process exit since this crate doesn't otherwise depend on a
/// signal-handling crate.
pub async fn shutdown(ConnectInfo(addr): ConnectInfo<SocketAddr>) -> Response {
	if !addr.ip().is_loopback() {
		return (StatusCode::FORBIDDEN, Json(json!({"error": "shutdown is loopback-only"}))).into_response();
	}
	info!("shutdown requested from loopback, exiting in 50ms");
	tokio::spawn(async {
		tokio::time::sleep(Duration::from_millis(50)).await;
		std::process::exit(0);
	});
	Json(json!({"ok": true})).into_response()
}

pub async fn debug_runtime(State(state): State<Arc<GatewayState>>) -> Response {
	let live = state.registry.live_provider_keys().await;
	Json(json!({ "pipelineReady": !live.is_empty(), "liveProviderKeys": live })).into_response()
}

/// Rebuilds the provider registry from a fresh provider map without
/// restarting the process (spec §4.3's full-rebuild reload).
pub async fn reload(
	State(state): State<Arc<GatewayState>>,
	Json(providers): Json<std::collections::HashMap<String, ProviderProfile>>,
) -> Response {
	let report = state.reload(providers).await;
	Json(json!({
		"live": report.live_provider_keys,
		"failed": report.failed_provider_keys,
	}))
	.into_response()
}

pub async fn daemon_admin() -> Response {
	Html("<html><body><h1>routecodex daemon admin</h1></body></html>").into_response()
}
