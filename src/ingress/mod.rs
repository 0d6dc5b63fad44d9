//! Ingress Handlers (C9, spec §4.8): thin protocol adaptors that decode an
//! HTTP request into an `ExecutionInput` and encode the `ExecutionResult`
//! back out. Handlers never invoke providers directly and never mutate the
//! payload — all of that lives in `executor`.

pub mod admin;
pub mod chat;
pub mod messages;
pub mod responses;

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::headers::authorization::Bearer;
use futures::StreamExt;
use headers::{Authorization, HeaderMapExt};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::sse_error_frame;
use crate::executor::Executor;
use crate::state::GatewayState;
use crate::types::{EntryEndpoint, ExecutionBody, ExecutionInput, ExecutionResult, Metadata};

pub fn build_router(state: Arc<GatewayState>) -> Router {
	Router::new()
		.route("/v1/chat/completions", post(chat::handle))
		.route("/v1/messages", post(messages::handle))
		.route("/v1/responses", post(responses::handle))
		.route("/health", get(admin::health))
		.route("/config", get(admin::config))
		.route("/shutdown", post(admin::shutdown))
		.route("/debug/runtime", get(admin::debug_runtime))
		.route("/daemon/admin", get(admin::daemon_admin))
		.route("/admin/reload", post(admin::reload))
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
		.with_state(state)
}

/// Headers snapshotted once into `metadata.clientHeaders` (spec §4.5
/// guarantee 3); downstream components read this snapshot instead of
/// re-parsing the original request. `authorization` is parsed separately via
/// a typed `headers::Authorization<Bearer>` extraction so a malformed scheme
/// never silently gets forwarded byte-for-byte.
const FORWARDED_HEADERS: &[&str] = &["content-type", "accept", "user-agent"];

pub(crate) async fn handle_entry(
	state: Arc<GatewayState>,
	endpoint: EntryEndpoint,
	headers: HeaderMap,
	body: Value,
) -> Response {
	let request_id = headers
		.get("x-request-id")
		.and_then(|v| v.to_str().ok())
		.map(str::to_string)
		.unwrap_or_else(|| Uuid::new_v4().to_string());

	let mut metadata = Metadata::default();
	metadata.client_request_id = Some(request_id.clone());
	metadata.session_id = headers.get("x-session-id").and_then(|v| v.to_str().ok()).map(str::to_string);
	metadata.conversation_id =
		headers.get("x-conversation-id").and_then(|v| v.to_str().ok()).map(str::to_string);
	metadata.route_hint = headers.get("x-route-hint").and_then(|v| v.to_str().ok()).map(str::to_string);
	metadata.entry_endpoint = Some(endpoint);

	let mut snapshot = HashMap::new();
	for name in FORWARDED_HEADERS {
		if let Some(v) = headers.get(*name).and_then(|v| v.to_str().ok()) {
			snapshot.insert((*name).to_string(), v.to_string());
		}
	}
	if let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>() {
		snapshot.insert("authorization".to_string(), format!("Bearer {}", bearer.token()));
	}
	metadata.client_headers = Some(snapshot);

	let input = ExecutionInput {
		request_id,
		entry_endpoint: endpoint,
		method: "POST".to_string(),
		headers: HashMap::new(),
		query: HashMap::new(),
		body,
		metadata,
	};

	let executor = Executor::new(state);
	match executor.execute(input).await {
		Ok(result) => encode_result(result),
		Err(err) => err.into_response(),
	}
}

fn encode_result(result: ExecutionResult) -> Response {
	let status = StatusCode::from_u16(result.status.unwrap_or(200)).unwrap_or(StatusCode::OK);
	match result.body {
		ExecutionBody::Json(value) => {
			let mut response = (status, Json(value)).into_response();
			apply_headers(&mut response, &result.headers);
			response
		},
		ExecutionBody::Sse(stream) => {
			let body_stream = stream.map(|frame| match frame {
				Ok(text) => Ok::<_, std::io::Error>(text.into_bytes()),
				Err(err) => Ok(sse_error_frame(&err).into_bytes()),
			});
			let mut response = Response::builder()
				.status(status)
				.header("content-type", "text/event-stream")
				.body(Body::from_stream(body_stream))
				.unwrap();
			apply_headers(&mut response, &result.headers);
			response
		},
	}
}

fn apply_headers(response: &mut Response, headers: &HashMap<String, String>) {
	for (key, value) in headers {
		if let (Ok(name), Ok(value)) =
			(http::HeaderName::try_from(key.as_str()), http::HeaderValue::from_str(value))
		{
			response.headers_mut().insert(name, value);
		}
	}
}
