use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde_json::Value;

use crate::state::GatewayState;
use crate::types::EntryEndpoint;

pub async fn handle(State(state): State<Arc<GatewayState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
	super::handle_entry(state, EntryEndpoint::Responses, headers, body).await
}
