//! Core pipeline types (spec §3): `ExecutionInput`, `ExecutionResult`,
//! `RouterDecision`, and the request-id enhancement function.

use std::collections::HashMap;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryEndpoint {
	ChatCompletions,
	Messages,
	Responses,
}

impl EntryEndpoint {
	pub fn path(&self) -> &'static str {
		match self {
			EntryEndpoint::ChatCompletions => "/v1/chat/completions",
			EntryEndpoint::Messages => "/v1/messages",
			EntryEndpoint::Responses => "/v1/responses",
		}
	}

	pub fn token(&self) -> &'static str {
		match self {
			EntryEndpoint::ChatCompletions => "chat",
			EntryEndpoint::Messages => "messages",
			EntryEndpoint::Responses => "responses",
		}
	}

	pub fn native_protocol(&self) -> crate::config::Protocol {
		use crate::config::Protocol;
		match self {
			EntryEndpoint::ChatCompletions => Protocol::OpenaiChat,
			EntryEndpoint::Messages => Protocol::AnthropicMessages,
			EntryEndpoint::Responses => Protocol::OpenaiResponses,
		}
	}
}

/// Request-scoped metadata threaded through the pipeline (spec §4.5.3,
/// §4.6). Headers are snapshotted once at ingress; downstream components
/// must not re-parse raw headers (spec §4.5 guarantee 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
	#[serde(default)]
	pub client_headers: Option<HashMap<String, String>>,
	#[serde(default)]
	pub client_request_id: Option<String>,
	#[serde(default)]
	pub session_id: Option<String>,
	#[serde(default)]
	pub conversation_id: Option<String>,
	#[serde(default)]
	pub route_hint: Option<String>,
	#[serde(default)]
	pub excluded_provider_keys: Vec<String>,
	#[serde(default)]
	pub provider_protocol: Option<String>,
	#[serde(default)]
	pub server_tool_followup: bool,
	#[serde(default)]
	pub direction: Option<String>,
	#[serde(default)]
	pub stage: Option<String>,
	#[serde(default)]
	pub entry_endpoint: Option<EntryEndpoint>,
}

#[derive(Debug, Clone)]
pub struct ExecutionInput {
	pub request_id: String,
	pub entry_endpoint: EntryEndpoint,
	pub method: String,
	pub headers: HashMap<String, String>,
	pub query: HashMap<String, String>,
	pub body: Value,
	pub metadata: Metadata,
}

pub enum ExecutionBody {
	Json(Value),
	Sse(BoxStream<'static, Result<String, GatewayError>>),
}

impl std::fmt::Debug for ExecutionBody {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ExecutionBody::Json(v) => write!(f, "ExecutionBody::Json({v})"),
			ExecutionBody::Sse(_) => write!(f, "ExecutionBody::Sse(..)"),
		}
	}
}

#[derive(Debug)]
pub struct ExecutionResult {
	pub status: Option<u16>,
	pub headers: HashMap<String, String>,
	pub body: ExecutionBody,
}

impl ExecutionResult {
	pub fn json(body: Value) -> Self {
		Self {
			status: Some(200),
			headers: HashMap::new(),
			body: ExecutionBody::Json(body),
		}
	}
}

/// What the Virtual Router (C6) hands back for one attempt (spec §3
/// "RouterDecision").
#[derive(Debug, Clone)]
pub struct RouterDecision {
	pub provider_payload: Value,
	pub target: RouterTarget,
	pub route_name: Option<String>,
	pub pool: Vec<String>,
	pub process_mode: ProcessMode,
}

#[derive(Debug, Clone)]
pub struct RouterTarget {
	pub provider_key: String,
	pub provider_type: crate::config::Protocol,
	pub outbound_profile: Option<String>,
	pub runtime_key: Option<String>,
	pub compatibility_profile: Option<String>,
	pub default_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
	Passthrough,
	Convert,
}

/// Deterministic, idempotent request-id enhancement (spec §4.5.4, §8
/// round-trip property): embeds `providerId`/`model`/`endpoint` as a
/// suffix, and is a no-op when applied twice with the same inputs because
/// it first checks whether that exact suffix is already present.
pub fn enhance_request_id(
	original: &str,
	provider_id: &str,
	model: &str,
	endpoint: EntryEndpoint,
) -> String {
	let suffix = format!(
		"__{}__{}__{}",
		sanitize_token(provider_id),
		sanitize_token(model),
		endpoint.token()
	);
	if original.ends_with(&suffix) {
		original.to_string()
	} else {
		format!("{original}{suffix}")
	}
}

fn sanitize_token(s: &str) -> String {
	s.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn enhancement_is_idempotent() {
		let once = enhance_request_id("req-1", "openai.main", "gpt-4o", EntryEndpoint::ChatCompletions);
		let twice = enhance_request_id(&once, "openai.main", "gpt-4o", EntryEndpoint::ChatCompletions);
		assert_eq!(once, twice);
	}

	#[test]
	fn enhancement_embeds_the_inputs() {
		let enhanced = enhance_request_id("req-1", "openai.main", "gpt-4o", EntryEndpoint::ChatCompletions);
		assert!(enhanced.contains("openai.main"));
		assert!(enhanced.contains("gpt-4o"));
		assert!(enhanced.starts_with("req-1"));
	}
}
