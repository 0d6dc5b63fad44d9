//! Response Converter Adapter (C7). Spec §2 marks the real schema-mapping
//! rules as an opaque external `llmswitch-core` collaborator (non-goal:
//! "upstream protocol-conversion rules"); this module supplies the trait
//! contract plus a default in-process implementation that does the parts
//! the spec *does* fully define — passthrough short-circuiting, the
//! SSE-wrapped-error envelope check, and the server-tool re-entry plumbing
//! (§4.6) — and a minimal best-effort field remap for the rest, so the
//! crate is runnable without a real llmswitch-core behind it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::config::Protocol;
use crate::error::GatewayError;
use crate::json::{find_sse_error_envelope, traverse};
use crate::sse::encode_sse_data;
use crate::types::{EntryEndpoint, ExecutionBody, ExecutionInput, ExecutionResult, Metadata, ProcessMode};

/// Context the executor hands to the converter for one attempt (spec §6
/// "Contract with Response Converter").
#[derive(Debug, Clone)]
pub struct ConvertContext {
	pub entry_endpoint: EntryEndpoint,
	pub request_id: String,
	pub provider_protocol: Protocol,
	pub original_model_id: Option<String>,
	pub compatibility_profile: Option<String>,
	pub route_name: Option<String>,
	pub parent_metadata: Metadata,
}

pub enum RawUpstream {
	Json(Value),
	Sse(BoxStream<'static, Result<Value, GatewayError>>),
}

/// Callback used for server-tool follow-ups (spec §4.6 "Re-entry
/// callback"): a second pipeline pass sharing the parent's stats request id.
pub type ReentryFn =
	Arc<dyn Fn(ExecutionInput) -> BoxFuture<'static, Result<ExecutionResult, GatewayError>> + Send + Sync>;

#[async_trait]
pub trait ResponseConverter: Send + Sync {
	async fn convert(
		&self,
		ctx: &ConvertContext,
		raw: RawUpstream,
		process_mode: ProcessMode,
		reentry: ReentryFn,
	) -> Result<ExecutionResult, GatewayError>;
}

pub struct DefaultResponseConverter;

#[async_trait]
impl ResponseConverter for DefaultResponseConverter {
	async fn convert(
		&self,
		ctx: &ConvertContext,
		raw: RawUpstream,
		process_mode: ProcessMode,
		reentry: ReentryFn,
	) -> Result<ExecutionResult, GatewayError> {
		// passthrough is checked first and short-circuits unconditionally,
		// per the literal ordering in spec §4.6.
		if process_mode == ProcessMode::Passthrough {
			return Ok(raw_to_result(raw));
		}

		match raw {
			RawUpstream::Json(body) => {
				if let Some(message) = find_sse_error_envelope(&body, 2) {
					return Err(GatewayError::SseDecodeError(message));
				}
				if let Some(followup) = server_tool_followup(&body) {
					return run_followup(ctx, followup, reentry).await;
				}
				let converted = remap_json(ctx.provider_protocol, ctx.entry_endpoint, &body);
				Ok(ExecutionResult::json(converted))
			},
			RawUpstream::Sse(frames) => {
				let provider_protocol = ctx.provider_protocol;
				let entry_endpoint = ctx.entry_endpoint;
				let mapped = frames.map(move |frame| {
					frame.map(|value| {
						if value.is_null() {
							encode_sse_data(&Value::Null)
						} else {
							let converted = remap_json(provider_protocol, entry_endpoint, &value);
							encode_sse_data(&converted)
						}
					})
				});
				Ok(ExecutionResult {
					status: Some(200),
					headers: Default::default(),
					body: ExecutionBody::Sse(mapped.boxed()),
				})
			},
		}
	}
}

fn raw_to_result(raw: RawUpstream) -> ExecutionResult {
	match raw {
		RawUpstream::Json(body) => ExecutionResult::json(body),
		RawUpstream::Sse(stream) => ExecutionResult {
			status: Some(200),
			headers: Default::default(),
			body: ExecutionBody::Sse(
				stream
					.map(|frame| frame.map(|v| encode_sse_data(&v)))
					.boxed(),
			),
		},
	}
}

/// Detects a server-tool call in an already-remapped body (glossary
/// "Server-tool follow-up"). Looked for as a `tool_calls`/`tool_use` marker
/// left in place by `remap_json`; returns the nested endpoint to re-enter.
fn server_tool_followup(body: &Value) -> Option<EntryEndpoint> {
	if traverse(body, &["__serverTool", "endpoint"]).is_some() {
		return Some(EntryEndpoint::ChatCompletions);
	}
	None
}

async fn run_followup(
	ctx: &ConvertContext,
	nested_endpoint: EntryEndpoint,
	reentry: ReentryFn,
) -> Result<ExecutionResult, GatewayError> {
	// Nested metadata per spec §4.6: copy the parent, override endpoint and
	// stage markers, drop client-facing identifiers so upstream doesn't see
	// the original client's headers.
	let mut nested_metadata = ctx.parent_metadata.clone();
	nested_metadata.entry_endpoint = Some(nested_endpoint);
	nested_metadata.direction = Some("request".to_string());
	nested_metadata.stage = Some("inbound".to_string());
	nested_metadata.server_tool_followup = true;
	nested_metadata.client_headers = None;
	nested_metadata.client_request_id = None;
	nested_metadata.provider_protocol = nested_metadata
		.provider_protocol
		.or_else(|| Some(format!("{:?}", nested_endpoint.native_protocol())));

	let nested_input = ExecutionInput {
		request_id: ctx.request_id.clone(),
		entry_endpoint: nested_endpoint,
		method: "POST".to_string(),
		headers: Default::default(),
		query: Default::default(),
		body: json!({}),
		metadata: nested_metadata,
	};

	reentry(nested_input)
		.await
		.map_err(|e| GatewayError::ServerToolFailed(e.to_string()))
}

/// Best-effort structural remap between the three inbound protocols,
/// extracting a text reply and usage counters and re-emitting them in the
/// entry endpoint's own shape. The actual per-provider schema rules are out
/// of scope (spec §1 non-goals) — this exists so the default in-process
/// converter produces a well-formed body rather than nothing.
fn remap_json(provider_protocol: Protocol, entry_endpoint: EntryEndpoint, body: &Value) -> Value {
	let (text, usage) = extract_text_and_usage(provider_protocol, body);
	match entry_endpoint {
		EntryEndpoint::ChatCompletions => json!({
			"choices": [{ "index": 0, "message": { "role": "assistant", "content": text }, "finish_reason": "stop" }],
			"usage": usage,
		}),
		EntryEndpoint::Messages => json!({
			"type": "message",
			"role": "assistant",
			"content": [{ "type": "text", "text": text }],
			"usage": usage,
		}),
		EntryEndpoint::Responses => json!({
			"output": [{ "type": "message", "role": "assistant", "content": [{ "type": "output_text", "text": text }] }],
			"usage": usage,
		}),
	}
}

fn extract_text_and_usage(provider_protocol: Protocol, body: &Value) -> (String, Value) {
	match provider_protocol {
		Protocol::OpenaiChat | Protocol::OpenaiResponses => {
			let text = traverse(body, &["choices", "0", "message", "content"])
				.or_else(|| traverse(body, &["output", "0", "content", "0", "text"]))
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_string();
			let usage = traverse(body, &["usage"]).cloned().unwrap_or(json!({
				"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0,
			}));
			(text, usage)
		},
		Protocol::AnthropicMessages => {
			let text = traverse(body, &["content"])
				.and_then(Value::as_array)
				.and_then(|blocks| blocks.iter().find_map(|b| traverse(b, &["text"])))
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_string();
			let input_tokens = traverse(body, &["usage", "input_tokens"]).and_then(Value::as_u64).unwrap_or(0);
			let output_tokens = traverse(body, &["usage", "output_tokens"]).and_then(Value::as_u64).unwrap_or(0);
			let usage = json!({
				"prompt_tokens": input_tokens,
				"completion_tokens": output_tokens,
				"total_tokens": input_tokens + output_tokens,
			});
			(text, usage)
		},
		Protocol::GeminiChat => {
			let text = traverse(body, &["candidates", "0", "content", "parts", "0", "text"])
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_string();
			let prompt = traverse(body, &["usageMetadata", "promptTokenCount"]).and_then(Value::as_u64).unwrap_or(0);
			let completion =
				traverse(body, &["usageMetadata", "candidatesTokenCount"]).and_then(Value::as_u64).unwrap_or(0);
			let usage = json!({
				"prompt_tokens": prompt,
				"completion_tokens": completion,
				"total_tokens": prompt + completion,
			});
			(text, usage)
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ctx(provider_protocol: Protocol, entry_endpoint: EntryEndpoint) -> ConvertContext {
		ConvertContext {
			entry_endpoint,
			request_id: "req-1".to_string(),
			provider_protocol,
			original_model_id: None,
			compatibility_profile: None,
			route_name: None,
			parent_metadata: Metadata::default(),
		}
	}

	fn noop_reentry() -> ReentryFn {
		Arc::new(|_input| Box::pin(async { Ok(ExecutionResult::json(json!({}))) }))
	}

	#[tokio::test]
	async fn passthrough_returns_the_raw_body_unchanged() {
		let converter = DefaultResponseConverter;
		let body = json!({"choices": [{"message": {"content": "hi"}}]});
		let result = converter
			.convert(
				&ctx(Protocol::OpenaiChat, EntryEndpoint::ChatCompletions),
				RawUpstream::Json(body.clone()),
				ProcessMode::Passthrough,
				noop_reentry(),
			)
			.await
			.unwrap();
		match result.body {
			ExecutionBody::Json(v) => assert_eq!(v, body),
			_ => panic!("expected json body"),
		}
	}

	#[tokio::test]
	async fn wrapped_sse_error_envelope_is_fatal_in_convert_mode() {
		let converter = DefaultResponseConverter;
		let body = json!({"mode": "sse", "error": "upstream exploded"});
		let err = converter
			.convert(
				&ctx(Protocol::AnthropicMessages, EntryEndpoint::ChatCompletions),
				RawUpstream::Json(body),
				ProcessMode::Convert,
				noop_reentry(),
			)
			.await
			.unwrap_err();
		assert!(matches!(err, GatewayError::SseDecodeError(_)));
	}

	#[tokio::test]
	async fn remaps_anthropic_body_into_openai_chat_shape() {
		let converter = DefaultResponseConverter;
		let body = json!({
			"content": [{"type": "text", "text": "hello there"}],
			"usage": {"input_tokens": 3, "output_tokens": 2},
		});
		let result = converter
			.convert(
				&ctx(Protocol::AnthropicMessages, EntryEndpoint::ChatCompletions),
				RawUpstream::Json(body),
				ProcessMode::Convert,
				noop_reentry(),
			)
			.await
			.unwrap();
		match result.body {
			ExecutionBody::Json(v) => {
				assert_eq!(v["choices"][0]["message"]["content"], "hello there");
				assert_eq!(v["usage"]["total_tokens"], 5);
			},
			_ => panic!("expected json body"),
		}
	}
}
