//! Request Executor (C8, spec §4.5) — "the hardest subsystem". Orchestrates
//! the Virtual Router (C6), Provider Registry (C4), and Response Converter
//! (C7); owns retry/failover, request-id enhancement, and stats.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use serde_json::Value;
use tracing::{info, warn};

use crate::convert::{ConvertContext, RawUpstream, ReentryFn};
use crate::error::GatewayError;
use crate::provider::{ProviderHandle, ResolvedAuth};
use crate::state::GatewayState;
use crate::stats::Usage;
use crate::types::{enhance_request_id, EntryEndpoint, ExecutionBody, ExecutionInput, ExecutionResult, RouterDecision};

#[derive(Clone)]
pub struct Executor {
	state: Arc<GatewayState>,
}

impl Executor {
	pub fn new(state: Arc<GatewayState>) -> Self {
		Self { state }
	}

	/// `execute(input) -> ExecutionResult`, spec §4.5's three guarantees:
	/// exactly-once completion, a stable stats-facing request id, and
	/// headers/session metadata snapshotted once at ingress.
	pub async fn execute(&self, mut input: ExecutionInput) -> Result<ExecutionResult, GatewayError> {
		let stats_request_id = input.request_id.clone();
		self.state.stats.record_request_start(&stats_request_id).await;

		let body0 = crate::json::sanitize_clone(&input.body);
		let mut excluded: HashSet<String> = input.metadata.excluded_provider_keys.iter().cloned().collect();
		let mut attempt: u32 = 0;
		let mut max_attempts: u32 = self.state.settings.max_attempts_for_family("");
		let mut first_error: Option<GatewayError> = None;

		loop {
			attempt += 1;
			input.body = body0.clone();

			let decision = match self.state.router.decide(&input, &excluded).await {
				Ok(d) => d,
				Err(e) => {
					// no provider target at all: terminal, still counts as one
					// completion against the stable stats id (spec §8 property 1).
					self.state.stats.record_completion(&stats_request_id, true, None).await;
					return Err(e);
				},
			};

			let provider_key = decision.target.provider_key.clone();
			let pool_size = decision.pool.len().max(1);
			let target_runtime = self.state.registry.lookup(&provider_key).await;
			if let Some(handle) = &target_runtime {
				max_attempts = max_attempts.max(self.state.settings.max_attempts_for_family(&handle.runtime.provider_family));
			}

			match self.attempt_once(&mut input, &decision, &stats_request_id).await {
				Ok(mut result) => {
					let usage = extract_usage(&result);
					self.state.stats.record_completion(&stats_request_id, false, usage).await;
					self.state.health.record_success(&provider_key).await;
					self.state.quota.record_success(&provider_key, 0).await;
					attach_session_headers(&mut result, &input);
					info!(provider_key, attempt, "executor.execute succeeded");
					return Ok(result);
				},
				Err(err) => {
					self.state.stats.record_completion(&stats_request_id, true, None).await;
					self.state.health.record_error(&provider_key, err.to_string()).await;
					self.state.quota.record_error(&provider_key).await;

					if first_error.is_none() {
						first_error = Some(err.clone());
					}

					if attempt >= max_attempts || !err.retryable() {
						warn!(provider_key, attempt, error = %err, "executor.execute exhausted retry budget");
						return Err(first_error.unwrap_or(err));
					}

					if pool_size == 1 && is_network_transport(&err) {
						let timeout_ms = target_runtime.as_ref().map(|h| h.runtime.timeout_ms).unwrap_or(30_000);
						let delay = backoff_delay(attempt, self.state.settings.env.retry_delay_ms, timeout_ms);
						tokio::time::sleep(delay).await;
					} else {
						excluded.insert(provider_key);
					}
					continue;
				},
			}
		}
	}

	async fn attempt_once(
		&self,
		input: &mut ExecutionInput,
		decision: &RouterDecision,
		stats_request_id: &str,
	) -> Result<ExecutionResult, GatewayError> {
		let handle = self
			.state
			.registry
			.lookup(&decision.target.provider_key)
			.await
			.ok_or_else(|| GatewayError::ErrProviderNotFound(decision.target.provider_key.clone()))?;

		let model = decision.target.default_model.clone().unwrap_or_else(|| "default".to_string());
		let enhanced_id =
			enhance_request_id(stats_request_id, &decision.target.provider_key, &model, input.entry_endpoint);

		if matches!(input.entry_endpoint, EntryEndpoint::Responses) {
			// rebind: tie the tool-loop capture to the enhanced id (spec §4.5.1).
			input.metadata.conversation_id =
				input.metadata.conversation_id.clone().or_else(|| Some(enhanced_id.clone()));
		}
		input.request_id = enhanced_id.clone();

		let wants_stream = decision.provider_payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
		let raw = send_upstream(&handle, &self.state.oauth, &decision.provider_payload, wants_stream).await?;

		let ctx = ConvertContext {
			entry_endpoint: input.entry_endpoint,
			request_id: enhanced_id,
			provider_protocol: decision.target.provider_type,
			original_model_id: decision.target.default_model.clone(),
			compatibility_profile: decision.target.compatibility_profile.clone(),
			route_name: decision.route_name.clone(),
			parent_metadata: input.metadata.clone(),
		};
		self.state.converter.convert(&ctx, raw, decision.process_mode, self.reentry_fn()).await
	}

	fn reentry_fn(&self) -> ReentryFn {
		let this = self.clone();
		Arc::new(move |nested_input: ExecutionInput| {
			let this = this.clone();
			Box::pin(async move { this.execute(nested_input).await })
		})
	}
}

async fn send_upstream(
	handle: &ProviderHandle,
	oauth: &crate::oauth::OAuthTokenManager,
	payload: &Value,
	wants_stream: bool,
) -> Result<RawUpstream, GatewayError> {
	let bearer = match &handle.runtime.auth {
		ResolvedAuth::ApiKey { bearer } => bearer.expose_secret().to_string(),
		ResolvedAuth::OAuth { auth_id } => oauth.resolve_token(auth_id).await?,
	};

	let path = handle.runtime.endpoint.clone().unwrap_or_default();
	let url = format!("{}{}", handle.runtime.base_url, path);
	let mut request = handle.client.post(&url).bearer_auth(bearer).json(payload);
	for (key, value) in &handle.runtime.headers {
		request = request.header(key, value);
	}

	let response = request.send().await.map_err(classify_reqwest_error)?;
	let status = response.status();

	if status.as_u16() == 429 {
		return Err(GatewayError::Http429);
	}
	if status.is_server_error() {
		return Err(GatewayError::Http5xx(status.as_u16()));
	}
	if status.is_client_error() {
		let body = response.text().await.unwrap_or_default();
		return Err(GatewayError::Http4xx(status.as_u16(), body));
	}

	if wants_stream {
		Ok(RawUpstream::Sse(crate::sse::decode_sse_response(response)))
	} else {
		let body: Value = response.json().await.map_err(|e| GatewayError::NetworkError(e.to_string()))?;
		Ok(RawUpstream::Json(body))
	}
}

fn classify_reqwest_error(e: reqwest::Error) -> GatewayError {
	if e.is_timeout() {
		GatewayError::Timeout
	} else if e.is_connect() {
		GatewayError::ConnectionTimeout
	} else {
		GatewayError::NetworkError(e.to_string())
	}
}

fn is_network_transport(err: &GatewayError) -> bool {
	matches!(
		err,
		GatewayError::NetworkError(_) | GatewayError::Timeout | GatewayError::ConnectionTimeout
	)
}

/// Exponential backoff with jitter (spec §4.5.3), starting at `base_ms`,
/// doubling per attempt, capped at ten seconds so a single-provider pool
/// never stalls a request indefinitely.
fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
	let cap = cap_ms.max(1);
	let exp = base_ms.saturating_mul(1u64 << attempt.min(10).saturating_sub(1).max(0));
	let capped = exp.min(cap);
	let jitter = (capped / 4).max(1);
	// spec §4.5.3: never wait longer than the provider's configured timeout.
	let jittered = capped.saturating_add(fastrand_jitter(jitter)).min(cap);
	Duration::from_millis(jittered.max(1))
}

/// Small jitter source; this crate does not need a general RNG elsewhere,
/// so `rand` is reached for only here rather than hand-rolling one.
fn fastrand_jitter(bound: u64) -> u64 {
	use rand::Rng;
	rand::rng().random_range(0..=bound)
}

fn extract_usage(result: &ExecutionResult) -> Option<Usage> {
	let ExecutionBody::Json(body) = &result.body else {
		return None;
	};
	let usage = body.get("usage")?;
	Some(Usage {
		prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
		completion_tokens: usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
		total_tokens: usage.get("total_tokens").and_then(Value::as_u64).unwrap_or(0),
	})
}

/// Spec §4.7: attach `session_id`/`conversation_id` headers on success if
/// not already present, defaulting `conversation_id` to the session id.
fn attach_session_headers(result: &mut ExecutionResult, input: &ExecutionInput) {
	if let Some(session_id) = &input.metadata.session_id {
		result.headers.entry("session_id".to_string()).or_insert_with(|| session_id.clone());
		let conversation_id = input.metadata.conversation_id.clone().unwrap_or_else(|| session_id.clone());
		result.headers.entry("conversation_id".to_string()).or_insert(conversation_id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{AuthConfig, GatewayConfig, Protocol, ProviderMetadata, ProviderProfile, Settings, Transport};
	use crate::types::Metadata;
	use std::collections::HashMap;

	fn settings_with(providers: HashMap<String, ProviderProfile>) -> Settings {
		Settings::from_config(GatewayConfig {
			host: "127.0.0.1".to_string(),
			port: 0,
			providers,
			auth_mappings: HashMap::new(),
			session_dir: std::env::temp_dir().join(format!("routecodex-exec-test-{}", uuid::Uuid::new_v4())),
			env: Default::default(),
		})
	}

	fn api_key_profile(id: &str, base_url: &str) -> ProviderProfile {
		ProviderProfile {
			id: id.to_string(),
			protocol: Protocol::OpenaiChat,
			transport: Transport {
				base_url: base_url.to_string(),
				endpoint: Some("/v1/chat/completions".to_string()),
				headers: HashMap::new(),
				timeout_ms: 5_000,
				max_retries: None,
				max_pool_size: None,
			},
			compatibility_profile: None,
			metadata: ProviderMetadata::default(),
			module_type: None,
			auth: AuthConfig::ApiKey {
				value: Some("sk-test".to_string()),
				secret_ref: None,
				raw_type: None,
			},
			provider_family: None,
			model_aliases: vec![],
		}
	}

	fn chat_input(body: Value) -> ExecutionInput {
		ExecutionInput {
			request_id: "req-1".to_string(),
			entry_endpoint: EntryEndpoint::ChatCompletions,
			method: "POST".to_string(),
			headers: HashMap::new(),
			query: HashMap::new(),
			body,
			metadata: Metadata::default(),
		}
	}

	#[tokio::test]
	async fn s1_happy_path_records_one_start_and_one_completion() {
		let server = wiremock::MockServer::start().await;
		wiremock::Mock::given(wiremock::matchers::method("POST"))
			.respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"choices": [{"message": {"role": "assistant", "content": "hello"}}],
				"usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6},
			})))
			.mount(&server)
			.await;

		let mut providers = HashMap::new();
		providers.insert("openai.main".to_string(), api_key_profile("openai.main", &server.uri()));
		let state = GatewayState::bootstrap(settings_with(providers)).await;
		let executor = Executor::new(state.clone());

		let result = executor
			.execute(chat_input(serde_json::json!({"model": "gpt-4o", "messages": []})))
			.await
			.unwrap();
		match result.body {
			ExecutionBody::Json(v) => assert_eq!(v["choices"][0]["message"]["content"], "hello"),
			_ => panic!("expected json"),
		}
		assert_eq!(state.stats.started_count().await, 1);
		assert_eq!(state.stats.completions_for("req-1").await.len(), 1);
	}

	#[tokio::test]
	async fn s2_429_then_success_fails_over_and_excludes_the_first_provider() {
		let server_a = wiremock::MockServer::start().await;
		wiremock::Mock::given(wiremock::matchers::method("POST"))
			.respond_with(wiremock::ResponseTemplate::new(429))
			.mount(&server_a)
			.await;
		let server_b = wiremock::MockServer::start().await;
		wiremock::Mock::given(wiremock::matchers::method("POST"))
			.respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"choices": [{"message": {"role": "assistant", "content": "from b"}}],
				"usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
			})))
			.mount(&server_b)
			.await;

		let mut providers = HashMap::new();
		providers.insert("openai.a".to_string(), api_key_profile("openai.a", &server_a.uri()));
		providers.insert("openai.b".to_string(), api_key_profile("openai.b", &server_b.uri()));
		let state = GatewayState::bootstrap(settings_with(providers)).await;
		let executor = Executor::new(state.clone());

		let result = executor
			.execute(chat_input(serde_json::json!({"model": "gpt-4o", "messages": []})))
			.await
			.unwrap();
		match result.body {
			ExecutionBody::Json(v) => assert_eq!(v["choices"][0]["message"]["content"], "from b"),
			_ => panic!("expected json"),
		}
		assert_eq!(state.stats.completions_for("req-1").await.len(), 2);
	}
}
