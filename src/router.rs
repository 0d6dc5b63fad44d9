//! Virtual Router (C6). Spec §2 marks the real router as an external
//! `llmswitch-core` collaborator; SPEC_FULL §4 asks for a default in-process
//! implementation behind the same trait contract so the crate is runnable
//! standalone, with `VirtualRouter` as the seam a real implementation would
//! plug into (see `src/provider/registry.rs` for the analogous registry
//! seam).
//!
//! Contract (spec §6): `execute({endpoint, id, payload,
//! metadata{excludedProviderKeys,…}}) → RouterDecision | ERR_NO_PROVIDER_TARGET`.
//! The router must honour `excludedProviderKeys`, treat `routeHint` as a
//! soft preference, and be deterministic given identical inputs and state.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use tracing::debug;

use crate::error::GatewayError;
use crate::provider::ProviderRegistry;
use crate::store::{HealthStore, QuotaStore, RoutingStateStore};
use crate::store::routing::SessionRoutingState;
use crate::types::{ExecutionInput, ProcessMode, RouterDecision, RouterTarget};

const DEFAULT_ROUTE_NAME: &str = "default";

#[async_trait]
pub trait VirtualRouter: Send + Sync {
	async fn decide(
		&self,
		input: &ExecutionInput,
		excluded: &HashSet<String>,
	) -> Result<RouterDecision, GatewayError>;
}

/// Default in-process router: pool candidates from the live registry,
/// ranked by session stickiness, route hint, health, and quota priority.
pub struct InProcessRouter {
	registry: Arc<ProviderRegistry>,
	quota: Arc<QuotaStore>,
	health: Arc<HealthStore>,
	routing: Arc<RoutingStateStore>,
}

impl InProcessRouter {
	pub fn new(
		registry: Arc<ProviderRegistry>,
		quota: Arc<QuotaStore>,
		health: Arc<HealthStore>,
		routing: Arc<RoutingStateStore>,
	) -> Self {
		Self { registry, quota, health, routing }
	}

	async fn quota_available(&self, provider_key: &str, now_ms: u64) -> bool {
		match self.quota.view(provider_key).await {
			Some(view) => view.is_available(now_ms),
			None => true,
		}
	}

	/// Deterministic ranking: healthy-last-outcome first, then lower
	/// priority-tier first (unset sorts last), then `providerKey` lexically
	/// so ties break the same way on every call.
	async fn rank(&self, candidates: &mut [String]) {
		let mut keyed = Vec::with_capacity(candidates.len());
		for key in candidates.iter() {
			let healthy = self
				.health
				.view(key)
				.await
				.map(|h| h.last_outcome_ok)
				.unwrap_or(true);
			let tier = self.quota.view(key).await.and_then(|v| v.stat.priority_tier);
			keyed.push((key.clone(), healthy, tier));
		}
		let ranked = keyed
			.into_iter()
			.sorted_by(|a, b| {
				b.1.cmp(&a.1)
					.then_with(|| a.2.unwrap_or(u8::MAX).cmp(&b.2.unwrap_or(u8::MAX)))
					.then_with(|| a.0.cmp(&b.0))
			})
			.map(|(key, ..)| key);
		for (slot, key) in candidates.iter_mut().zip(ranked) {
			*slot = key;
		}
	}
}

#[async_trait]
impl VirtualRouter for InProcessRouter {
	async fn decide(
		&self,
		input: &ExecutionInput,
		excluded: &HashSet<String>,
	) -> Result<RouterDecision, GatewayError> {
		let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;

		let mut candidates = Vec::new();
		for key in self.registry.live_provider_keys().await {
			if excluded.contains(&key) {
				continue;
			}
			if self.quota_available(&key, now_ms).await {
				candidates.push(key);
			}
		}

		if candidates.is_empty() {
			return Err(GatewayError::ErrNoProviderTarget);
		}

		self.rank(&mut candidates).await;

		let sticky = match &input.metadata.session_id {
			Some(session_id) => {
				let state = self.routing.load_sync(session_id).await;
				state
					.last_choice
					.get(DEFAULT_ROUTE_NAME)
					.filter(|key| candidates.contains(*key))
					.cloned()
			},
			None => None,
		};

		let preferred = sticky.or_else(|| {
			input
				.metadata
				.route_hint
				.as_ref()
				.filter(|hint| candidates.contains(*hint))
				.cloned()
		});

		if let Some(preferred) = preferred {
			candidates.retain(|k| k != &preferred);
			candidates.insert(0, preferred);
		}

		let target_key = candidates[0].clone();
		let handle = self
			.registry
			.lookup(&target_key)
			.await
			.ok_or_else(|| GatewayError::ErrProviderNotFound(target_key.clone()))?;

		if let Some(session_id) = &input.metadata.session_id {
			let mut state = self.routing.load_sync(session_id).await;
			state.last_choice.insert(DEFAULT_ROUTE_NAME.to_string(), target_key.clone());
			self.save_sticky(session_id, state).await;
		}

		let runtime = &handle.runtime;
		let process_mode = if runtime.provider_type == input.entry_endpoint.native_protocol() {
			ProcessMode::Passthrough
		} else {
			ProcessMode::Convert
		};

		debug!(target_key, pool = candidates.len(), "router.decide");

		Ok(RouterDecision {
			provider_payload: crate::json::sanitize_clone(&input.body),
			target: RouterTarget {
				provider_key: target_key,
				provider_type: runtime.provider_type,
				outbound_profile: runtime.compatibility_profile.clone(),
				runtime_key: Some(runtime.runtime_key.clone()),
				compatibility_profile: runtime.compatibility_profile.clone(),
				default_model: runtime.default_model.clone(),
			},
			route_name: Some(DEFAULT_ROUTE_NAME.to_string()),
			pool: candidates,
			process_mode,
		})
	}
}

impl InProcessRouter {
	async fn save_sticky(&self, session_id: &str, state: SessionRoutingState) {
		self.routing.save_async(session_id, state).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{AuthConfig, Protocol, ProviderMetadata, ProviderProfile, Transport};
	use crate::oauth::OAuthTokenManager;
	use crate::secret::SecretResolver;
	use crate::types::{EntryEndpoint, Metadata};
	use std::collections::HashMap;

	fn profile(id: &str) -> ProviderProfile {
		ProviderProfile {
			id: id.to_string(),
			protocol: Protocol::OpenaiChat,
			transport: Transport {
				base_url: "https://api.example.com".to_string(),
				endpoint: None,
				headers: HashMap::new(),
				timeout_ms: 30_000,
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

	async fn setup(ids: &[&str]) -> (InProcessRouter, Arc<ProviderRegistry>) {
		let registry = Arc::new(ProviderRegistry::empty());
		let secrets = SecretResolver::new(HashMap::new());
		let oauth = Arc::new(OAuthTokenManager::new());
		let mut profiles = HashMap::new();
		for id in ids {
			profiles.insert(id.to_string(), profile(id));
		}
		registry.initialize(&profiles, &secrets, &oauth).await;
		let quota = Arc::new(QuotaStore::new());
		let health = Arc::new(HealthStore::new());
		let routing = Arc::new(RoutingStateStore::new(std::env::temp_dir().join(format!(
			"routecodex-router-test-{}",
			uuid::Uuid::new_v4()
		))));
		let router = InProcessRouter::new(registry.clone(), quota, health, routing);
		(router, registry)
	}

	fn input(body: serde_json::Value, metadata: Metadata) -> ExecutionInput {
		ExecutionInput {
			request_id: "req-1".to_string(),
			entry_endpoint: EntryEndpoint::ChatCompletions,
			method: "POST".to_string(),
			headers: HashMap::new(),
			query: HashMap::new(),
			body,
			metadata,
		}
	}

	#[tokio::test]
	async fn excluded_keys_are_never_chosen() {
		let (router, _registry) = setup(&["openai.a", "openai.b"]).await;
		let mut excluded = HashSet::new();
		excluded.insert("openai.a".to_string());
		let decision = router
			.decide(&input(serde_json::json!({}), Metadata::default()), &excluded)
			.await
			.unwrap();
		assert_eq!(decision.target.provider_key, "openai.b");
	}

	#[tokio::test]
	async fn empty_pool_fails_with_no_provider_target() {
		let (router, _registry) = setup(&["openai.a"]).await;
		let mut excluded = HashSet::new();
		excluded.insert("openai.a".to_string());
		let err = router
			.decide(&input(serde_json::json!({}), Metadata::default()), &excluded)
			.await
			.unwrap_err();
		assert!(matches!(err, GatewayError::ErrNoProviderTarget));
	}

	#[tokio::test]
	async fn route_hint_is_honoured_when_present_in_pool() {
		let (router, _registry) = setup(&["openai.a", "openai.b"]).await;
		let mut metadata = Metadata::default();
		metadata.route_hint = Some("openai.b".to_string());
		let decision = router
			.decide(&input(serde_json::json!({}), metadata), &HashSet::new())
			.await
			.unwrap();
		assert_eq!(decision.target.provider_key, "openai.b");
	}

	#[tokio::test]
	async fn session_stickiness_wins_on_repeat_calls() {
		let (router, _registry) = setup(&["openai.a", "openai.b"]).await;
		let mut metadata = Metadata::default();
		metadata.session_id = Some("session-xyz".to_string());
		let mut excluded = HashSet::new();
		excluded.insert("openai.a".to_string());
		let first = router
			.decide(&input(serde_json::json!({}), metadata.clone()), &excluded)
			.await
			.unwrap();
		assert_eq!(first.target.provider_key, "openai.b");

		let second = router
			.decide(&input(serde_json::json!({}), metadata), &HashSet::new())
			.await
			.unwrap();
		assert_eq!(second.target.provider_key, "openai.b");
	}
}
