//! Provider Registry (C4): materialises `ProviderProfile`s into
//! `ProviderHandle`s and maintains the `providerKey -> runtimeKey -> handle`
//! maps described in spec §4.3. A reload rebuilds the whole thing and swaps
//! one `Arc<RegistryInner>` pointer, so readers observe either the old or
//! the new registry, never a partially-rebuilt one (spec §5).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::{AuthConfig, ProviderProfile, Settings};
use crate::oauth::OAuthTokenManager;
use crate::provider::{ProviderHandle, ProviderRuntimeProfile, ResolvedAuth};
use crate::secret::SecretResolver;

struct RegistryInner {
	provider_key_to_runtime_key: HashMap<String, String>,
	runtimes: HashMap<String, ProviderHandle>,
	/// providerKeys that failed to initialise; excluded from routing but
	/// retained for diagnostics (spec §3 invariants, §4.3).
	errors: HashMap<String, String>,
}

pub struct ProviderRegistry {
	inner: RwLock<Arc<RegistryInner>>,
}

/// Summary returned from a (re)initialisation pass.
#[derive(Debug, Clone)]
pub struct RegistryInitReport {
	pub live_provider_keys: Vec<String>,
	pub failed_provider_keys: HashMap<String, String>,
}

impl ProviderRegistry {
	pub fn empty() -> Self {
		Self {
			inner: RwLock::new(Arc::new(RegistryInner {
				provider_key_to_runtime_key: HashMap::new(),
				runtimes: HashMap::new(),
				errors: HashMap::new(),
			})),
		}
	}

	/// Materialises every profile in `profiles`, resolving credentials via
	/// `secrets`/`oauth`. Failures are recorded, not raised, so startup can
	/// proceed with a degraded provider set (spec §4.3).
	pub async fn initialize(
		&self,
		profiles: &HashMap<String, ProviderProfile>,
		secrets: &SecretResolver,
		oauth: &Arc<OAuthTokenManager>,
	) -> RegistryInitReport {
		let mut provider_key_to_runtime_key = HashMap::new();
		let mut runtimes: HashMap<String, ProviderHandle> = HashMap::new();
		let mut errors = HashMap::new();

		for (provider_key, profile) in profiles {
			match materialize_runtime(profile, secrets, oauth).await {
				Ok(runtime) => {
					let runtime_key = runtime.runtime_key.clone();
					let runtime = Arc::new(runtime);
					runtimes
						.entry(runtime_key.clone())
						.or_insert_with(|| ProviderHandle::new(runtime.clone()));
					provider_key_to_runtime_key.insert(provider_key.clone(), runtime_key.clone());

					for alias in &profile.model_aliases {
						let alias_key = format!("{runtime_key}.{alias}");
						provider_key_to_runtime_key.insert(alias_key, runtime_key.clone());
					}
				},
				Err(e) => {
					error!(provider_key, error = %e, "provider.runtime.init failed");
					errors.insert(provider_key.clone(), e);
				},
			}
		}

		let report = RegistryInitReport {
			live_provider_keys: provider_key_to_runtime_key.keys().cloned().collect(),
			failed_provider_keys: errors.clone(),
		};

		let new_inner = Arc::new(RegistryInner {
			provider_key_to_runtime_key,
			runtimes,
			errors,
		});
		*self.inner.write().await = new_inner;

		info!(
			live = report.live_provider_keys.len(),
			failed = report.failed_provider_keys.len(),
			"provider registry (re)initialized"
		);
		report
	}

	pub async fn lookup(&self, provider_key: &str) -> Option<ProviderHandle> {
		let inner = self.inner.read().await.clone();
		let runtime_key = inner.provider_key_to_runtime_key.get(provider_key)?;
		inner.runtimes.get(runtime_key).cloned()
	}

	pub async fn is_live(&self, provider_key: &str) -> bool {
		self.lookup(provider_key).await.is_some()
	}

	pub async fn live_provider_keys(&self) -> Vec<String> {
		self
			.inner
			.read()
			.await
			.provider_key_to_runtime_key
			.keys()
			.cloned()
			.collect()
	}

	pub async fn init_errors(&self) -> HashMap<String, String> {
		self.inner.read().await.errors.clone()
	}

	/// Idempotent cleanup; errors are logged and swallowed per spec §4.3.
	pub async fn dispose(&self) {
		let mut inner = self.inner.write().await;
		*inner = Arc::new(RegistryInner {
			provider_key_to_runtime_key: HashMap::new(),
			runtimes: HashMap::new(),
			errors: HashMap::new(),
		});
	}
}

async fn materialize_runtime(
	profile: &ProviderProfile,
	secrets: &SecretResolver,
	oauth: &Arc<OAuthTokenManager>,
) -> Result<ProviderRuntimeProfile, String> {
	let auth = match &profile.auth {
		AuthConfig::ApiKey {
			value, secret_ref, ..
		} => {
			let reference = value
				.clone()
				.or_else(|| secret_ref.clone())
				.ok_or_else(|| "apiKey auth requires value or secretRef".to_string())?;
			let bearer = secrets
				.resolve(&reference, oauth)
				.await
				.map_err(|e| e.to_string())?;
			ResolvedAuth::ApiKey { bearer: secrecy::SecretString::new(bearer.into()) }
		},
		AuthConfig::OAuth { .. } => {
			oauth
				.register(&profile.id, profile.auth.clone())
				.await
				.map_err(|e| e.to_string())?;
			OAuthTokenManager::schedule_refresh(oauth.clone(), profile.id.clone());
			ResolvedAuth::OAuth {
				auth_id: profile.id.clone(),
			}
		},
	};

	let provider_family = profile
		.provider_family
		.clone()
		.unwrap_or_else(|| default_family_for(&profile.protocol).to_string());

	Ok(ProviderRuntimeProfile {
		runtime_key: profile.id.clone(),
		provider_id: profile.id.clone(),
		provider_type: profile.protocol,
		provider_family,
		base_url: normalize_base_url(&profile.transport.base_url),
		endpoint: profile.transport.endpoint.clone(),
		headers: profile.transport.headers.clone(),
		auth,
		compatibility_profile: profile.compatibility_profile.clone(),
		default_model: profile.metadata.default_model.clone(),
		max_retries: profile.transport.max_retries,
		timeout_ms: profile.transport.timeout_ms,
		max_pool_size: profile.transport.max_pool_size,
	})
}

fn normalize_base_url(base_url: &str) -> String {
	base_url.trim_end_matches('/').to_string()
}

fn default_family_for(protocol: &crate::config::Protocol) -> &'static str {
	use crate::config::Protocol::*;
	match protocol {
		OpenaiChat | OpenaiResponses => "openai",
		AnthropicMessages => "anthropic",
		GeminiChat => "gemini",
	}
}

/// Settings affects nothing here directly but keeps the signature explicit
/// about what a reload depends on, per DESIGN NOTES ("Global mutable
/// config"): reload takes the new `Settings` by value rather than mutating
/// a shared one in place.
pub async fn reload(
	registry: &ProviderRegistry,
	settings: &Settings,
	secrets: &SecretResolver,
	oauth: &Arc<OAuthTokenManager>,
) -> RegistryInitReport {
	registry
		.initialize(&settings.providers, secrets, oauth)
		.await
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{ProviderMetadata, Protocol, Transport};
	use std::collections::HashMap as Map;

	fn api_key_profile(id: &str) -> ProviderProfile {
		ProviderProfile {
			id: id.to_string(),
			protocol: Protocol::OpenaiChat,
			transport: Transport {
				base_url: "https://api.openai.com/".to_string(),
				endpoint: None,
				headers: Map::new(),
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
			model_aliases: vec!["gpt-4o".to_string()],
		}
	}

	#[tokio::test]
	async fn initializes_live_provider_and_model_alias() {
		let registry = ProviderRegistry::empty();
		let secrets = SecretResolver::new(Map::new());
		let oauth = Arc::new(OAuthTokenManager::new());
		let mut profiles = Map::new();
		profiles.insert("openai.main".to_string(), api_key_profile("openai.main"));

		let report = registry.initialize(&profiles, &secrets, &oauth).await;
		assert!(report.failed_provider_keys.is_empty());
		assert!(registry.is_live("openai.main").await);
		assert!(registry.is_live("openai.main.gpt-4o").await);
		assert!(!registry.is_live("openai.missing").await);
	}

	#[tokio::test]
	async fn failed_provider_is_recorded_and_excluded() {
		let registry = ProviderRegistry::empty();
		let secrets = SecretResolver::new(Map::new());
		let oauth = Arc::new(OAuthTokenManager::new());
		let mut broken = api_key_profile("openai.broken");
		broken.auth = AuthConfig::ApiKey {
			value: None,
			secret_ref: None,
			raw_type: None,
		};
		let mut profiles = Map::new();
		profiles.insert("openai.broken".to_string(), broken);

		let report = registry.initialize(&profiles, &secrets, &oauth).await;
		assert_eq!(report.live_provider_keys.len(), 0);
		assert!(report.failed_provider_keys.contains_key("openai.broken"));
		assert!(!registry.is_live("openai.broken").await);
	}
}
