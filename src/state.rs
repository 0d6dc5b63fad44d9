//! Composition root output: every long-lived collaborator constructed once
//! at startup (or reload) and shared behind one `Arc<GatewayState>` (DESIGN
//! NOTES: "Singletons" — no `OnceCell` globals, just an explicit value
//! threaded through `main.rs` into the router).

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ProviderProfile, Settings};
use crate::convert::{DefaultResponseConverter, ResponseConverter};
use crate::oauth::OAuthTokenManager;
use crate::provider::{ProviderRegistry, RegistryInitReport, ResolvedAuth};
use crate::router::{InProcessRouter, VirtualRouter};
use crate::secret::SecretResolver;
use crate::stats::StatsStore;
use crate::store::quota::{AuthType, QuotaStatic};
use crate::store::{HealthStore, QuotaStore, RoutingStateStore};

pub struct GatewayState {
	pub settings: Settings,
	pub registry: Arc<ProviderRegistry>,
	pub secrets: Arc<SecretResolver>,
	pub oauth: Arc<OAuthTokenManager>,
	pub quota: Arc<QuotaStore>,
	pub health: Arc<HealthStore>,
	pub routing: Arc<RoutingStateStore>,
	pub stats: Arc<StatsStore>,
	pub router: Arc<dyn VirtualRouter>,
	pub converter: Arc<dyn ResponseConverter>,
}

impl GatewayState {
	pub async fn bootstrap(settings: Settings) -> Arc<Self> {
		let secrets = Arc::new(SecretResolver::new(settings.auth_mappings.clone()));
		let oauth = Arc::new(OAuthTokenManager::new());
		let registry = Arc::new(ProviderRegistry::empty());
		let quota = Arc::new(QuotaStore::new());
		let health = Arc::new(HealthStore::new());
		let routing = Arc::new(RoutingStateStore::new(settings.session_dir.clone()));
		let stats = Arc::new(StatsStore::new());

		let report = registry.initialize(&settings.providers, &secrets, &oauth).await;
		register_quota_and_health(&registry, &quota, &health, &report).await;

		let router: Arc<dyn VirtualRouter> =
			Arc::new(InProcessRouter::new(registry.clone(), quota.clone(), health.clone(), routing.clone()));
		let converter: Arc<dyn ResponseConverter> = Arc::new(DefaultResponseConverter);

		Arc::new(Self {
			settings,
			registry,
			secrets,
			oauth,
			quota,
			health,
			routing,
			stats,
			router,
			converter,
		})
	}

	/// Hot reload (spec §4.3): rebuilds the registry's internal maps
	/// atomically in place and re-registers quota/health for the new set,
	/// without discarding in-flight OAuth/secret caches or stats history.
	pub async fn reload(&self, providers: HashMap<String, ProviderProfile>) -> RegistryInitReport {
		let mut settings = self.settings.clone();
		settings.providers = providers;
		let report = crate::provider::reload(&self.registry, &settings, &self.secrets, &self.oauth).await;
		register_quota_and_health(&self.registry, &self.quota, &self.health, &report).await;
		tracing::info!(
			live = report.live_provider_keys.len(),
			failed = report.failed_provider_keys.len(),
			"registry reload complete"
		);
		report
	}
}

async fn register_quota_and_health(
	registry: &ProviderRegistry,
	quota: &QuotaStore,
	health: &HealthStore,
	report: &RegistryInitReport,
) {
	for provider_key in &report.live_provider_keys {
		if let Some(handle) = registry.lookup(provider_key).await {
			let auth_type = match handle.runtime.auth {
				ResolvedAuth::ApiKey { .. } => AuthType::ApiKey,
				ResolvedAuth::OAuth { .. } => AuthType::OAuth,
			};
			quota
				.register(provider_key, QuotaStatic {
					auth_type,
					priority_tier: None,
					apikey_daily_reset_time: None,
				})
				.await;
		}
	}
	for (provider_key, err) in &report.failed_provider_keys {
		health.record_init_error(provider_key, err.clone()).await;
	}
}
