//! Provider Runtime (C3) and Registry (C4), spec §4.3.

mod registry;

pub use registry::{reload, ProviderRegistry, RegistryInitReport};

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::config::Protocol;

/// Materialised credential, resolved at registry-build time (spec §3 "Auth").
/// The api-key form is kept behind `SecretString` so a stray `{:?}` on a
/// `ProviderRuntimeProfile` (logging, panics) never prints the bearer value.
#[derive(Debug, Clone)]
pub enum ResolvedAuth {
	ApiKey { bearer: SecretString },
	OAuth { auth_id: String },
}

/// The live, materialised form of a `ProviderProfile` (spec §3
/// "ProviderRuntimeProfile").
#[derive(Debug, Clone)]
pub struct ProviderRuntimeProfile {
	pub runtime_key: String,
	pub provider_id: String,
	pub provider_type: Protocol,
	pub provider_family: String,
	pub base_url: String,
	pub endpoint: Option<String>,
	pub headers: std::collections::HashMap<String, String>,
	pub auth: ResolvedAuth,
	pub compatibility_profile: Option<String>,
	pub default_model: Option<String>,
	pub max_retries: Option<u32>,
	pub timeout_ms: u64,
	pub max_pool_size: Option<usize>,
}

/// Ownership of one live provider instance (spec §3 "ProviderHandle").
/// Cheaply cloneable: the `reqwest::Client` inside is itself a cheap
/// `Arc`-backed handle, matching how the teacher shares its http client.
#[derive(Clone)]
pub struct ProviderHandle {
	pub runtime: Arc<ProviderRuntimeProfile>,
	pub client: reqwest::Client,
}

impl ProviderHandle {
	pub fn new(runtime: Arc<ProviderRuntimeProfile>) -> Self {
		let mut builder = reqwest::Client::builder()
			.timeout(Duration::from_millis(runtime.timeout_ms));
		if let Some(max_pool) = runtime.max_pool_size {
			builder = builder.pool_max_idle_per_host(max_pool);
		}
		let client = builder
			.build()
			.unwrap_or_else(|_| reqwest::Client::new());
		Self { runtime, client }
	}
}
