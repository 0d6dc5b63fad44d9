//! Secret Resolver (C1, spec §4.1).
//!
//! Turns a credential reference (literal, `${ENV_VAR}`, or `authfile-<id>`)
//! into a live bearer string. Mirrors the small hand-rolled
//! `Arc<RwLock<...>>` cache shape the teacher uses for short-lived lookup
//! state (`src/authn.rs`'s `MutableKey`) rather than reaching for an external
//! cache crate for something this size.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::AuthFileRef;
use crate::error::GatewayError;
use crate::oauth::OAuthTokenManager;

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

static ENV_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]+$").unwrap());

#[derive(Default)]
struct CacheEntry {
	value: String,
	at: Instant,
}

pub struct SecretResolver {
	auth_mappings: RwLock<HashMap<String, AuthFileRef>>,
	cache: RwLock<HashMap<String, CacheEntry>>,
}

impl SecretResolver {
	pub fn new(auth_mappings: HashMap<String, AuthFileRef>) -> Self {
		Self {
			auth_mappings: RwLock::new(auth_mappings),
			cache: RwLock::new(HashMap::new()),
		}
	}

	pub fn add_auth_mapping(&self, id: String, reference: AuthFileRef) {
		self.auth_mappings.write().unwrap().insert(id, reference);
		self.clear_cache();
	}

	pub fn clear_cache(&self) {
		self.cache.write().unwrap().clear();
	}

	/// Resolves `reference` to a live secret string, consulting the 5-minute
	/// cache first. OAuth-bearing auth files are delegated to `oauth` for
	/// refresh-aware resolution rather than returned as a static string.
	pub async fn resolve(
		&self,
		reference: &str,
		oauth: &OAuthTokenManager,
	) -> Result<String, GatewayError> {
		if let Some(hit) = self.cached(reference) {
			return Ok(hit);
		}

		let resolved = self.resolve_uncached(reference, oauth).await?;
		self
			.cache
			.write()
			.unwrap()
			.insert(reference.to_string(), CacheEntry {
				value: resolved.clone(),
				at: Instant::now(),
			});
		Ok(resolved)
	}

	fn cached(&self, reference: &str) -> Option<String> {
		let cache = self.cache.read().unwrap();
		let entry = cache.get(reference)?;
		if entry.at.elapsed() < CACHE_TTL {
			Some(entry.value.clone())
		} else {
			None
		}
	}

	async fn resolve_uncached(
		&self,
		reference: &str,
		oauth: &OAuthTokenManager,
	) -> Result<String, GatewayError> {
		let env_name = reference
			.strip_prefix("${")
			.and_then(|s| s.strip_suffix('}'))
			.unwrap_or(reference);

		if ENV_NAME.is_match(env_name) {
			return std::env::var(env_name)
				.map_err(|_| GatewayError::ConfigMissingEnv(env_name.to_string()));
		}

		if let Some(auth_id) = reference.strip_prefix("authfile-") {
			return self.resolve_authfile(auth_id, oauth).await;
		}

		Ok(reference.to_string())
	}

	async fn resolve_authfile(
		&self,
		auth_id: &str,
		oauth: &OAuthTokenManager,
	) -> Result<String, GatewayError> {
		let path = {
			let mappings = self.auth_mappings.read().unwrap();
			mappings
				.get(auth_id)
				.map(|r| r.path.clone())
				.ok_or_else(|| GatewayError::SecretNotFound(format!("authfile-{auth_id}")))?
		};

		let text = tokio::fs::read_to_string(&path)
			.await
			.map_err(|e| GatewayError::SecretFileUnreadable(format!("{}: {e}", path.display())))?;

		if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
			return extract_json_field(&value, auth_id, oauth).await;
		}

		let trimmed = text.trim();
		if trimmed.is_empty() {
			return Err(GatewayError::SecretNoField(auth_id.to_string()));
		}
		Ok(trimmed.to_string())
	}
}

/// Field priority from spec §4.1: the first of these present wins, and an
/// `access_token` field means this file is actually an OAuth token that
/// should be resolved (and refreshed, if needed) through `oauth`.
async fn extract_json_field(
	value: &serde_json::Value,
	auth_id: &str,
	oauth: &OAuthTokenManager,
) -> Result<String, GatewayError> {
	for field in ["token", "apiKey", "bearer_token", "accessToken"] {
		if let Some(v) = value.get(field).and_then(|v| v.as_str()) {
			return Ok(v.to_string());
		}
	}
	if value.get("access_token").is_some() {
		return oauth.resolve_token(auth_id).await;
	}
	Err(GatewayError::SecretNoField(auth_id.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn resolves_literal_passthrough() {
		let resolver = SecretResolver::new(HashMap::new());
		let oauth = OAuthTokenManager::new();
		let got = resolver.resolve("sk-literal-value", &oauth).await.unwrap();
		assert_eq!(got, "sk-literal-value");
	}

	#[tokio::test]
	async fn resolves_env_var() {
		unsafe {
			std::env::set_var("ROUTECODEX_TEST_SECRET", "abc123");
		}
		let resolver = SecretResolver::new(HashMap::new());
		let oauth = OAuthTokenManager::new();
		let got = resolver
			.resolve("ROUTECODEX_TEST_SECRET", &oauth)
			.await
			.unwrap();
		assert_eq!(got, "abc123");
	}

	#[tokio::test]
	async fn missing_env_var_fails_with_config_missing_env() {
		let resolver = SecretResolver::new(HashMap::new());
		let oauth = OAuthTokenManager::new();
		let err = resolver
			.resolve("ROUTECODEX_DEFINITELY_UNSET_XYZ", &oauth)
			.await
			.unwrap_err();
		assert!(matches!(err, GatewayError::ConfigMissingEnv(_)));
	}

	#[tokio::test]
	async fn unmapped_authfile_fails_with_secret_not_found() {
		let resolver = SecretResolver::new(HashMap::new());
		let oauth = OAuthTokenManager::new();
		let err = resolver
			.resolve("authfile-missing", &oauth)
			.await
			.unwrap_err();
		assert!(matches!(err, GatewayError::SecretNotFound(_)));
	}
}
