//! OAuth Token Manager (C2, spec §4.2).
//!
//! Per-`authId` state: cached access token + expiry + refresh token +
//! token-file path + the oauth config needed to refresh it. Refresh is
//! single-flighted per `authId` via a `tokio::sync::Mutex` held for the
//! whole refresh, so a second concurrent resolver blocks on the same lock
//! and observes the refreshed cache entry rather than firing its own HTTP
//! call (spec §8 property 3).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::AuthConfig;
use crate::error::GatewayError;

const REFRESH_SKEW: Duration = Duration::from_secs(5 * 60);

/// Persisted OAuth token, spec §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthToken {
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	pub token_type: String,
	pub expires_in: u64,
	#[serde(default)]
	pub scope: String,
	pub created_at: u64,
}

impl OAuthToken {
	pub fn expires_at_ms(&self) -> u64 {
		self.created_at + self.expires_in * 1000
	}

	pub fn is_within_skew_of(&self, now_ms: u64, skew: Duration) -> bool {
		let skew_ms = skew.as_millis() as u64;
		now_ms + skew_ms >= self.expires_at_ms()
	}
}

fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as u64
}

struct AuthState {
	token: OAuthToken,
	token_file: PathBuf,
	cfg: AuthConfig,
}

/// HTTP transport used to perform the refresh POST; abstracted so tests can
/// substitute a mock without spinning up a real server when that is
/// convenient, while production code uses `reqwest`.
#[async_trait::async_trait]
pub trait OAuthTransport: Send + Sync {
	async fn refresh(
		&self,
		token_url: &str,
		client_id: &str,
		refresh_token: &str,
	) -> Result<(OAuthToken, u64), GatewayError>;
}

pub struct ReqwestOAuthTransport {
	client: reqwest::Client,
}

impl Default for ReqwestOAuthTransport {
	fn default() -> Self {
		Self {
			client: reqwest::Client::new(),
		}
	}
}

#[async_trait::async_trait]
impl OAuthTransport for ReqwestOAuthTransport {
	async fn refresh(
		&self,
		token_url: &str,
		client_id: &str,
		refresh_token: &str,
	) -> Result<(OAuthToken, u64), GatewayError> {
		let form = [
			("grant_type", "refresh_token"),
			("client_id", client_id),
			("refresh_token", refresh_token),
		];
		let resp = self
			.client
			.post(token_url)
			.form(&form)
			.send()
			.await
			.map_err(|e| GatewayError::NetworkError(e.to_string()))?;
		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			return Err(GatewayError::OAuthRefreshFailed {
				status: status.as_u16(),
				body,
			});
		}
		let created = now_ms();
		let mut token: OAuthToken = resp
			.json()
			.await
			.map_err(|e| GatewayError::OAuthRefreshFailed {
				status: status.as_u16(),
				body: e.to_string(),
			})?;
		token.created_at = created;
		Ok((token, created))
	}
}

/// One in-flight-refresh guard per `authId`.
type RefreshLocks = RwLock<HashMap<String, Arc<Mutex<()>>>>;

pub struct OAuthTokenManager {
	states: RwLock<HashMap<String, AuthState>>,
	refresh_locks: RefreshLocks,
	transport: Arc<dyn OAuthTransport>,
	refresh_tasks: std::sync::Mutex<tokio::task::JoinSet<()>>,
}

impl OAuthTokenManager {
	pub fn new() -> Self {
		Self {
			states: RwLock::new(HashMap::new()),
			refresh_locks: RwLock::new(HashMap::new()),
			transport: Arc::new(ReqwestOAuthTransport::default()),
			refresh_tasks: std::sync::Mutex::new(tokio::task::JoinSet::new()),
		}
	}

	pub fn with_transport(transport: Arc<dyn OAuthTransport>) -> Self {
		Self {
			states: RwLock::new(HashMap::new()),
			refresh_locks: RwLock::new(HashMap::new()),
			transport,
			refresh_tasks: std::sync::Mutex::new(tokio::task::JoinSet::new()),
		}
	}

	/// Loads a token file and registers it under `auth_id`, so subsequent
	/// `resolve_token` calls know how to refresh it.
	pub async fn register(
		&self,
		auth_id: &str,
		cfg: AuthConfig,
	) -> Result<(), GatewayError> {
		let AuthConfig::OAuth { ref token_file, .. } = cfg else {
			return Err(GatewayError::Internal(format!(
				"{auth_id} is not an OAuth auth config"
			)));
		};
		let text = tokio::fs::read_to_string(token_file)
			.await
			.map_err(|e| GatewayError::SecretFileUnreadable(format!("{}: {e}", token_file.display())))?;
		let token: OAuthToken = serde_json::from_str(&text)
			.map_err(|e| GatewayError::SecretFileUnreadable(e.to_string()))?;
		self.states.write().await.insert(auth_id.to_string(), AuthState {
			token,
			token_file: token_file.clone(),
			cfg,
		});
		Ok(())
	}

	/// Spawns the proactive refresh schedule for `auth_id` (spec §4.2.1:
	/// "schedule next refresh at `now + expires_in*1000 − 5min`"), tracked
	/// in a `JoinSet` so the manager retains a handle to every background
	/// refresher it has started. Call once, right after a successful
	/// `register`; the loop reschedules itself off each freshly refreshed
	/// token, so a single call keeps the schedule alive for the life of the
	/// manager.
	pub fn schedule_refresh(manager: Arc<Self>, auth_id: String) {
		let loop_manager = manager.clone();
		let mut tasks = manager.refresh_tasks.lock().unwrap();
		tasks.spawn(async move { loop_manager.refresh_loop(auth_id).await });
	}

	async fn refresh_loop(self: Arc<Self>, auth_id: String) {
		loop {
			let wait = {
				let states = self.states.read().await;
				let Some(state) = states.get(&auth_id) else {
					return;
				};
				if state.token.refresh_token.is_none() {
					return;
				}
				let fire_at = state.token.expires_at_ms().saturating_sub(REFRESH_SKEW.as_millis() as u64);
				Duration::from_millis(fire_at.saturating_sub(now_ms()))
			};
			tokio::time::sleep(wait).await;
			match self.resolve_token(&auth_id).await {
				Ok(_) => continue,
				Err(e) => {
					warn!(auth_id, error = %e, "proactive oauth refresh failed; schedule stopped");
					return;
				},
			}
		}
	}

	async fn lock_for(&self, auth_id: &str) -> Arc<Mutex<()>> {
		if let Some(lock) = self.refresh_locks.read().await.get(auth_id) {
			return lock.clone();
		}
		let mut locks = self.refresh_locks.write().await;
		locks
			.entry(auth_id.to_string())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone()
	}

	/// Implements spec §4.2's `resolveToken` state machine.
	pub async fn resolve_token(&self, auth_id: &str) -> Result<String, GatewayError> {
		if let Some(token) = self.fresh_cached(auth_id).await {
			return Ok(token);
		}

		// Single-flight: hold the per-authId lock for the whole refresh so a
		// second concurrent caller waits here, then re-checks the cache.
		let lock = self.lock_for(auth_id).await;
		let _guard = lock.lock().await;

		if let Some(token) = self.fresh_cached(auth_id).await {
			return Ok(token);
		}

		let (token_url, client_id, refresh_token, still_valid) = {
			let states = self.states.read().await;
			let state = states
				.get(auth_id)
				.ok_or_else(|| GatewayError::SecretNotFound(auth_id.to_string()))?;
			let AuthConfig::OAuth {
				ref token_url,
				ref client_id,
				..
			} = state.cfg
			else {
				return Err(GatewayError::Internal(format!(
					"{auth_id} is not an OAuth auth config"
				)));
			};
			let still_valid = !state.token.is_within_skew_of(now_ms(), Duration::ZERO);
			(
				token_url.clone(),
				client_id.clone(),
				state.token.refresh_token.clone(),
				still_valid,
			)
		};

		match refresh_token {
			Some(refresh_token) => {
				let (mut token, created_at) = self
					.transport
					.refresh(&token_url, &client_id, &refresh_token)
					.await?;
				token.created_at = created_at;
				self.persist_and_cache(auth_id, token.clone()).await?;
				Ok(token.access_token)
			},
			None if still_valid => {
				warn!(auth_id, "oauth token nearing expiry with no refresh token; reusing cache");
				let states = self.states.read().await;
				Ok(states.get(auth_id).unwrap().token.access_token.clone())
			},
			None => Err(GatewayError::OAuthExpiredNoRefresh),
		}
	}

	async fn fresh_cached(&self, auth_id: &str) -> Option<String> {
		let states = self.states.read().await;
		let state = states.get(auth_id)?;
		if !state.token.is_within_skew_of(now_ms(), REFRESH_SKEW) {
			Some(state.token.access_token.clone())
		} else {
			None
		}
	}

	/// Atomic write-temp-then-rename persistence per spec §4.2.1.
	async fn persist_and_cache(&self, auth_id: &str, token: OAuthToken) -> Result<(), GatewayError> {
		let token_file = {
			let states = self.states.read().await;
			states
				.get(auth_id)
				.ok_or_else(|| GatewayError::SecretNotFound(auth_id.to_string()))?
				.token_file
				.clone()
		};
		write_token_atomic(&token_file, &token).await?;

		let mut states = self.states.write().await;
		if let Some(state) = states.get_mut(auth_id) {
			state.token = token;
		}
		info!(auth_id, "oauth token refreshed and persisted");
		Ok(())
	}
}

pub async fn write_token_atomic(path: &std::path::Path, token: &OAuthToken) -> Result<(), GatewayError> {
	let body = serde_json::to_vec_pretty(token).map_err(|e| GatewayError::Internal(e.to_string()))?;
	let tmp_path = path.with_extension("tmp");
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent)
			.await
			.map_err(|e| GatewayError::Internal(e.to_string()))?;
	}
	tokio::fs::write(&tmp_path, &body)
		.await
		.map_err(|e| GatewayError::Internal(e.to_string()))?;
	tokio::fs::rename(&tmp_path, path)
		.await
		.map_err(|e| GatewayError::Internal(e.to_string()))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct CountingTransport {
		calls: AtomicUsize,
	}

	#[async_trait::async_trait]
	impl OAuthTransport for CountingTransport {
		async fn refresh(
			&self,
			_token_url: &str,
			_client_id: &str,
			_refresh_token: &str,
		) -> Result<(OAuthToken, u64), GatewayError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(20)).await;
			let created = now_ms();
			Ok((
				OAuthToken {
					access_token: "fresh-token".to_string(),
					refresh_token: Some("refresh-token".to_string()),
					token_type: "Bearer".to_string(),
					expires_in: 3600,
					scope: String::new(),
					created_at: created,
				},
				created,
			))
		}
	}

	async fn manager_with_expiring_token(
		dir: &std::path::Path,
	) -> (OAuthTokenManager, Arc<CountingTransport>) {
		let token_file = dir.join("token.json");
		let token = OAuthToken {
			access_token: "stale".to_string(),
			refresh_token: Some("refresh-token".to_string()),
			token_type: "Bearer".to_string(),
			expires_in: 60, // well within the 5 minute skew
			scope: String::new(),
			created_at: now_ms(),
		};
		write_token_atomic(&token_file, &token).await.unwrap();

		let transport = Arc::new(CountingTransport {
			calls: AtomicUsize::new(0),
		});
		let manager = OAuthTokenManager::with_transport(transport.clone());
		manager
			.register("provider-a", AuthConfig::OAuth {
				client_id: "client".to_string(),
				client_secret: None,
				token_url: "https://example.invalid/token".to_string(),
				device_code_url: None,
				authorization_url: None,
				refresh_url: None,
				user_info_url: None,
				scopes: vec![],
				token_file,
			})
			.await
			.unwrap();
		(manager, transport)
	}

	#[tokio::test]
	async fn refreshes_token_within_skew_and_persists_atomically() {
		let dir = tempdir();
		let (manager, transport) = manager_with_expiring_token(dir.path()).await;

		let token = manager.resolve_token("provider-a").await.unwrap();
		assert_eq!(token, "fresh-token");
		assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

		let reloaded: OAuthToken =
			serde_json::from_str(&std::fs::read_to_string(dir.path().join("token.json")).unwrap())
				.unwrap();
		assert_eq!(reloaded.access_token, "fresh-token");
	}

	#[tokio::test]
	async fn concurrent_resolves_single_flight_the_refresh() {
		let dir = tempdir();
		let (manager, transport) = manager_with_expiring_token(dir.path()).await;
		let manager = Arc::new(manager);

		let a = manager.clone();
		let b = manager.clone();
		let (r1, r2) = tokio::join!(
			tokio::spawn(async move { a.resolve_token("provider-a").await }),
			tokio::spawn(async move { b.resolve_token("provider-a").await }),
		);
		assert_eq!(r1.unwrap().unwrap(), "fresh-token");
		assert_eq!(r2.unwrap().unwrap(), "fresh-token");
		assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
	}

	// Minimal tempdir helper to avoid pulling in the `tempfile` crate for one test module.
	struct TempDir(PathBuf);
	impl TempDir {
		fn path(&self) -> &std::path::Path {
			&self.0
		}
	}
	impl Drop for TempDir {
		fn drop(&mut self) {
			let _ = std::fs::remove_dir_all(&self.0);
		}
	}
	fn tempdir() -> TempDir {
		let dir = std::env::temp_dir().join(format!("routecodex-oauth-test-{}", uuid::Uuid::new_v4()));
		std::fs::create_dir_all(&dir).unwrap();
		TempDir(dir)
	}
}
