//! Routing state store (spec §4.4 "Routing State"): last-chosen providerKey
//! per route, keyed by session, with best-effort persistence under
//! `$SESSION_DIR/session:<id>.json` (spec §6 "Persisted state").

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRoutingState {
	/// route name -> last-chosen providerKey
	pub last_choice: HashMap<String, String>,
}

pub struct RoutingStateStore {
	session_dir: PathBuf,
	cache: RwLock<HashMap<String, SessionRoutingState>>,
	/// when true (shadow-compare mode), `save_async` is a no-op so a
	/// read-only overlay can't double-apply side effects (spec §4.4).
	read_only: bool,
}

impl RoutingStateStore {
	pub fn new(session_dir: PathBuf) -> Self {
		Self {
			session_dir,
			cache: RwLock::new(HashMap::new()),
			read_only: false,
		}
	}

	pub fn read_only_overlay(session_dir: PathBuf) -> Self {
		Self {
			session_dir,
			cache: RwLock::new(HashMap::new()),
			read_only: true,
		}
	}

	fn path_for(&self, key: &str) -> PathBuf {
		self.session_dir.join(format!("session:{key}.json"))
	}

	/// Synchronous-semantics load: serves from the in-memory cache, falling
	/// back to disk on a cache miss (spec calls this `loadSync`; we keep the
	/// name but the implementation is `async` since all I/O in this crate is
	/// cooperative per DESIGN NOTES).
	pub async fn load_sync(&self, key: &str) -> SessionRoutingState {
		if let Some(hit) = self.cache.read().await.get(key) {
			return hit.clone();
		}
		let state = match tokio::fs::read_to_string(self.path_for(key)).await {
			Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
			Err(_) => SessionRoutingState::default(),
		};
		self.cache.write().await.insert(key.to_string(), state.clone());
		state
	}

	pub async fn save_async(&self, key: &str, state: SessionRoutingState) {
		if self.read_only {
			return;
		}
		self.cache.write().await.insert(key.to_string(), state.clone());
		if let Err(e) = self.persist(key, &state).await {
			warn!(key, error = %e, "failed to persist routing state");
		}
	}

	async fn persist(&self, key: &str, state: &SessionRoutingState) -> std::io::Result<()> {
		tokio::fs::create_dir_all(&self.session_dir).await?;
		let body = serde_json::to_vec_pretty(state).unwrap_or_default();
		let path = self.path_for(key);
		let tmp = path.with_extension("tmp");
		tokio::fs::write(&tmp, body).await?;
		tokio::fs::rename(&tmp, &path).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn save_then_load_round_trips() {
		let dir = std::env::temp_dir().join(format!("routecodex-routing-{}", uuid::Uuid::new_v4()));
		let store = RoutingStateStore::new(dir.clone());
		let mut state = SessionRoutingState::default();
		state.last_choice.insert("default".to_string(), "openai.a".to_string());
		store.save_async("session-1", state.clone()).await;

		let store2 = RoutingStateStore::new(dir.clone());
		let loaded = store2.load_sync("session-1").await;
		assert_eq!(loaded.last_choice.get("default"), Some(&"openai.a".to_string()));
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn read_only_overlay_never_persists() {
		let dir = std::env::temp_dir().join(format!("routecodex-routing-ro-{}", uuid::Uuid::new_v4()));
		let store = RoutingStateStore::read_only_overlay(dir.clone());
		let mut state = SessionRoutingState::default();
		state.last_choice.insert("default".to_string(), "openai.a".to_string());
		store.save_async("session-1", state).await;
		assert!(!dir.join("session:session-1.json").exists());
	}
}
