//! Health store (spec §4.4 "Health"): last outcome per provider, advisory
//! only — the executor never treats it as authoritative, only the router
//! may use it to rank peers.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
	pub provider_key: String,
	pub last_outcome_ok: bool,
	pub last_error: Option<String>,
	pub updated_at_ms: u64,
}

fn now_ms() -> u64 {
	chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub struct HealthStore {
	snapshots: RwLock<HashMap<String, HealthSnapshot>>,
}

impl HealthStore {
	pub fn new() -> Self {
		Self {
			snapshots: RwLock::new(HashMap::new()),
		}
	}

	pub async fn record_success(&self, provider_key: &str) {
		self.snapshots.write().await.insert(provider_key.to_string(), HealthSnapshot {
			provider_key: provider_key.to_string(),
			last_outcome_ok: true,
			last_error: None,
			updated_at_ms: now_ms(),
		});
	}

	pub async fn record_error(&self, provider_key: &str, error: impl Into<String>) {
		self.snapshots.write().await.insert(provider_key.to_string(), HealthSnapshot {
			provider_key: provider_key.to_string(),
			last_outcome_ok: false,
			last_error: Some(error.into()),
			updated_at_ms: now_ms(),
		});
	}

	/// Records a non-fatal startup-time error, e.g. `provider.runtime.init`
	/// (spec §4.3).
	pub async fn record_init_error(&self, provider_key: &str, error: impl Into<String>) {
		self.record_error(provider_key, error).await;
	}

	pub async fn snapshot(&self) -> Vec<HealthSnapshot> {
		self.snapshots.read().await.values().cloned().collect()
	}

	pub async fn view(&self, provider_key: &str) -> Option<HealthSnapshot> {
		self.snapshots.read().await.get(provider_key).cloned()
	}
}
