//! Quota store (spec §4.4 "Quota").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
	ApiKey,
	OAuth,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisableMode {
	Cooldown,
	Blacklist,
}

/// Static facts registered once when a runtime is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatic {
	pub auth_type: AuthType,
	pub priority_tier: Option<u8>,
	pub apikey_daily_reset_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaView {
	pub provider_key: String,
	pub requested_tokens: u64,
	pub consecutive_errors: u32,
	pub last_reset_at: u64,
	pub disabled_until_ms: Option<u64>,
	pub blacklisted: bool,
	pub stat: QuotaStatic,
}

impl QuotaView {
	pub fn is_available(&self, now_ms: u64) -> bool {
		if self.blacklisted {
			return false;
		}
		match self.disabled_until_ms {
			Some(until) => now_ms >= until,
			None => true,
		}
	}
}

struct QuotaEntry {
	requested_tokens: u64,
	consecutive_errors: u32,
	last_reset_at: u64,
	disabled_until_ms: Option<u64>,
	blacklisted: bool,
	stat: QuotaStatic,
}

fn now_ms() -> u64 {
	chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub struct QuotaStore {
	entries: RwLock<HashMap<String, QuotaEntry>>,
}

impl QuotaStore {
	pub fn new() -> Self {
		Self {
			entries: RwLock::new(HashMap::new()),
		}
	}

	pub async fn register(&self, provider_key: &str, stat: QuotaStatic) {
		let mut entries = self.entries.write().await;
		entries.entry(provider_key.to_string()).or_insert(QuotaEntry {
			requested_tokens: 0,
			consecutive_errors: 0,
			last_reset_at: now_ms(),
			disabled_until_ms: None,
			blacklisted: false,
			stat,
		});
	}

	pub async fn record_usage(&self, provider_key: &str, requested_tokens: u64) {
		let mut entries = self.entries.write().await;
		if let Some(entry) = entries.get_mut(provider_key) {
			entry.requested_tokens += requested_tokens;
		}
	}

	pub async fn record_success(&self, provider_key: &str, _used_tokens: u64) {
		let mut entries = self.entries.write().await;
		if let Some(entry) = entries.get_mut(provider_key) {
			entry.consecutive_errors = 0;
		}
	}

	pub async fn record_error(&self, provider_key: &str) {
		let mut entries = self.entries.write().await;
		if let Some(entry) = entries.get_mut(provider_key) {
			entry.consecutive_errors += 1;
		}
	}

	pub async fn disable(&self, provider_key: &str, mode: DisableMode, duration_ms: u64) {
		let mut entries = self.entries.write().await;
		if let Some(entry) = entries.get_mut(provider_key) {
			match mode {
				DisableMode::Cooldown => entry.disabled_until_ms = Some(now_ms() + duration_ms),
				DisableMode::Blacklist => entry.blacklisted = true,
			}
		}
	}

	pub async fn view(&self, provider_key: &str) -> Option<QuotaView> {
		let entries = self.entries.read().await;
		let entry = entries.get(provider_key)?;
		Some(QuotaView {
			provider_key: provider_key.to_string(),
			requested_tokens: entry.requested_tokens,
			consecutive_errors: entry.consecutive_errors,
			last_reset_at: entry.last_reset_at,
			disabled_until_ms: entry.disabled_until_ms,
			blacklisted: entry.blacklisted,
			stat: entry.stat.clone(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn cooldown_disables_until_deadline_then_recovers() {
		let store = QuotaStore::new();
		store
			.register("openai.a", QuotaStatic {
				auth_type: AuthType::ApiKey,
				priority_tier: None,
				apikey_daily_reset_time: None,
			})
			.await;
		store.disable("openai.a", DisableMode::Cooldown, 0).await;
		let view = store.view("openai.a").await.unwrap();
		assert!(view.is_available(now_ms() + 1));
	}

	#[tokio::test]
	async fn blacklist_never_recovers() {
		let store = QuotaStore::new();
		store
			.register("openai.a", QuotaStatic {
				auth_type: AuthType::ApiKey,
				priority_tier: None,
				apikey_daily_reset_time: None,
			})
			.await;
		store.disable("openai.a", DisableMode::Blacklist, 0).await;
		let view = store.view("openai.a").await.unwrap();
		assert!(!view.is_available(now_ms() + 1_000_000));
	}
}
