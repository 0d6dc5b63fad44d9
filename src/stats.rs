//! Per-request statistics (spec §4.5, §8 property 1): a stats entry lives
//! from `record_request_start` until exactly one `record_completion`.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct Usage {
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRecord {
	pub error: bool,
	pub usage: Option<Usage>,
}

struct StartedEntry {
	started_at: Instant,
}

pub struct StatsStore {
	started: RwLock<HashMap<String, StartedEntry>>,
	completions: RwLock<HashMap<String, Vec<CompletionRecord>>>,
}

impl StatsStore {
	pub fn new() -> Self {
		Self {
			started: RwLock::new(HashMap::new()),
			completions: RwLock::new(HashMap::new()),
		}
	}

	pub async fn record_request_start(&self, request_id: &str) {
		self.started.write().await.insert(request_id.to_string(), StartedEntry {
			started_at: Instant::now(),
		});
	}

	/// Records one completion for `request_id`. Multiple attempts of the
	/// same client-facing request each contribute one completion record
	/// (spec S2/S4); there is no arity limit here, only the invariant that
	/// every `recordRequestStart` eventually gets at least one.
	pub async fn record_completion(&self, request_id: &str, error: bool, usage: Option<Usage>) {
		if !self.started.read().await.contains_key(request_id) {
			warn!(request_id, "recordCompletion with no matching recordRequestStart");
		}
		self
			.completions
			.write()
			.await
			.entry(request_id.to_string())
			.or_default()
			.push(CompletionRecord { error, usage });
	}

	pub async fn completions_for(&self, request_id: &str) -> Vec<CompletionRecord> {
		self
			.completions
			.read()
			.await
			.get(request_id)
			.cloned()
			.unwrap_or_default()
	}

	pub async fn started_count(&self) -> usize {
		self.started.read().await.len()
	}

	pub async fn elapsed_ms(&self, request_id: &str) -> Option<u128> {
		self
			.started
			.read()
			.await
			.get(request_id)
			.map(|e| e.started_at.elapsed().as_millis())
	}
}
