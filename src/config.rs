//! Configuration data model and the immutable `Settings` snapshot (spec §3,
//! SPEC_FULL §3/§9). Mirrors the teacher's `Config::Local(LocalConfig)` /
//! `StaticConfig` split (`src/main.rs`, `src/static.rs`): a file is decoded
//! once into a plain serde struct, then turned into the runtime value the
//! rest of the program actually uses. Reloads build a brand new `Settings`
//! and a brand new registry rather than mutating fields in place (DESIGN
//! NOTES: "Global mutable config").

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Upstream protocol a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
	OpenaiChat,
	OpenaiResponses,
	AnthropicMessages,
	GeminiChat,
}

/// On-disk provider configuration (immutable per reload).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderProfile {
	pub id: String,
	pub protocol: Protocol,
	pub transport: Transport,
	#[serde(default)]
	pub compatibility_profile: Option<String>,
	#[serde(default)]
	pub metadata: ProviderMetadata,
	#[serde(default)]
	pub module_type: Option<String>,
	pub auth: AuthConfig,
	/// vendor family, e.g. "anthropic" served over openai-chat; defaults to
	/// the protocol's own vendor name when absent.
	#[serde(default)]
	pub provider_family: Option<String>,
	/// model aliases that share this profile's runtime, each producing its
	/// own routable `providerKey` of the form `runtimeKey.alias`.
	#[serde(default)]
	pub model_aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transport {
	pub base_url: String,
	#[serde(default)]
	pub endpoint: Option<String>,
	#[serde(default)]
	pub headers: HashMap<String, String>,
	#[serde(default = "default_timeout_ms")]
	pub timeout_ms: u64,
	#[serde(default)]
	pub max_retries: Option<u32>,
	#[serde(default)]
	pub max_pool_size: Option<usize>,
}

fn default_timeout_ms() -> u64 {
	30_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetadata {
	#[serde(default)]
	pub default_model: Option<String>,
	#[serde(default)]
	pub deepseek: Option<bool>,
	#[serde(flatten)]
	pub extra: HashMap<String, serde_json::Value>,
}

/// Credential configuration, tagged per spec §3 "Auth".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AuthConfig {
	ApiKey {
		#[serde(default)]
		value: Option<String>,
		#[serde(default)]
		secret_ref: Option<String>,
		#[serde(default)]
		raw_type: Option<String>,
	},
	OAuth {
		client_id: String,
		#[serde(default)]
		client_secret: Option<String>,
		token_url: String,
		#[serde(default)]
		device_code_url: Option<String>,
		#[serde(default)]
		authorization_url: Option<String>,
		#[serde(default)]
		refresh_url: Option<String>,
		#[serde(default)]
		user_info_url: Option<String>,
		#[serde(default)]
		scopes: Vec<String>,
		token_file: PathBuf,
	},
}

/// A named reference to a credential file for the `authfile-<id>` secret
/// scheme (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFileRef {
	pub path: PathBuf,
}

/// Overrides for the `ROUTECODEX_*` environment variables (spec §6), kept
/// explicit in config so tests never depend on the process environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvOverrides {
	#[serde(default = "default_max_attempts")]
	pub max_provider_attempts: u32,
	#[serde(default = "default_antigravity_max_attempts")]
	pub antigravity_max_provider_attempts: u32,
	#[serde(default = "default_startup_hold_ms")]
	pub startup_hold_ms: u64,
	#[serde(default)]
	pub enable_debugcenter: bool,
	#[serde(default = "default_true")]
	pub quota_enabled: bool,
	#[serde(default)]
	pub hub_policy_mode: HubPolicyMode,
	#[serde(default = "default_retry_delay_ms")]
	pub retry_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
	6
}
fn default_antigravity_max_attempts() -> u32 {
	20
}
fn default_startup_hold_ms() -> u64 {
	120_000
}
fn default_true() -> bool {
	true
}
fn default_retry_delay_ms() -> u64 {
	1_000
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HubPolicyMode {
	Off,
	Observe,
	#[default]
	Enforce,
}

impl Default for EnvOverrides {
	fn default() -> Self {
		Self {
			max_provider_attempts: default_max_attempts(),
			antigravity_max_provider_attempts: default_antigravity_max_attempts(),
			startup_hold_ms: default_startup_hold_ms(),
			enable_debugcenter: false,
			quota_enabled: true,
			hub_policy_mode: HubPolicyMode::default(),
			retry_delay_ms: default_retry_delay_ms(),
		}
	}
}

/// Top-level on-disk gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
	#[serde(default = "default_host")]
	pub host: String,
	#[serde(default = "default_port")]
	pub port: u16,
	pub providers: HashMap<String, ProviderProfile>,
	#[serde(default)]
	pub auth_mappings: HashMap<String, AuthFileRef>,
	#[serde(default = "default_session_dir")]
	pub session_dir: PathBuf,
	#[serde(default)]
	pub env: EnvOverrides,
}

fn default_host() -> String {
	"0.0.0.0".to_string()
}
fn default_port() -> u16 {
	7890
}
fn default_session_dir() -> PathBuf {
	PathBuf::from(".routecodex/sessions")
}

impl GatewayConfig {
	pub fn from_str(text: &str, is_json: bool) -> anyhow::Result<Self> {
		if is_json {
			Ok(serde_json::from_str(text)?)
		} else {
			Ok(serde_yaml::from_str(text)?)
		}
	}
}

/// Immutable settings snapshot built once at startup (or on reload). Holds
/// everything that used to be read ad hoc from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
	pub host: String,
	pub port: u16,
	pub session_dir: PathBuf,
	pub env: EnvOverrides,
	pub providers: HashMap<String, ProviderProfile>,
	pub auth_mappings: HashMap<String, AuthFileRef>,
}

impl Settings {
	pub fn from_config(cfg: GatewayConfig) -> Self {
		Settings {
			host: cfg.host,
			port: cfg.port,
			session_dir: cfg.session_dir,
			env: cfg.env,
			providers: cfg.providers,
			auth_mappings: cfg.auth_mappings,
		}
	}

	/// The attempt budget for a given provider family, per spec §4.5.1: the
	/// Antigravity family gets a lifted cap.
	pub fn max_attempts_for_family(&self, family: &str) -> u32 {
		if family.eq_ignore_ascii_case("antigravity") {
			self.env.antigravity_max_provider_attempts.clamp(1, 60)
		} else {
			self.env.max_provider_attempts.clamp(1, 20)
		}
	}
}
