//! Configuration schema (ambient stack, SPEC_FULL.md §6).
//!
//! A `type`-tagged top-level config the way the teacher tags its own
//! `Local`/`Xds` variants in `src/main.rs`, deserialized from either
//! `--file` or inline `--config` bytes via `serde_json`/`serde_yaml`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::types::Rule;

/// Deployment posture; gates fail-closed checks run once at startup
/// (SPEC_FULL.md §6).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityPosture {
	#[default]
	Development,
	Staging,
	Production,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
	pub name: String,
	pub kind: String,
	#[serde(default)]
	pub config: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecConfig {
	pub name: String,
	pub kind: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
	pub name: String,
	pub adapter: String,
	pub codec: String,
	#[serde(default = "default_pool_min")]
	pub pool_min_size: usize,
	#[serde(default = "default_pool_max")]
	pub pool_max_size: usize,
}

fn default_pool_min() -> usize {
	1
}

fn default_pool_max() -> usize {
	8
}

/// Crate-wide rate limiter defaults (spec §4.4); a `Rule.rate_limit`/
/// `rate_burst_factor` override takes precedence when set.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitingConfig {
	#[serde(default = "default_rate_limit")]
	pub default_limit: f64,
	#[serde(default = "default_rate_interval_secs")]
	pub interval_secs: f64,
	#[serde(default = "default_rate_burst_factor")]
	pub burst_factor: f64,
}

impl Default for RateLimitingConfig {
	fn default() -> Self {
		Self {
			default_limit: default_rate_limit(),
			interval_secs: default_rate_interval_secs(),
			burst_factor: default_rate_burst_factor(),
		}
	}
}

impl RateLimitingConfig {
	/// Tokens-per-second refill rate derived from `default_limit`/`interval_secs`.
	pub fn refill_per_sec(&self) -> f64 {
		self.default_limit / self.interval_secs
	}
}

fn default_rate_limit() -> f64 {
	10.0
}

fn default_rate_interval_secs() -> f64 {
	1.0
}

fn default_rate_burst_factor() -> f64 {
	1.5
}

/// The security posture inputs spec §6 fail-closed checks gate on: TLS
/// termination, bearer-token authentication, and IP masking are all
/// middleware the core consumes rather than implements (spec §1), but
/// startup still refuses to run in `production` with any of them off.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
	#[serde(default)]
	pub tls_enabled: bool,
	#[serde(default)]
	pub authn_enabled: bool,
	#[serde(default)]
	pub ip_masking_enabled: bool,
	#[serde(default)]
	pub jwt: Option<crate::authn::JwtConfig>,
	#[serde(default)]
	pub rate_limiting: RateLimitingConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfig {
	#[serde(default = "default_admin_host")]
	pub host: String,
	#[serde(default = "default_admin_port")]
	pub port: u16,
}

fn default_admin_host() -> String {
	"127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
	19000
}

/// The full process configuration: every adapter, codec, and bridge this
/// gateway instance hosts, plus firewall rules and the admin surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalConfig {
	#[serde(default)]
	pub posture: SecurityPosture,
	#[serde(default)]
	pub adapters: Vec<AdapterConfig>,
	#[serde(default)]
	pub codecs: Vec<CodecConfig>,
	#[serde(default)]
	pub bridges: Vec<BridgeConfig>,
	#[serde(default)]
	pub firewall_rules: Vec<Rule>,
	#[serde(default)]
	pub security: SecurityConfig,
	#[serde(default)]
	pub admin: AdminConfig,
	#[serde(default = "default_health_interval_secs")]
	pub health_interval_secs: u64,
}

fn default_health_interval_secs() -> u64 {
	15
}

impl LocalConfig {
	pub fn health_interval(&self) -> Duration {
		Duration::from_secs(self.health_interval_secs)
	}

	/// Runs the production fail-closed checks (spec §6/SPEC_FULL.md §6).
	/// Never panics; a violation is reported as `GatewayError::Internal` so
	/// the caller can decide whether to abort startup rather than open a
	/// listener in an insecure posture.
	pub fn validate_posture(&self) -> Result<()> {
		if self.posture != SecurityPosture::Production {
			return Ok(());
		}
		if !self.security.tls_enabled {
			return Err(GatewayError::Internal(
				"production posture refuses to start with TLS disabled".to_string(),
			));
		}
		if !self.security.authn_enabled {
			return Err(GatewayError::Internal(
				"production posture refuses to start with authentication disabled".to_string(),
			));
		}
		if !self.security.ip_masking_enabled {
			return Err(GatewayError::Internal(
				"production posture refuses to start with IP masking disabled".to_string(),
			));
		}
		if self.bridges.is_empty() {
			return Err(GatewayError::Internal(
				"production posture requires at least one configured bridge".to_string(),
			));
		}
		if self.firewall_rules.is_empty() {
			return Err(GatewayError::Internal(
				"production posture requires at least one firewall rule".to_string(),
			));
		}
		for adapter in &self.adapters {
			let has_sensitive = adapter
				.config
				.keys()
				.any(|k| k.to_lowercase().contains("password") || k.to_lowercase().contains("token"));
			let uses_plain_http = adapter.kind == "http" && !adapter.config.get("url").is_some_and(|u| u.starts_with("https://"));
			if has_sensitive && uses_plain_http {
				return Err(GatewayError::Internal(format!(
					"adapter {} carries credentials over a non-https url in production posture",
					adapter.name
				)));
			}
		}
		Ok(())
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Config {
	#[serde(rename = "local")]
	Local(LocalConfig),
}

/// Deserializes `bytes` as JSON first, falling back to YAML; the teacher's
/// own `main.rs` only tries JSON, but a YAML fallback is a natural
/// extension once `serde_yaml` is already a dependency for the admin
/// config surface.
pub fn parse_config(bytes: &str) -> Result<Config> {
	if let Ok(cfg) = serde_json::from_str::<Config>(bytes) {
		return Ok(cfg);
	}
	serde_yaml::from_str(bytes).map_err(|e| GatewayError::BadRequest(format!("invalid config: {e}")))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimal_local_json_config() {
		let json = r#"{"type":"local","adapters":[],"codecs":[],"bridges":[]}"#;
		let Config::Local(local) = parse_config(json).unwrap();
		assert_eq!(local.posture, SecurityPosture::Development);
		assert_eq!(local.health_interval(), Duration::from_secs(15));
	}

	#[test]
	fn parses_yaml_config() {
		let yaml = "type: local\nadapters: []\ncodecs: []\nbridges: []\n";
		let Config::Local(local) = parse_config(yaml).unwrap();
		assert!(local.adapters.is_empty());
	}

	fn empty_config(posture: SecurityPosture) -> LocalConfig {
		LocalConfig {
			posture,
			adapters: Vec::new(),
			codecs: Vec::new(),
			bridges: Vec::new(),
			firewall_rules: Vec::new(),
			security: SecurityConfig::default(),
			admin: AdminConfig::default(),
			health_interval_secs: 15,
		}
	}

	#[test]
	fn production_posture_requires_bridges_and_rules() {
		let mut cfg = empty_config(SecurityPosture::Production);
		cfg.security = SecurityConfig {
			tls_enabled: true,
			authn_enabled: true,
			ip_masking_enabled: true,
			jwt: None,
			rate_limiting: RateLimitingConfig::default(),
		};
		assert!(cfg.validate_posture().is_err());
	}

	#[test]
	fn production_posture_fails_closed_on_disabled_tls() {
		let cfg = empty_config(SecurityPosture::Production);
		let err = cfg.validate_posture().unwrap_err();
		assert!(err.to_string().contains("TLS"));
	}

	#[test]
	fn production_posture_fails_closed_on_disabled_authn() {
		let mut cfg = empty_config(SecurityPosture::Production);
		cfg.security.tls_enabled = true;
		let err = cfg.validate_posture().unwrap_err();
		assert!(err.to_string().contains("authentication"));
	}

	#[test]
	fn production_posture_fails_closed_on_disabled_ip_masking() {
		let mut cfg = empty_config(SecurityPosture::Production);
		cfg.security.tls_enabled = true;
		cfg.security.authn_enabled = true;
		let err = cfg.validate_posture().unwrap_err();
		assert!(err.to_string().contains("IP masking"));
	}

	#[test]
	fn development_posture_skips_checks() {
		let cfg = empty_config(SecurityPosture::Development);
		assert!(cfg.validate_posture().is_ok());
	}
}
