use std::collections::HashMap;

/// Fields that must never be surfaced verbatim via the introspection API
/// (spec §4.2/§9). Centralized here so every adapter consults the same list
/// rather than re-implementing its own redaction.
const SENSITIVE_FIELDS: &[&str] = &["password", "secret", "api_key", "token"];

const REDACTED: &str = "***redacted***";

/// Redacts any config key that case-insensitively matches (or contains, for
/// compound keys like `backend_api_key`) an entry in [`SENSITIVE_FIELDS`].
pub fn redact_config(config: &HashMap<String, String>) -> HashMap<String, String> {
	config
		.iter()
		.map(|(k, v)| {
			let lower = k.to_lowercase();
			if SENSITIVE_FIELDS.iter().any(|f| lower.contains(f)) {
				(k.clone(), REDACTED.to_string())
			} else {
				(k.clone(), v.clone())
			}
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn redacts_known_sensitive_fields() {
		let mut cfg = HashMap::new();
		cfg.insert("password".to_string(), "hunter2".to_string());
		cfg.insert("api_key".to_string(), "abc123".to_string());
		cfg.insert("backend_secret".to_string(), "xyz".to_string());
		cfg.insert("host".to_string(), "example.com".to_string());
		let redacted = redact_config(&cfg);
		assert_eq!(redacted["password"], REDACTED);
		assert_eq!(redacted["api_key"], REDACTED);
		assert_eq!(redacted["backend_secret"], REDACTED);
		assert_eq!(redacted["host"], "example.com");
	}
}
