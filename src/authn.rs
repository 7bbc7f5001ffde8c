//! JWT bearer authentication (ambient stack, SPEC_FULL.md §6).
//!
//! Feeds claims into the firewall's header-rule matching (spec §4.4): the
//! admin surface or inbound handler authenticates the `Authorization`
//! header once, then folds the resulting claims into the
//! [`crate::firewall::MatchContext`] headers the way any other request
//! header would be matched. Grounded on the teacher's
//! `authn::JwtAuthenticator`, stripped of its xDS-sourced JWKS config in
//! favor of an inline or remote-URL JWKS source plain config can express.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::map::Map;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
	#[error("invalid token: {0}")]
	InvalidToken(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum JwkError {
	#[error("failed to fetch jwks: {0}")]
	JwksFetch(#[from] reqwest::Error),
	#[error("failed to read jwks file: {0}")]
	JwksFile(#[from] std::io::Error),
	#[error("failed to parse jwks: {0}")]
	JwksParse(#[from] serde_json::Error),
	#[error("invalid jwk: {0}")]
	InvalidJwk(jsonwebtoken::errors::Error),
	#[error("unsupported jwk algorithm")]
	UnsupportedAlgorithm,
	#[error("invalid authn config: {0}")]
	InvalidConfig(String),
}

/// Where the verification key comes from: inline in config, a local file,
/// or a remote JWKS endpoint refreshed on `refresh_interval`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum JwksSource {
	Inline { jwk: Value },
	File { path: String },
	Remote { url: String, #[serde(default = "default_refresh")] refresh_interval_secs: u64 },
}

fn default_refresh() -> u64 {
	300
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtConfig {
	pub jwks: JwksSource,
	#[serde(default)]
	pub issuer: Vec<String>,
	#[serde(default)]
	pub audience: Vec<String>,
}

/// Wraps a [`DecodingKey`] so a remote JWKS refresh can swap it in place
/// without the caller re-acquiring a new authenticator handle.
struct MutableKey {
	key: DecodingKey,
}

struct RemoteJwks {
	client: reqwest::Client,
	url: String,
	refresh_interval: Duration,
}

impl RemoteJwks {
	async fn fetch(&self) -> Result<Jwk, JwkError> {
		let body = self.client.get(&self.url).send().await?.text().await?;
		Ok(serde_json::from_str(&body)?)
	}
}

pub struct JwtAuthenticator {
	key: Arc<RwLock<MutableKey>>,
	issuer: Option<HashSet<String>>,
	audience: Option<HashSet<String>>,
	remote: Option<RemoteJwks>,
}

impl std::fmt::Debug for JwtAuthenticator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "JwtAuthenticator {{ issuer: {:?}, audience: {:?} }}", self.issuer, self.audience)
	}
}

impl JwtAuthenticator {
	pub async fn new(config: &JwtConfig) -> Result<Self, JwkError> {
		let (jwk, remote) = match &config.jwks {
			JwksSource::Inline { jwk } => (serde_json::from_value::<Jwk>(jwk.clone())?, None),
			JwksSource::File { path } => {
				let file = std::fs::File::open(path)?;
				(serde_json::from_reader(file)?, None)
			},
			JwksSource::Remote { url, refresh_interval_secs } => {
				let client = reqwest::Client::builder()
					.timeout(Duration::from_secs(10))
					.build()
					.map_err(JwkError::JwksFetch)?;
				let remote = RemoteJwks {
					client,
					url: url.clone(),
					refresh_interval: Duration::from_secs(*refresh_interval_secs),
				};
				let jwk = remote.fetch().await?;
				(jwk, Some(remote))
			},
		};
		if !jwk.is_supported() {
			return Err(JwkError::UnsupportedAlgorithm);
		}
		let issuer = (!config.issuer.is_empty()).then(|| config.issuer.iter().cloned().collect());
		let audience = (!config.audience.is_empty()).then(|| config.audience.iter().cloned().collect());
		Ok(Self {
			key: Arc::new(RwLock::new(MutableKey {
				key: DecodingKey::from_jwk(&jwk).map_err(JwkError::InvalidJwk)?,
			})),
			issuer,
			audience,
			remote,
		})
	}

	pub async fn sync_jwks(&self) -> Result<(), JwkError> {
		let Some(remote) = &self.remote else { return Ok(()) };
		let jwk = remote.fetch().await?;
		self.key.write().await.key = DecodingKey::from_jwk(&jwk).map_err(JwkError::InvalidJwk)?;
		Ok(())
	}

	/// Verifies `token`, returning its claims as a flat JSON object. The
	/// raw token is kept alongside the claims (as a [`SecretString`]) so a
	/// caller can thread it through to an outbound adapter without
	/// re-serializing it, without that value ever being logged or
	/// surfaced via `Debug`.
	pub async fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
		let header = decode_header(token)?;
		let mut validation = Validation::new(header.alg);
		validation.aud = self.audience.clone();
		validation.iss = self.issuer.clone();

		let key = self.key.read().await;
		let token_data = decode::<Map<String, Value>>(token, &key.key, &validation)?;
		Ok(Claims {
			fields: token_data.claims,
			raw_token: SecretString::new(token.into()),
		})
	}
}

/// Verified JWT claims, consulted by firewall header rules via
/// [`Claims::get`].
#[derive(Clone)]
pub struct Claims {
	fields: Map<String, Value>,
	raw_token: SecretString,
}

impl Claims {
	pub fn get(&self, name: &str) -> Option<&Value> {
		self.fields.get(name)
	}

	pub fn raw_token(&self) -> &str {
		self.raw_token.expose_secret()
	}
}

impl std::fmt::Debug for Claims {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Claims {{ fields: {:?} }}", self.fields)
	}
}

/// Refreshes a remote JWKS source on its own interval until `ct` cancels,
/// mirroring the teacher's `sync_jwks_loop` `tokio::select!` shape.
pub async fn sync_jwks_loop(authn: Arc<RwLock<Option<JwtAuthenticator>>>, ct: CancellationToken) {
	let interval = {
		let guard = authn.read().await;
		guard
			.as_ref()
			.and_then(|a| a.remote.as_ref())
			.map(|r| r.refresh_interval)
			.unwrap_or(Duration::from_secs(300))
	};
	let mut ticker = tokio::time::interval(interval);
	loop {
		tokio::select! {
			_ = ct.cancelled() => return,
			_ = ticker.tick() => {
				if let Some(authenticator) = authn.read().await.as_ref() {
					if let Err(e) = authenticator.sync_jwks().await {
						tracing::warn!(error = %e, "failed to refresh jwks");
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hmac_jwk() -> Value {
		serde_json::json!({
			"kty": "oct",
			"alg": "HS256",
			"k": base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, b"test-signing-secret-0123456789"),
		})
	}

	fn issue_token(secret: &[u8], claims: serde_json::Value) -> String {
		let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
		jsonwebtoken::encode(&header, &claims, &jsonwebtoken::EncodingKey::from_secret(secret)).unwrap()
	}

	#[tokio::test]
	async fn authenticates_a_validly_signed_token() {
		let config = JwtConfig {
			jwks: JwksSource::Inline { jwk: hmac_jwk() },
			issuer: vec![],
			audience: vec![],
		};
		let authenticator = JwtAuthenticator::new(&config).await.unwrap();
		let token = issue_token(b"test-signing-secret-0123456789", serde_json::json!({"sub": "user-1"}));
		let claims = authenticator.authenticate(&token).await.unwrap();
		assert_eq!(claims.get("sub"), Some(&Value::String("user-1".to_string())));
	}

	#[tokio::test]
	async fn rejects_a_token_signed_with_the_wrong_key() {
		let config = JwtConfig {
			jwks: JwksSource::Inline { jwk: hmac_jwk() },
			issuer: vec![],
			audience: vec![],
		};
		let authenticator = JwtAuthenticator::new(&config).await.unwrap();
		let token = issue_token(b"wrong-secret-wrong-secret-wrong!", serde_json::json!({"sub": "user-1"}));
		let err = authenticator.authenticate(&token).await;
		assert!(err.is_err());
	}

	#[tokio::test]
	async fn rejects_token_with_unexpected_issuer() {
		let config = JwtConfig {
			jwks: JwksSource::Inline { jwk: hmac_jwk() },
			issuer: vec!["expected-issuer".to_string()],
			audience: vec![],
		};
		let authenticator = JwtAuthenticator::new(&config).await.unwrap();
		let token = issue_token(
			b"test-signing-secret-0123456789",
			serde_json::json!({"sub": "user-1", "iss": "someone-else"}),
		);
		let err = authenticator.authenticate(&token).await;
		assert!(err.is_err());
	}
}
