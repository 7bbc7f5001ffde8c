use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::{Capability, Codec, CodecCore, CodecStats, Envelope, Handler, PluginState, Validation};
use crate::error::{GatewayError, Result};

/// The built-in JSON-over-bytes codec: every [`Envelope`] round-trips through
/// `serde_json`. Registered handlers beyond the built-ins (`echo`/`info`/
/// `stats`) are added with [`JsonCodec::register_handler`].
pub struct JsonCodec {
	core: Arc<CodecCore>,
}

impl JsonCodec {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			core: CodecCore::new(name),
		}
	}

	pub async fn register_handler(&self, message_type: impl Into<String>, handler: Handler) {
		self.core.register_handler(message_type, handler).await;
	}
}

#[async_trait]
impl Codec for JsonCodec {
	fn name(&self) -> &str {
		self.core.name()
	}

	fn encode(&self, message: &Envelope) -> Result<Vec<u8>> {
		let started = Instant::now();
		let bytes = serde_json::to_vec(message).map_err(|e| {
			self.core.record_encode_error();
			GatewayError::EncodeError(e.to_string())
		})?;
		self.core.record_encode(bytes.len());
		self.core.record_processing(started.elapsed().as_nanos() as u64);
		Ok(bytes)
	}

	fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
		let started = Instant::now();
		let envelope: Envelope = serde_json::from_slice(bytes).map_err(|e| {
			self.core.record_decode_error();
			GatewayError::DecodeError(e.to_string())
		})?;
		let validation = self.validate(&envelope);
		if !validation.valid {
			self.core.record_validation_error();
			return Err(GatewayError::ValidationError(validation.errors));
		}
		self.core.record_decode(bytes.len());
		self.core.record_processing(started.elapsed().as_nanos() as u64);
		Ok(envelope)
	}

	fn validate(&self, message: &Envelope) -> Validation {
		if message.message_type.trim().is_empty() {
			return Validation::invalid(vec!["message_type must not be empty".to_string()]);
		}
		Validation::ok()
	}

	async fn dispatch(&self, message: Envelope) -> Result<Envelope> {
		self.core.dispatch(message).await
	}

	fn capabilities(&self) -> HashSet<Capability> {
		HashSet::from([Capability::Encode, Capability::Decode, Capability::Validate])
	}

	fn state(&self) -> PluginState {
		self.core.try_state()
	}

	async fn initialize(&self) -> Result<()> {
		self.core.transition(PluginState::Initialized).await
	}

	async fn start(&self) -> Result<()> {
		self.core.transition(PluginState::Started).await
	}

	async fn stop(&self) -> Result<()> {
		self.core.transition(PluginState::Stopped).await
	}

	fn stats(&self) -> CodecStats {
		self.core.stats()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decode_of_encode_is_identity_for_valid_messages() {
		let codec = JsonCodec::new("json");
		let msg = Envelope::new("echo", serde_json::json!({"x": 1}));
		let bytes = codec.encode(&msg).unwrap();
		let back = codec.decode(&bytes).unwrap();
		assert_eq!(msg, back);
	}

	#[test]
	fn decode_rejects_empty_message_type() {
		let codec = JsonCodec::new("json");
		let bytes = serde_json::to_vec(&serde_json::json!({"type": "", "payload": null})).unwrap();
		let err = codec.decode(&bytes);
		assert!(matches!(err, Err(GatewayError::ValidationError(_))));
	}

	#[test]
	fn decode_of_malformed_bytes_is_decode_error() {
		let codec = JsonCodec::new("json");
		let err = codec.decode(b"not json");
		assert!(matches!(err, Err(GatewayError::DecodeError(_))));
	}

	#[tokio::test]
	async fn echo_round_trip_matches_input() {
		let codec = JsonCodec::new("json");
		let params = serde_json::json!({"x": 1});
		let out = codec.dispatch(Envelope::new("echo", params.clone())).await.unwrap();
		assert_eq!(out.payload, params);
	}

	#[tokio::test]
	async fn stats_track_encode_and_decode_counts() {
		let codec = JsonCodec::new("json");
		let msg = Envelope::new("echo", serde_json::json!({"x": 1}));
		let bytes = codec.encode(&msg).unwrap();
		codec.encode(&msg).unwrap();
		codec.decode(&bytes).unwrap();
		let stats = codec.stats();
		assert_eq!(stats.messages_encoded, 2);
		assert_eq!(stats.messages_decoded, 1);
	}

	#[tokio::test]
	async fn lifecycle_must_initialize_before_start() {
		let codec = JsonCodec::new("json");
		assert!(codec.start().await.is_err());
		codec.initialize().await.unwrap();
		codec.start().await.unwrap();
		assert_eq!(codec.state(), PluginState::Started);
	}
}
