//! Codec / Protocol plugin layer (spec §4.1).
//!
//! A codec encodes/decodes/validates framed messages of one wire format and
//! dispatches them to a handler keyed by `message.type`. Every codec carries
//! the same lifecycle state machine as an [`crate::adapter::Adapter`]
//! (`uninitialized -> initialized -> started -> stopped -> (cleanup) ->
//! uninitialized`) and the same built-in handler table (`echo`, `info`,
//! `stats`) so that any wire format gets introspection for free.

mod json;
mod stats;

pub use json::JsonCodec;
pub use stats::CodecStats;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};

/// A message flowing through a codec: a type tag plus an opaque JSON payload.
/// Per §9's design note, messages are tagged variants with a schema, not raw
/// untyped maps.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
	#[serde(rename = "type")]
	pub message_type: String,
	pub payload: serde_json::Value,
}

impl Envelope {
	pub fn new(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
		Self {
			message_type: message_type.into(),
			payload,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
	Encode,
	Decode,
	Validate,
	Compression,
	Encryption,
	Streaming,
	Bidirectional,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
	Uninitialized,
	Initialized,
	Started,
	Stopped,
}

/// Result of a pure, side-effect-free [`Codec::validate`] call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Validation {
	pub valid: bool,
	pub errors: Vec<String>,
	pub warnings: Vec<String>,
}

impl Validation {
	pub fn ok() -> Self {
		Self {
			valid: true,
			errors: Vec::new(),
			warnings: Vec::new(),
		}
	}

	pub fn invalid(errors: Vec<String>) -> Self {
		Self {
			valid: false,
			errors,
			warnings: Vec::new(),
		}
	}
}

/// A registered handler: takes the decoded envelope, returns a response
/// envelope.
pub type Handler = Arc<dyn Fn(Envelope) -> Result<Envelope> + Send + Sync>;

/// Contract every wire-format plugin implements (spec §4.1).
#[async_trait]
pub trait Codec: Send + Sync {
	fn name(&self) -> &str;

	fn encode(&self, message: &Envelope) -> Result<Vec<u8>>;
	fn decode(&self, bytes: &[u8]) -> Result<Envelope>;
	fn validate(&self, message: &Envelope) -> Validation;

	/// Looks up a handler by `message.type`; fails with `NoHandler` if none
	/// registered.
	async fn dispatch(&self, message: Envelope) -> Result<Envelope>;

	fn capabilities(&self) -> HashSet<Capability>;

	fn state(&self) -> PluginState;
	async fn initialize(&self) -> Result<()>;
	async fn start(&self) -> Result<()>;
	async fn stop(&self) -> Result<()>;

	fn stats(&self) -> CodecStats;
}

/// Shared helper implementing the lifecycle state machine, statistics, and
/// built-in handler table every codec composes in (per §9: sharable helper
/// structs composed in, not a base-class hierarchy).
pub struct CodecCore {
	name: String,
	state: RwLock<PluginState>,
	handlers: RwLock<HashMap<String, Handler>>,
	stats: stats::StatsInner,
}

impl CodecCore {
	pub fn new(name: impl Into<String>) -> Arc<Self> {
		let name = name.into();
		let handlers = builtin_handlers(&name);
		let stats = stats::StatsInner::new(name.clone());
		Arc::new(Self {
			name,
			state: RwLock::new(PluginState::Uninitialized),
			handlers: RwLock::new(handlers),
			stats,
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub async fn state(&self) -> PluginState {
		*self.state.read().await
	}

	/// Point-in-time snapshot without awaiting; used by synchronous trait
	/// accessors. The lifecycle lock is only ever held briefly during a
	/// transition, so this practically never falls back to `Uninitialized`.
	pub fn try_state(&self) -> PluginState {
		self.state.try_read().map(|s| *s).unwrap_or(PluginState::Uninitialized)
	}

	pub async fn register_handler(&self, message_type: impl Into<String>, handler: Handler) {
		self.handlers.write().await.insert(message_type.into(), handler);
	}

	pub async fn dispatch(&self, message: Envelope) -> Result<Envelope> {
		// Built-ins are served directly so they can see live stats without a
		// circular Arc reference into the handler table.
		match message.message_type.as_str() {
			"echo" => return Ok(Envelope::new("echo", message.payload)),
			"info" => {
				return Ok(Envelope::new(
					"info",
					serde_json::json!({ "name": self.name, "stats": self.stats() }),
				));
			},
			"stats" => {
				let payload = serde_json::to_value(self.stats()).map_err(|e| GatewayError::EncodeError(e.to_string()))?;
				return Ok(Envelope::new("stats", payload));
			},
			_ => {},
		}
		let handlers = self.handlers.read().await;
		let handler = handlers
			.get(&message.message_type)
			.cloned()
			.ok_or_else(|| GatewayError::NoHandler(message.message_type.clone()))?;
		drop(handlers);
		handler(message)
	}

	pub async fn transition(&self, target: PluginState) -> Result<()> {
		let mut state = self.state.write().await;
		let valid = matches!(
			(*state, target),
			(PluginState::Uninitialized, PluginState::Initialized)
				| (PluginState::Initialized, PluginState::Started)
				| (PluginState::Started, PluginState::Stopped)
				| (PluginState::Stopped, PluginState::Uninitialized)
		);
		if !valid {
			return Err(GatewayError::Internal(format!(
				"invalid codec transition {:?} -> {:?}",
				*state, target
			)));
		}
		*state = target;
		Ok(())
	}

	pub fn stats(&self) -> CodecStats {
		self.stats.snapshot()
	}

	pub fn record_encode(&self, bytes: usize) {
		self.stats.record_encode(bytes);
	}

	pub fn record_decode(&self, bytes: usize) {
		self.stats.record_decode(bytes);
	}

	pub fn record_validation_error(&self) {
		self.stats.increment_validation_errors();
	}

	pub fn record_encode_error(&self) {
		self.stats.increment_encode_errors();
	}

	pub fn record_decode_error(&self) {
		self.stats.increment_decode_errors();
	}

	pub fn record_processing(&self, nanos: u64) {
		self.stats.record_processing(nanos);
	}
}

/// `echo`/`info`/`stats` are served directly by [`CodecCore::dispatch`]; this
/// seeds an empty table for everything else a concrete codec registers.
fn builtin_handlers(_name: &str) -> HashMap<String, Handler> {
	HashMap::new()
}
