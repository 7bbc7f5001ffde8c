//! Adapter layer (spec §4.2): each adapter owns one outbound transport class.

mod http;
mod loopback;
mod redact;

pub use http::HttpAdapter;
pub use loopback::LoopbackAdapter;
pub use redact::redact_config;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::codec::PluginState;
use crate::error::Result;

/// An opaque handle to one outbound transport connection, owned exclusively
/// by a [`crate::pool::ConnectionPool`].
pub type ConnectionHandle = Arc<dyn std::any::Any + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct AdapterStats {
	pub connect_count: u64,
	pub disconnect_count: u64,
	pub bytes_sent: u64,
	pub bytes_received: u64,
	pub avg_response_time_ms: f64,
	pub min_response_time_ms: f64,
	pub max_response_time_ms: f64,
}

/// Contract every outbound transport adapter implements (spec §4.2).
#[async_trait]
pub trait Adapter: Send + Sync {
	fn name(&self) -> &str;

	async fn initialize(&self, config: HashMap<String, String>) -> Result<()>;

	/// Establish one transport connection; fails with `ConnectionFailed`.
	async fn connect(&self) -> Result<ConnectionHandle>;

	/// Request/response; fails with `SendError`, `ReceiveError`, or `Timeout`.
	async fn send(&self, conn: &ConnectionHandle, bytes: Vec<u8>) -> Result<Vec<u8>>;

	/// Opens a raw event stream for adapters that support subscriptions;
	/// adapters that do not return `UnsupportedCapability`.
	async fn subscribe(
		&self,
		conn: &ConnectionHandle,
		encoded_subscription: Vec<u8>,
	) -> Result<(String, mpsc::Receiver<Vec<u8>>)>;

	/// Graceful close of all owned connections.
	async fn disconnect(&self) -> Result<()>;

	fn state(&self) -> PluginState;

	fn stats(&self) -> AdapterStats;

	/// Config as it should be surfaced via the introspection API, with
	/// sensitive fields redacted (spec §4.2/§9).
	fn redacted_config(&self) -> HashMap<String, String>;
}
