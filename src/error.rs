//! Closed error taxonomy shared across every component (spec §7).
//!
//! Codec/adapter errors are never silently retried by the core; connection
//! level retries are the [`crate::pool::ConnectionPool`]'s responsibility and
//! are bounded. Every error is expected to carry enough context to populate
//! an admin-surface `{code, message}` pair without re-deriving it.

use std::time::Duration;

use thiserror::Error;

/// The closed set of failure kinds the bridge core can produce.
#[derive(Error, Debug)]
pub enum GatewayError {
	#[error("bad request: {0}")]
	BadRequest(String),

	#[error("access denied by rule {rule_id}: {reason}")]
	AccessDenied { rule_id: String, reason: String },

	#[error("rate limit exceeded, retry after {:.3}s", .throttle_for.as_secs_f64())]
	RateLimitExceeded { throttle_for: Duration },

	#[error("challenge required for rule {rule_id}")]
	ChallengeRequired { rule_id: String },

	#[error("encode error: {0}")]
	EncodeError(String),

	#[error("decode error: {0}")]
	DecodeError(String),

	#[error("validation error: {0:?}")]
	ValidationError(Vec<String>),

	#[error("no handler registered for message type {0}")]
	NoHandler(String),

	#[error("connection failed: {0}")]
	ConnectionFailed(String),

	#[error("pool exhausted after waiting {:.3}s", .waited.as_secs_f64())]
	PoolExhausted { waited: Duration },

	#[error("send error: {0}")]
	SendError(String),

	#[error("receive error: {0}")]
	ReceiveError(String),

	#[error("operation timed out after {:.3}s", .0.as_secs_f64())]
	Timeout(Duration),

	#[error("adapter does not support capability {0}")]
	UnsupportedCapability(String),

	#[error("plugin not found: {0}")]
	PluginNotFound(String),

	#[error("dependency not started: {plugin_id} depends on {depends_on}")]
	DependencyUnmet {
		plugin_id: String,
		depends_on: String,
	},

	#[error("cannot unregister {plugin_id}: started plugin {dependent} still depends on it")]
	PluginInUse { plugin_id: String, dependent: String },

	#[error("bridge {0} was forcibly shut down after its deadline expired")]
	ShutdownForced(String),

	#[error("connection closed: {0}")]
	ConnectionClosed(String),

	#[error("internal invariant violated: {0}")]
	Internal(String),
}

impl GatewayError {
	/// Stable machine-readable code for the admin/error envelope (spec §6).
	pub fn code(&self) -> &'static str {
		match self {
			GatewayError::BadRequest(_) => "BAD_REQUEST",
			GatewayError::AccessDenied { .. } => "ACCESS_DENIED",
			GatewayError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
			GatewayError::ChallengeRequired { .. } => "CHALLENGE_REQUIRED",
			GatewayError::EncodeError(_) => "ENCODE_ERROR",
			GatewayError::DecodeError(_) => "DECODE_ERROR",
			GatewayError::ValidationError(_) => "VALIDATION_ERROR",
			GatewayError::NoHandler(_) => "NO_HANDLER",
			GatewayError::ConnectionFailed(_) => "CONNECTION_FAILED",
			GatewayError::PoolExhausted { .. } => "POOL_EXHAUSTED",
			GatewayError::SendError(_) => "SEND_ERROR",
			GatewayError::ReceiveError(_) => "RECEIVE_ERROR",
			GatewayError::Timeout(_) => "TIMEOUT",
			GatewayError::UnsupportedCapability(_) => "UNSUPPORTED_CAPABILITY",
			GatewayError::PluginNotFound(_) => "PLUGIN_NOT_FOUND",
			GatewayError::DependencyUnmet { .. } => "DEPENDENCY_UNMET",
			GatewayError::PluginInUse { .. } => "PLUGIN_IN_USE",
			GatewayError::ShutdownForced(_) => "SHUTDOWN_FORCED",
			GatewayError::ConnectionClosed(_) => "CONNECTION_CLOSED",
			GatewayError::Internal(_) => "INTERNAL",
		}
	}

	/// `throttle_for` hint, if this error carries one.
	pub fn throttle_for(&self) -> Option<Duration> {
		match self {
			GatewayError::RateLimitExceeded { throttle_for } => Some(*throttle_for),
			_ => None,
		}
	}
}

pub type Result<T> = std::result::Result<T, GatewayError>;
