//! Core data model shared by every component (spec §3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Routing descriptor selecting `(adapter, protocol, endpoint)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Target {
	pub adapter_name: String,
	pub protocol_name: String,
	pub endpoint: String,
	#[serde(default)]
	pub metadata: HashMap<String, String>,
}

impl Target {
	pub fn new(adapter_name: impl Into<String>, protocol_name: impl Into<String>, endpoint: impl Into<String>) -> Self {
		Self {
			adapter_name: adapter_name.into(),
			protocol_name: protocol_name.into(),
			endpoint: endpoint.into(),
			metadata: HashMap::new(),
		}
	}
}

/// A single inbound call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
	pub id: String,
	pub target: Target,
	pub function: String,
	pub params: serde_json::Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub deadline: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
	/// Caller's source IP, if known; fed into the firewall's `ip`/`rate` rule
	/// matching instead of being dropped at admission time.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source_ip: Option<String>,
	/// Caller-supplied headers, matched against `header`-typed firewall rules.
	#[serde(default)]
	pub headers: HashMap<String, String>,
}

impl Request {
	pub fn new(id: impl Into<String>, target: Target, function: impl Into<String>, params: serde_json::Value) -> Self {
		Self {
			id: id.into(),
			target,
			function: function.into(),
			params,
			deadline: None,
			created_at: Utc::now(),
			source_ip: None,
			headers: HashMap::new(),
		}
	}

	pub fn with_source_ip(mut self, source_ip: impl Into<String>) -> Self {
		self.source_ip = Some(source_ip.into());
		self
	}

	pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
		self.headers = headers;
		self
	}
}

/// The result of a [`Request`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
	pub request_id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_kind: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	pub timing: Duration,
}

impl Response {
	pub fn ok(request_id: impl Into<String>, result: serde_json::Value, timing: Duration) -> Self {
		Self {
			request_id: request_id.into(),
			result: Some(result),
			error_kind: None,
			error_message: None,
			timing,
		}
	}

	pub fn err(request_id: impl Into<String>, error_kind: &str, error_message: impl Into<String>, timing: Duration) -> Self {
		Self {
			request_id: request_id.into(),
			result: None,
			error_kind: Some(error_kind.to_string()),
			error_message: Some(error_message.into()),
			timing,
		}
	}
}

/// A subscription event delivered to a handler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
	pub subscription_id: String,
	pub event_type: String,
	pub payload_bytes: Vec<u8>,
	pub timestamp: DateTime<Utc>,
}

/// A long-lived, cancellable event sequence tied to one adapter stream.
pub struct Subscription {
	pub id: String,
	pub adapter: String,
	pub event_channel: tokio::sync::mpsc::Receiver<Event>,
	pub cancel: CancellationToken,
}

impl Subscription {
	/// Cancel the subscription. Any in-flight handler invocation is allowed
	/// to complete; no further invocations occur afterwards.
	pub fn unsubscribe(&self) {
		self.cancel.cancel();
	}
}

/// States a pooled connection may be in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
	Idle,
	InUse,
	Evicted,
}

/// An opaque handle owned exclusively by a pool, loaned to at most one
/// in-flight request at a time.
pub struct PoolEntry<C> {
	/// Stable identity independent of the entry's position in the pool's
	/// backing `Vec`; a `Lease` keys off this instead of a `Vec` index so it
	/// stays valid across `reap_idle`/`sweep_leaks` reshuffling the slots.
	pub id: u64,
	pub connection: C,
	pub created_at: DateTime<Utc>,
	pub last_used: DateTime<Utc>,
	pub in_flight_count: u32,
	pub state: ConnectionState,
	/// Set when a request acquires this entry, used by the leak sweep to
	/// attribute a `ConnectionLeaked` event to the acquiring request.
	pub acquired_by: Option<String>,
	pub acquired_at: Option<DateTime<Utc>>,
}

impl<C> PoolEntry<C> {
	pub fn new(id: u64, connection: C) -> Self {
		let now = Utc::now();
		Self {
			id,
			connection,
			created_at: now,
			last_used: now,
			in_flight_count: 0,
			state: ConnectionState::Idle,
			acquired_by: None,
			acquired_at: None,
		}
	}
}

/// Lifecycle of a [`crate::bridge::Bridge`] or plugin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
	Uninitialized,
	Initialized,
	Started,
	Stopped,
	Error,
}

/// Health as tracked by the Manager's health loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
	Unknown,
	Healthy,
	Degraded,
	Unhealthy,
}

/// Firewall rule types (spec §3/§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
	Ip,
	Url,
	Header,
	Content,
	Rate,
	Geo,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
	#[default]
	Inbound,
	Outbound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
	Allow,
	Deny,
	Log,
	Rate,
	Challenge,
}

/// A single firewall predicate + action pair, ranked by priority.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
	pub id: String,
	#[serde(rename = "type")]
	pub rule_type: RuleType,
	pub direction: Direction,
	pub priority: i64,
	pub action: RuleAction,
	pub match_spec: String,
	#[serde(default = "default_true")]
	pub enabled: bool,
	/// Overrides the default rate-limit key tuple for `rate`-typed rules.
	#[serde(default)]
	pub rate_key_override: Option<Vec<String>>,
	/// Tokens-per-second refill rate for `rate`-typed rules; falls back to
	/// `security.rateLimiting`'s crate-wide default when unset.
	#[serde(default)]
	pub rate_limit: Option<f64>,
	/// Burst multiplier applied to `rate_limit` for `rate`-typed rules; falls
	/// back to the crate-wide default burst factor when unset.
	#[serde(default)]
	pub rate_burst_factor: Option<f64>,
	/// insertion order, used only to break priority ties deterministically.
	#[serde(skip)]
	pub sequence: u64,
}

fn default_true() -> bool {
	true
}

pub(crate) type SharedCancellationToken = Arc<CancellationToken>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn response_ok_has_no_error() {
		let r = Response::ok("r1", serde_json::json!({"x": 1}), Duration::from_millis(5));
		assert!(r.error_kind.is_none());
		assert_eq!(r.result, Some(serde_json::json!({"x": 1})));
	}

	#[test]
	fn response_err_has_no_result() {
		let r = Response::err("r1", "Timeout", "deadline exceeded", Duration::from_millis(5));
		assert!(r.result.is_none());
		assert_eq!(r.error_kind.as_deref(), Some("Timeout"));
	}
}
