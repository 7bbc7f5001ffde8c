use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{Mutex, mpsc};

use super::{Adapter, AdapterStats, ConnectionHandle, redact_config};
use crate::codec::PluginState;
use crate::error::{GatewayError, Result};

struct HttpConnection;

/// Per-request timing, tracked so `stats()` can report min/avg/max without a
/// background task; the teacher's `relay::metrics` pattern does the same kind
/// of running aggregation for upstream calls.
#[derive(Default)]
struct Timings {
	count: u64,
	total_ms: f64,
	min_ms: f64,
	max_ms: f64,
}

impl Timings {
	fn record(&mut self, ms: f64) {
		if self.count == 0 {
			self.min_ms = ms;
			self.max_ms = ms;
		} else {
			self.min_ms = self.min_ms.min(ms);
			self.max_ms = self.max_ms.max(ms);
		}
		self.count += 1;
		self.total_ms += ms;
	}

	fn avg(&self) -> f64 {
		if self.count == 0 { 0.0 } else { self.total_ms / self.count as f64 }
	}
}

/// Outbound adapter for plain HTTP/1.1 targets, grounded on the teacher's
/// `relay::pool::ConnectionPool::connect` scheme/header resolution for its
/// SSE target (minus the SSE framing, which belongs to a protocol plugin, not
/// the transport adapter).
pub struct HttpAdapter {
	name: String,
	base_url: Mutex<String>,
	headers: Mutex<HeaderMap>,
	client: HttpClient,
	config: Mutex<HashMap<String, String>>,
	state: Mutex<PluginState>,
	connect_count: AtomicU64,
	disconnect_count: AtomicU64,
	bytes_sent: AtomicU64,
	bytes_received: AtomicU64,
	timings: Mutex<Timings>,
}

impl HttpAdapter {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			base_url: Mutex::new(String::new()),
			headers: Mutex::new(HeaderMap::new()),
			client: HttpClient::new(),
			config: Mutex::new(HashMap::new()),
			state: Mutex::new(PluginState::Uninitialized),
			connect_count: AtomicU64::new(0),
			disconnect_count: AtomicU64::new(0),
			bytes_sent: AtomicU64::new(0),
			bytes_received: AtomicU64::new(0),
			timings: Mutex::new(Timings::default()),
		}
	}
}

#[async_trait]
impl Adapter for HttpAdapter {
	fn name(&self) -> &str {
		&self.name
	}

	async fn initialize(&self, config: HashMap<String, String>) -> Result<()> {
		let url = config
			.get("url")
			.cloned()
			.ok_or_else(|| GatewayError::ValidationError(vec!["http adapter requires a `url` config key".to_string()]))?;
		let mut headers = HeaderMap::new();
		for (key, value) in config.iter().filter(|(k, _)| k.starts_with("header.")) {
			let header_name = key.trim_start_matches("header.");
			let name = HeaderName::from_bytes(header_name.as_bytes())
				.map_err(|e| GatewayError::ValidationError(vec![e.to_string()]))?;
			let value = HeaderValue::from_str(value).map_err(|e| GatewayError::ValidationError(vec![e.to_string()]))?;
			headers.insert(name, value);
		}
		*self.base_url.lock().await = url;
		*self.headers.lock().await = headers;
		*self.config.lock().await = config;
		*self.state.lock().await = PluginState::Initialized;
		Ok(())
	}

	async fn connect(&self) -> Result<ConnectionHandle> {
		if self.base_url.lock().await.is_empty() {
			return Err(GatewayError::ConnectionFailed("adapter not initialized".to_string()));
		}
		self.connect_count.fetch_add(1, Ordering::Relaxed);
		*self.state.lock().await = PluginState::Started;
		Ok(Arc::new(HttpConnection))
	}

	async fn send(&self, _conn: &ConnectionHandle, bytes: Vec<u8>) -> Result<Vec<u8>> {
		let url = self.base_url.lock().await.clone();
		let headers = self.headers.lock().await.clone();
		self.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
		let started = Instant::now();
		let response = self
			.client
			.post(&url)
			.headers(headers)
			.body(bytes)
			.send()
			.await
			.map_err(|e| GatewayError::SendError(e.to_string()))?;
		let body = response
			.bytes()
			.await
			.map_err(|e| GatewayError::ReceiveError(e.to_string()))?
			.to_vec();
		self.timings.lock().await.record(started.elapsed().as_secs_f64() * 1000.0);
		self.bytes_received.fetch_add(body.len() as u64, Ordering::Relaxed);
		Ok(body)
	}

	async fn subscribe(
		&self,
		_conn: &ConnectionHandle,
		_encoded_subscription: Vec<u8>,
	) -> Result<(String, mpsc::Receiver<Vec<u8>>)> {
		// Plain request/response HTTP has no push channel of its own; a
		// streaming protocol plugin (SSE, WebSocket) layers on top of this
		// adapter's connection instead of this adapter implementing it.
		Err(GatewayError::UnsupportedCapability("subscribe".to_string()))
	}

	async fn disconnect(&self) -> Result<()> {
		self.disconnect_count.fetch_add(1, Ordering::Relaxed);
		*self.state.lock().await = PluginState::Stopped;
		Ok(())
	}

	fn state(&self) -> PluginState {
		self.state.try_lock().map(|s| *s).unwrap_or(PluginState::Uninitialized)
	}

	fn stats(&self) -> AdapterStats {
		let timings = self.timings.try_lock().map(|t| (t.avg(), t.min_ms, t.max_ms)).unwrap_or((0.0, 0.0, 0.0));
		AdapterStats {
			connect_count: self.connect_count.load(Ordering::Relaxed),
			disconnect_count: self.disconnect_count.load(Ordering::Relaxed),
			bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
			bytes_received: self.bytes_received.load(Ordering::Relaxed),
			avg_response_time_ms: timings.0,
			min_response_time_ms: timings.1,
			max_response_time_ms: timings.2,
		}
	}

	fn redacted_config(&self) -> HashMap<String, String> {
		self.config.try_lock().map(|c| redact_config(&c)).unwrap_or_default()
	}
}
