use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::{Adapter, AdapterStats, ConnectionHandle, redact_config};
use crate::codec::PluginState;
use crate::error::{GatewayError, Result};

struct LoopbackConnection;

/// In-process adapter whose `send` returns its input verbatim. Used by the
/// built-in `echo` round trip and as a stand-in for a live backend in tests,
/// the way the teacher's local/stdio targets stand in for a real upstream in
/// `static.rs::run_local_client`.
pub struct LoopbackAdapter {
	name: String,
	config: Mutex<HashMap<String, String>>,
	state: Mutex<PluginState>,
	connect_count: AtomicU64,
	disconnect_count: AtomicU64,
	bytes_sent: AtomicU64,
	bytes_received: AtomicU64,
	/// Queued event frames replayed in order to every subscriber, then the
	/// channel is left open until the caller cancels.
	stream_events: Vec<Vec<u8>>,
	/// Delay between successive stream events; lets tests interleave
	/// cancellation between deliveries instead of racing an instant burst.
	stream_delay: Duration,
}

impl LoopbackAdapter {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			config: Mutex::new(HashMap::new()),
			state: Mutex::new(PluginState::Uninitialized),
			connect_count: AtomicU64::new(0),
			disconnect_count: AtomicU64::new(0),
			bytes_sent: AtomicU64::new(0),
			bytes_received: AtomicU64::new(0),
			stream_events: Vec::new(),
			stream_delay: Duration::ZERO,
		}
	}

	/// A loopback adapter that, on `subscribe`, replays `events` in order
	/// then idles until the subscriber drops or cancels.
	pub fn with_stream_events(name: impl Into<String>, events: Vec<Vec<u8>>) -> Self {
		Self {
			stream_events: events,
			..Self::new(name)
		}
	}

	/// Like [`Self::with_stream_events`], but paces deliveries `delay` apart
	/// so a caller can cancel mid-stream deterministically.
	pub fn with_paced_stream_events(name: impl Into<String>, events: Vec<Vec<u8>>, delay: Duration) -> Self {
		Self {
			stream_events: events,
			stream_delay: delay,
			..Self::new(name)
		}
	}
}

#[async_trait]
impl Adapter for LoopbackAdapter {
	fn name(&self) -> &str {
		&self.name
	}

	async fn initialize(&self, config: HashMap<String, String>) -> Result<()> {
		*self.config.lock().await = config;
		*self.state.lock().await = PluginState::Initialized;
		Ok(())
	}

	async fn connect(&self) -> Result<ConnectionHandle> {
		self.connect_count.fetch_add(1, Ordering::Relaxed);
		*self.state.lock().await = PluginState::Started;
		Ok(Arc::new(LoopbackConnection))
	}

	async fn send(&self, _conn: &ConnectionHandle, bytes: Vec<u8>) -> Result<Vec<u8>> {
		self.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
		self.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);
		Ok(bytes)
	}

	async fn subscribe(
		&self,
		_conn: &ConnectionHandle,
		_encoded_subscription: Vec<u8>,
	) -> Result<(String, mpsc::Receiver<Vec<u8>>)> {
		if self.stream_events.is_empty() {
			return Err(GatewayError::UnsupportedCapability("subscribe".to_string()));
		}
		let events = self.stream_events.clone();
		let delay = self.stream_delay;
		if delay.is_zero() {
			let (tx, rx) = mpsc::channel(events.len().max(1));
			for event in events {
				// Bounded send on a freshly sized channel never blocks here.
				let _ = tx.send(event).await;
			}
			let subscription_id = format!("{}-{}", self.name, rand::random::<u32>());
			return Ok((subscription_id, rx));
		}
		// Paced delivery: send from a background task so the caller can cancel
		// or drop the receiver between events rather than racing a burst.
		let (tx, rx) = mpsc::channel(1);
		tokio::spawn(async move {
			for event in events {
				if tx.send(event).await.is_err() {
					return;
				}
				tokio::time::sleep(delay).await;
			}
		});
		let subscription_id = format!("{}-{}", self.name, rand::random::<u32>());
		Ok((subscription_id, rx))
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
		AdapterStats {
			connect_count: self.connect_count.load(Ordering::Relaxed),
			disconnect_count: self.disconnect_count.load(Ordering::Relaxed),
			bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
			bytes_received: self.bytes_received.load(Ordering::Relaxed),
			avg_response_time_ms: 0.0,
			min_response_time_ms: 0.0,
			max_response_time_ms: 0.0,
		}
	}

	fn redacted_config(&self) -> HashMap<String, String> {
		self.config.try_lock().map(|c| redact_config(&c)).unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn streaming_loopback_replays_events_in_order() {
		let adapter = LoopbackAdapter::with_stream_events(
			"stream",
			vec![b"e1".to_vec(), b"e2".to_vec(), b"e3".to_vec()],
		);
		let conn = adapter.connect().await.unwrap();
		let (_, mut rx) = adapter.subscribe(&conn, vec![]).await.unwrap();
		let mut seen = Vec::new();
		while let Some(event) = rx.recv().await {
			seen.push(event);
		}
		assert_eq!(seen, vec![b"e1".to_vec(), b"e2".to_vec(), b"e3".to_vec()]);
	}

	#[tokio::test]
	async fn paced_stream_stops_once_subscriber_drops_receiver() {
		let adapter = LoopbackAdapter::with_paced_stream_events(
			"paced",
			vec![b"e1".to_vec(), b"e2".to_vec(), b"e3".to_vec()],
			Duration::from_millis(20),
		);
		let conn = adapter.connect().await.unwrap();
		let (_, mut rx) = adapter.subscribe(&conn, vec![]).await.unwrap();
		let first = rx.recv().await.unwrap();
		assert_eq!(first, b"e1".to_vec());
		drop(rx);
		// The background sender should observe the closed channel and stop
		// rather than panicking or looping forever.
		tokio::time::sleep(Duration::from_millis(80)).await;
	}
}
