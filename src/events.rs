//! Event bus + metrics sink (spec §4.8).
//!
//! The bus is a per-subscriber bounded `mpsc` fan-out with strict
//! drop-on-overflow semantics (never unbounded buffering). `MetricsSink` is
//! a distinguished subscriber that forwards bridge/pool/firewall events into
//! a `prometheus-client` registry, grounded on the teacher's
//! `relay::metrics::Metrics` (`Family<Labels, Counter>` + `Recorder<E, T>`)
//! pattern from `src/metrics.rs`/`src/mtrcs.rs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use crate::types::{BridgeState, HealthStatus};

/// A single fact published on the bus: a bridge state change, a health
/// transition, a firewall verdict, or a pool event. Kept as one flat enum
/// (per the teacher's preference for tagged enums over a trait-object event
/// type) so subscribers can match exhaustively.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind")]
pub enum GatewayEvent {
	BridgeStateChanged { bridge: String, state: BridgeState },
	HealthChanged { bridge: String, status: HealthStatus },
	FirewallVerdict { bridge: String, rule_id: Option<String>, allowed: bool },
	ConnectionLeaked { bridge: String, acquired_by: String },
	PoolExhausted { bridge: String },
}

/// One subscriber's bounded inbox. Overflow is dropped, never buffered, and
/// counted so the admin surface can report lossy subscribers.
struct Subscriber {
	sender: mpsc::Sender<GatewayEvent>,
	dropped: AtomicU64,
}

/// Fan-out publisher: every [`GatewayEvent`] is offered to each subscriber's
/// bounded channel with `try_send`; a full channel drops the event for that
/// subscriber only, per spec.md's backpressure design note.
pub struct EventBus {
	subscribers: RwLock<HashMap<u64, Subscriber>>,
	next_id: AtomicU64,
}

impl EventBus {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			subscribers: RwLock::new(HashMap::new()),
			next_id: AtomicU64::new(0),
		})
	}

	/// Registers a new subscriber with a channel of `capacity`, returning
	/// its id (for `unsubscribe`) and the receiving half.
	pub async fn subscribe(&self, capacity: usize) -> (u64, mpsc::Receiver<GatewayEvent>) {
		let (tx, rx) = mpsc::channel(capacity);
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.subscribers.write().await.insert(
			id,
			Subscriber {
				sender: tx,
				dropped: AtomicU64::new(0),
			},
		);
		(id, rx)
	}

	pub async fn unsubscribe(&self, id: u64) {
		self.subscribers.write().await.remove(&id);
	}

	pub async fn publish(&self, event: GatewayEvent) {
		let subscribers = self.subscribers.read().await;
		for subscriber in subscribers.values() {
			if subscriber.sender.try_send(event.clone()).is_err() {
				subscriber.dropped.fetch_add(1, Ordering::Relaxed);
				debug!("event bus subscriber full, dropped event");
			}
		}
	}

	pub async fn dropped_count(&self, id: u64) -> Option<u64> {
		self.subscribers.read().await.get(&id).map(|s| s.dropped.load(Ordering::Relaxed))
	}
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BridgeStateLabels {
	bridge: String,
	state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct HealthLabels {
	bridge: String,
	status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FirewallLabels {
	bridge: String,
	allowed: bool,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BridgeLabels {
	bridge: String,
}

/// The Event Bus's distinguished subscriber: every event is also recorded as
/// a counter in the shared registry the admin `/metrics` route serves,
/// mirroring the way `relay::metrics::Metrics::record` feeds
/// `src/mtrcs.rs::metrics_handler`.
pub struct MetricsSink {
	bridge_state_changes: Family<BridgeStateLabels, Counter>,
	health_changes: Family<HealthLabels, Counter>,
	firewall_verdicts: Family<FirewallLabels, Counter>,
	connection_leaks: Family<BridgeLabels, Counter>,
	pool_exhaustions: Family<BridgeLabels, Counter>,
}

impl MetricsSink {
	pub fn new(registry: &mut Registry) -> Self {
		let bridge_state_changes = Family::default();
		registry.register("bridge_state_changes", "Bridge lifecycle transitions", bridge_state_changes.clone());

		let health_changes = Family::default();
		registry.register("bridge_health_changes", "Bridge health status transitions", health_changes.clone());

		let firewall_verdicts = Family::default();
		registry.register("firewall_verdicts", "Firewall admission verdicts", firewall_verdicts.clone());

		let connection_leaks = Family::default();
		registry.register("connection_leaks", "Connections evicted as leaked", connection_leaks.clone());

		let pool_exhaustions = Family::default();
		registry.register("pool_exhaustions", "Connection pool exhaustion events", pool_exhaustions.clone());

		Self {
			bridge_state_changes,
			health_changes,
			firewall_verdicts,
			connection_leaks,
			pool_exhaustions,
		}
	}

	pub fn record(&self, event: &GatewayEvent) {
		match event {
			GatewayEvent::BridgeStateChanged { bridge, state } => {
				self.bridge_state_changes
					.get_or_create(&BridgeStateLabels {
						bridge: bridge.clone(),
						state: format!("{state:?}"),
					})
					.inc();
			},
			GatewayEvent::HealthChanged { bridge, status } => {
				self.health_changes
					.get_or_create(&HealthLabels {
						bridge: bridge.clone(),
						status: format!("{status:?}"),
					})
					.inc();
			},
			GatewayEvent::FirewallVerdict { bridge, allowed, .. } => {
				self.firewall_verdicts
					.get_or_create(&FirewallLabels {
						bridge: bridge.clone(),
						allowed: *allowed,
					})
					.inc();
			},
			GatewayEvent::ConnectionLeaked { bridge, .. } => {
				self.connection_leaks.get_or_create(&BridgeLabels { bridge: bridge.clone() }).inc();
			},
			GatewayEvent::PoolExhausted { bridge } => {
				self.pool_exhaustions.get_or_create(&BridgeLabels { bridge: bridge.clone() }).inc();
			},
		}
	}

	/// Spawns a task that drains `rx` (a bus subscription) into this sink
	/// until the channel closes.
	pub fn spawn_drain(sink: Arc<Self>, mut rx: mpsc::Receiver<GatewayEvent>) {
		tokio::spawn(async move {
			while let Some(event) = rx.recv().await {
				sink.record(&event);
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn publish_reaches_all_subscribers() {
		let bus = EventBus::new();
		let (_id1, mut rx1) = bus.subscribe(4).await;
		let (_id2, mut rx2) = bus.subscribe(4).await;
		bus.publish(GatewayEvent::BridgeStateChanged {
			bridge: "b1".to_string(),
			state: BridgeState::Started,
		})
		.await;
		assert!(rx1.recv().await.is_some());
		assert!(rx2.recv().await.is_some());
	}

	#[tokio::test]
	async fn full_subscriber_drops_rather_than_blocks() {
		let bus = EventBus::new();
		let (id, _rx) = bus.subscribe(1).await;
		for _ in 0..5 {
			bus.publish(GatewayEvent::HealthChanged {
				bridge: "b1".to_string(),
				status: HealthStatus::Healthy,
			})
			.await;
		}
		assert!(bus.dropped_count(id).await.unwrap() > 0);
	}

	#[tokio::test]
	async fn unsubscribe_stops_further_delivery() {
		let bus = EventBus::new();
		let (id, mut rx) = bus.subscribe(4).await;
		bus.unsubscribe(id).await;
		bus.publish(GatewayEvent::HealthChanged {
			bridge: "b1".to_string(),
			status: HealthStatus::Unhealthy,
		})
		.await;
		assert!(rx.recv().await.is_none());
	}

	#[test]
	fn metrics_sink_records_without_panicking() {
		let mut registry = Registry::default();
		let sink = MetricsSink::new(&mut registry);
		sink.record(&GatewayEvent::BridgeStateChanged {
			bridge: "b1".to_string(),
			state: BridgeState::Started,
		});
		sink.record(&GatewayEvent::PoolExhausted { bridge: "b1".to_string() });
	}
}
