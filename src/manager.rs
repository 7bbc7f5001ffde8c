//! Bridge Manager (spec §4.7): supervises every [`crate::bridge::Bridge`]
//! this process hosts — creation, a ping-based health loop, event fan-out,
//! and graceful (then forced) shutdown.
//!
//! Grounded on the teacher's `inbound::ListenerManager`: one `JoinSet` of
//! supervised tasks plus an `AbortHandle` per running unit, driven by a
//! `tokio::select!` over `run_set.join_next()` and an update channel, here
//! generalized from "one task per listener" to "one health-check task per
//! bridge" and paired with the spec's event bus instead of the teacher's
//! xDS update stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::Bridge;
use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::types::{BridgeState, HealthStatus};

pub enum ManagerUpdate {
	Add(Arc<Bridge>),
	Remove(String),
}

struct TrackedBridge {
	bridge: Arc<Bridge>,
	health: HealthStatus,
	consecutive_failures: u32,
	/// Set after a ping succeeds following one or more failures; the
	/// *next* successful ping resolves to `Healthy` rather than jumping
	/// there immediately (spec §4.7: "a success after any failures →
	/// degraded for one cycle, then healthy").
	recovering: bool,
}

/// Owns every live bridge and the background tasks that keep their health
/// state current. `create_bridge`/`remove_bridge` mutate the live set;
/// `run` drives the health loop until cancelled.
pub struct BridgeManager {
	bridges: RwLock<HashMap<String, TrackedBridge>>,
	health_handles: RwLock<HashMap<String, AbortHandle>>,
	events: Arc<EventBus>,
	health_interval: Duration,
	shutdown_timeout: Duration,
}

impl BridgeManager {
	pub fn new(events: Arc<EventBus>, health_interval: Duration, shutdown_timeout: Duration) -> Arc<Self> {
		Arc::new(Self {
			bridges: RwLock::new(HashMap::new()),
			health_handles: RwLock::new(HashMap::new()),
			events,
			health_interval,
			shutdown_timeout,
		})
	}

	/// Starts `bridge` and begins health-checking it. Replaces any prior
	/// bridge registered under the same name, stopping it first.
	pub async fn create_bridge(self: &Arc<Self>, bridge: Arc<Bridge>) -> Result<()> {
		let name = bridge.name().to_string();
		self.remove_bridge(&name).await.ok();

		bridge.start().await?;
		self.events
			.publish(GatewayEvent::BridgeStateChanged {
				bridge: name.clone(),
				state: BridgeState::Started,
			})
			.await;

		self.bridges.write().await.insert(
			name.clone(),
			TrackedBridge {
				bridge: bridge.clone(),
				health: HealthStatus::Unknown,
				consecutive_failures: 0,
				recovering: false,
			},
		);

		let manager = self.clone();
		let bridge_name = name.clone();
		let task = tokio::spawn(async move {
			manager.health_loop(bridge_name).await;
		});
		self.health_handles.write().await.insert(name, task.abort_handle());
		Ok(())
	}

	pub async fn remove_bridge(&self, name: &str) -> Result<()> {
		if let Some(handle) = self.health_handles.write().await.remove(name) {
			handle.abort();
		}
		let tracked = self.bridges.write().await.remove(name);
		match tracked {
			Some(tracked) => {
				tracked.bridge.stop().await?;
				self.events
					.publish(GatewayEvent::BridgeStateChanged {
						bridge: name.to_string(),
						state: BridgeState::Stopped,
					})
					.await;
				Ok(())
			},
			None => Err(GatewayError::PluginNotFound(name.to_string())),
		}
	}

	pub async fn get_bridge(&self, name: &str) -> Result<Arc<Bridge>> {
		self.bridges
			.read()
			.await
			.get(name)
			.map(|t| t.bridge.clone())
			.ok_or_else(|| GatewayError::PluginNotFound(name.to_string()))
	}

	pub async fn health_status(&self, name: &str) -> Result<HealthStatus> {
		self.bridges
			.read()
			.await
			.get(name)
			.map(|t| t.health)
			.ok_or_else(|| GatewayError::PluginNotFound(name.to_string()))
	}

	pub async fn list_bridges(&self) -> Vec<(String, BridgeState, HealthStatus)> {
		let bridges = self.bridges.read().await;
		let mut out = Vec::with_capacity(bridges.len());
		for (name, tracked) in bridges.iter() {
			out.push((name.clone(), tracked.bridge.state().await, tracked.health));
		}
		out
	}

	/// Pings `name`'s bridge on `health_interval` and folds the result into
	/// its consecutive-failure count (spec §4.7): one failure degrades it,
	/// three or more in a row marks it unhealthy, and a success is only
	/// promoted straight to `healthy` once no failure preceded it in the
	/// prior cycle.
	async fn health_loop(self: Arc<Self>, name: String) {
		let mut interval = tokio::time::interval(self.health_interval);
		loop {
			interval.tick().await;
			let Some(bridge) = ({
				let bridges = self.bridges.read().await;
				bridges.get(&name).map(|t| t.bridge.clone())
			}) else {
				return;
			};
			if bridge.state().await == BridgeState::Stopped {
				return;
			}

			let ping_result = bridge.ping().await;

			let mut bridges = self.bridges.write().await;
			let Some(tracked) = bridges.get_mut(&name) else { return };
			let new_status = match ping_result {
				Ok(()) => {
					if tracked.consecutive_failures > 0 {
						tracked.consecutive_failures = 0;
						tracked.recovering = true;
						HealthStatus::Degraded
					} else if tracked.recovering {
						tracked.recovering = false;
						HealthStatus::Healthy
					} else {
						HealthStatus::Healthy
					}
				},
				Err(_) => {
					tracked.consecutive_failures += 1;
					tracked.recovering = false;
					if tracked.consecutive_failures >= 3 {
						HealthStatus::Unhealthy
					} else {
						HealthStatus::Degraded
					}
				},
			};

			if tracked.health != new_status {
				tracked.health = new_status;
				drop(bridges);
				self.events
					.publish(GatewayEvent::HealthChanged {
						bridge: name.clone(),
						status: new_status,
					})
					.await;
			}
		}
	}

	/// Stops every bridge gracefully, forcing a `ShutdownForced` error for
	/// any that do not stop within `shutdown_timeout`.
	pub async fn shutdown_all(&self) {
		let names: Vec<String> = self.bridges.read().await.keys().cloned().collect();
		for name in names {
			match tokio::time::timeout(self.shutdown_timeout, self.remove_bridge(&name)).await {
				Ok(Ok(())) => info!(bridge = %name, "bridge stopped"),
				Ok(Err(e)) => warn!(bridge = %name, error = %e, "bridge stop failed"),
				Err(_) => {
					let forced = GatewayError::ShutdownForced(name.clone());
					warn!(bridge = %name, error = %forced, "bridge shutdown forced after timeout");
					self.health_handles.write().await.remove(&name).map(|h| h.abort());
					self.bridges.write().await.remove(&name);
					self.events
						.publish(GatewayEvent::BridgeStateChanged {
							bridge: name,
							state: BridgeState::Error,
						})
						.await;
				},
			}
		}
	}

	/// Drives manager-level dynamic updates (add/remove a bridge at
	/// runtime) until `ct` cancels, mirroring `ListenerManager::run`'s
	/// `tokio::select!` over an update channel and a cancellation token.
	pub async fn run(self: Arc<Self>, mut updates: mpsc::Receiver<ManagerUpdate>, ct: CancellationToken) {
		loop {
			tokio::select! {
				update = updates.recv() => {
					match update {
						Some(ManagerUpdate::Add(bridge)) => {
							if let Err(e) = self.create_bridge(bridge).await {
								warn!(error = %e, "failed to create bridge from update");
							}
						},
						Some(ManagerUpdate::Remove(name)) => {
							if let Err(e) = self.remove_bridge(&name).await {
								warn!(error = %e, "failed to remove bridge from update");
							}
						},
						None => {
							info!("manager update channel closed");
							break;
						},
					}
				},
				_ = ct.cancelled() => {
					break;
				},
			}
		}
		self.shutdown_all().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::adapter::LoopbackAdapter;
	use crate::codec::JsonCodec;
	use crate::firewall::Firewall;
	use crate::pool::{ConnectionPool, PoolConfig};
	use std::collections::HashMap as StdHashMap;

	async fn test_bridge(name: &str) -> Arc<Bridge> {
		let adapter = Arc::new(LoopbackAdapter::new(name));
		adapter.initialize(StdHashMap::new()).await.unwrap();
		let pool = ConnectionPool::new(adapter.clone(), PoolConfig::default());
		let codec: Arc<dyn crate::codec::Codec> = Arc::new(JsonCodec::new("json"));
		let firewall = Arc::new(Firewall::new(1000, Duration::from_secs(60)));
		Bridge::new(name, codec, adapter, pool, firewall, EventBus::new())
	}

	/// An adapter whose `send` always fails, used to drive the health loop's
	/// consecutive-failure counting deterministically.
	struct AlwaysFailingAdapter {
		name: String,
		state: tokio::sync::Mutex<crate::codec::PluginState>,
	}

	impl AlwaysFailingAdapter {
		fn new(name: impl Into<String>) -> Self {
			Self {
				name: name.into(),
				state: tokio::sync::Mutex::new(crate::codec::PluginState::Uninitialized),
			}
		}
	}

	#[async_trait::async_trait]
	impl crate::adapter::Adapter for AlwaysFailingAdapter {
		fn name(&self) -> &str {
			&self.name
		}

		async fn initialize(&self, _config: StdHashMap<String, String>) -> Result<()> {
			*self.state.lock().await = crate::codec::PluginState::Initialized;
			Ok(())
		}

		async fn connect(&self) -> Result<crate::adapter::ConnectionHandle> {
			*self.state.lock().await = crate::codec::PluginState::Started;
			Ok(Arc::new(()))
		}

		async fn send(&self, _conn: &crate::adapter::ConnectionHandle, _bytes: Vec<u8>) -> Result<Vec<u8>> {
			Err(GatewayError::SendError("simulated outage".to_string()))
		}

		async fn subscribe(
			&self,
			_conn: &crate::adapter::ConnectionHandle,
			_encoded_subscription: Vec<u8>,
		) -> Result<(String, tokio::sync::mpsc::Receiver<Vec<u8>>)> {
			Err(GatewayError::UnsupportedCapability("subscribe".to_string()))
		}

		async fn disconnect(&self) -> Result<()> {
			*self.state.lock().await = crate::codec::PluginState::Stopped;
			Ok(())
		}

		fn state(&self) -> crate::codec::PluginState {
			self.state.try_lock().map(|s| *s).unwrap_or(crate::codec::PluginState::Uninitialized)
		}

		fn stats(&self) -> crate::adapter::AdapterStats {
			crate::adapter::AdapterStats::default()
		}

		fn redacted_config(&self) -> StdHashMap<String, String> {
			StdHashMap::new()
		}
	}

	async fn failing_bridge(name: &str) -> Arc<Bridge> {
		let adapter = Arc::new(AlwaysFailingAdapter::new(name));
		adapter.initialize(StdHashMap::new()).await.unwrap();
		let pool = ConnectionPool::new(adapter.clone(), PoolConfig::default());
		let codec: Arc<dyn crate::codec::Codec> = Arc::new(JsonCodec::new("json"));
		let firewall = Arc::new(Firewall::new(1000, Duration::from_secs(60)));
		Bridge::new(name, codec, adapter, pool, firewall, EventBus::new())
	}

	#[tokio::test]
	async fn create_bridge_marks_it_started() {
		let manager = BridgeManager::new(EventBus::new(), Duration::from_millis(20), Duration::from_secs(1));
		manager.create_bridge(test_bridge("b1").await).await.unwrap();
		let (_, state, _) = manager.list_bridges().await.into_iter().next().unwrap();
		assert_eq!(state, BridgeState::Started);
	}

	#[tokio::test]
	async fn remove_missing_bridge_is_plugin_not_found() {
		let manager = BridgeManager::new(EventBus::new(), Duration::from_millis(20), Duration::from_secs(1));
		let err = manager.remove_bridge("nope").await;
		assert!(matches!(err, Err(GatewayError::PluginNotFound(_))));
	}

	#[tokio::test]
	async fn health_loop_transitions_unknown_to_healthy() {
		let manager = BridgeManager::new(EventBus::new(), Duration::from_millis(5), Duration::from_secs(1));
		manager.create_bridge(test_bridge("b1").await).await.unwrap();
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert_eq!(manager.health_status("b1").await.unwrap(), HealthStatus::Healthy);
	}

	#[tokio::test]
	async fn three_consecutive_ping_failures_reach_unhealthy() {
		let manager = BridgeManager::new(EventBus::new(), Duration::from_millis(10), Duration::from_secs(1));
		manager.create_bridge(failing_bridge("b1").await).await.unwrap();
		// 1st tick: Unknown -> Degraded. 2nd tick: Degraded -> Degraded
		// (still below 3 failures). 3rd tick: Degraded -> Unhealthy.
		tokio::time::sleep(Duration::from_millis(45)).await;
		assert_eq!(manager.health_status("b1").await.unwrap(), HealthStatus::Unhealthy);
	}

	/// An adapter whose `disconnect` never returns, used to drive
	/// `shutdown_all`'s forced-shutdown path deterministically.
	struct HangingDisconnectAdapter {
		name: String,
	}

	#[async_trait::async_trait]
	impl crate::adapter::Adapter for HangingDisconnectAdapter {
		fn name(&self) -> &str {
			&self.name
		}

		async fn initialize(&self, _config: StdHashMap<String, String>) -> Result<()> {
			Ok(())
		}

		async fn connect(&self) -> Result<crate::adapter::ConnectionHandle> {
			Ok(Arc::new(()))
		}

		async fn send(&self, _conn: &crate::adapter::ConnectionHandle, _bytes: Vec<u8>) -> Result<Vec<u8>> {
			Ok(vec![])
		}

		async fn subscribe(
			&self,
			_conn: &crate::adapter::ConnectionHandle,
			_encoded_subscription: Vec<u8>,
		) -> Result<(String, tokio::sync::mpsc::Receiver<Vec<u8>>)> {
			Err(GatewayError::UnsupportedCapability("subscribe".to_string()))
		}

		async fn disconnect(&self) -> Result<()> {
			std::future::pending::<()>().await;
			unreachable!()
		}

		fn state(&self) -> crate::codec::PluginState {
			crate::codec::PluginState::Started
		}

		fn stats(&self) -> crate::adapter::AdapterStats {
			crate::adapter::AdapterStats::default()
		}

		fn redacted_config(&self) -> StdHashMap<String, String> {
			StdHashMap::new()
		}
	}

	#[tokio::test]
	async fn shutdown_all_stops_every_bridge() {
		let manager = BridgeManager::new(EventBus::new(), Duration::from_millis(20), Duration::from_secs(1));
		manager.create_bridge(test_bridge("b1").await).await.unwrap();
		manager.create_bridge(test_bridge("b2").await).await.unwrap();
		manager.shutdown_all().await;
		assert!(manager.list_bridges().await.is_empty());
	}

	#[tokio::test]
	async fn shutdown_all_forces_past_a_hanging_bridge() {
		let events = EventBus::new();
		let (_id, mut rx) = events.subscribe(8).await;
		let manager = BridgeManager::new(events, Duration::from_millis(20), Duration::from_millis(20));
		let adapter = Arc::new(HangingDisconnectAdapter { name: "stuck".to_string() });
		adapter.initialize(StdHashMap::new()).await.unwrap();
		let pool = ConnectionPool::new(adapter.clone(), PoolConfig::default());
		let codec: Arc<dyn crate::codec::Codec> = Arc::new(JsonCodec::new("json"));
		let firewall = Arc::new(Firewall::new(1000, Duration::from_secs(60)));
		let bridge = Bridge::new("stuck", codec, adapter, pool, firewall, EventBus::new());
		manager.create_bridge(bridge).await.unwrap();

		manager.shutdown_all().await;
		assert!(manager.list_bridges().await.is_empty());

		let mut saw_forced_state = false;
		while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
			if matches!(event, GatewayEvent::BridgeStateChanged { state: BridgeState::Error, .. }) {
				saw_forced_state = true;
			}
		}
		assert!(saw_forced_state, "expected a BridgeStateChanged(Error) event for the forced shutdown");
	}
}
