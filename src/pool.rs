//! Connection Pool (spec §4.3): owns the live connections behind one
//! [`crate::adapter::Adapter`], bounded by `min`/`max` size, with background
//! idle reaping and leak detection.
//!
//! Grounded on the teacher's `relay::pool::ConnectionPool`, generalized from
//! "one connection per named MCP target" to "N pooled connections behind one
//! adapter", and its shutdown/reap loops threaded with the same
//! `tokio_util::sync::CancellationToken` the teacher uses in `inbound.rs`'s
//! `sync_jwks_loop`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::Adapter;
use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::types::{ConnectionState, PoolEntry};

/// Wall-clock elapsed since `since`, saturating to zero for clock skew.
fn elapsed_since(since: chrono::DateTime<Utc>) -> Duration {
	(Utc::now() - since).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
	pub min_size: usize,
	pub max_size: usize,
	/// Idle connections beyond this count are closed on `release` rather than
	/// kept in the free list (spec §4.3 `max_idle`).
	pub max_idle: usize,
	pub acquire_timeout: Duration,
	pub idle_timeout: Duration,
	pub leak_timeout: Duration,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			min_size: 1,
			max_size: 8,
			max_idle: 4,
			acquire_timeout: Duration::from_secs(5),
			idle_timeout: Duration::from_secs(300),
			leak_timeout: Duration::from_secs(60),
		}
	}
}

/// A borrowed connection; on drop, the caller must call [`ConnectionPool::release`]
/// to return it to the free list. Held separately from `PoolEntry` itself so
/// the pool's internal mutex is never held across an `.await` in the caller.
/// Keys off the entry's stable `id`, not its position in the backing `Vec`,
/// so a lease stays valid across `reap_idle`/`sweep_leaks` reshuffling slots.
pub struct Lease {
	pub id: u64,
	pub connection: Arc<dyn std::any::Any + Send + Sync>,
}

struct Slots {
	entries: Vec<PoolEntry<Arc<dyn std::any::Any + Send + Sync>>>,
	next_id: u64,
}

/// Pools connections behind one adapter. `acquire`/`release`/`close` are the
/// only entry points; the reap/leak-sweep loops are internal background
/// tasks started by [`ConnectionPool::spawn_maintenance`].
pub struct ConnectionPool {
	adapter: Arc<dyn Adapter>,
	config: PoolConfig,
	slots: Mutex<Slots>,
	/// Woken on every `release`/construct failure so a blocked `acquire` can
	/// re-check the free list instead of polling.
	notify: Notify,
	events: Arc<EventBus>,
	leaks: AtomicU64,
}

/// What `try_acquire_slot` found: either a usable lease, or a signal to the
/// caller for what to do next while the slots lock is not held.
enum SlotOutcome {
	Leased(Lease),
	MustConstruct,
	Full,
}

impl ConnectionPool {
	pub fn new(adapter: Arc<dyn Adapter>, config: PoolConfig) -> Arc<Self> {
		Self::with_events(adapter, config, EventBus::new())
	}

	pub fn with_events(adapter: Arc<dyn Adapter>, config: PoolConfig, events: Arc<EventBus>) -> Arc<Self> {
		Arc::new(Self {
			adapter,
			config,
			slots: Mutex::new(Slots {
				entries: Vec::new(),
				next_id: 0,
			}),
			notify: Notify::new(),
			events,
			leaks: AtomicU64::new(0),
		})
	}

	/// Takes an idle slot if one exists, else reports whether the pool still
	/// has room to grow. Never does adapter I/O while holding the lock.
	async fn try_acquire_slot(&self, acquired_by: &str) -> SlotOutcome {
		let mut slots = self.slots.lock().await;
		if let Some(entry) = slots.entries.iter_mut().find(|e| e.state == ConnectionState::Idle) {
			entry.state = ConnectionState::InUse;
			entry.last_used = Utc::now();
			entry.in_flight_count += 1;
			entry.acquired_by = Some(acquired_by.to_string());
			entry.acquired_at = Some(Utc::now());
			return SlotOutcome::Leased(Lease {
				id: entry.id,
				connection: entry.connection.clone(),
			});
		}
		if slots.entries.len() >= self.config.max_size {
			SlotOutcome::Full
		} else {
			SlotOutcome::MustConstruct
		}
	}

	/// Acquires an idle connection, creating a fresh one if under `max_size`.
	/// Otherwise waits for a release up to `acquire_timeout`, failing with
	/// `PoolExhausted` once that deadline passes.
	pub async fn acquire(&self, acquired_by: impl Into<String>) -> Result<Lease> {
		let started = std::time::Instant::now();
		let acquired_by = acquired_by.into();

		loop {
			match self.try_acquire_slot(&acquired_by).await {
				SlotOutcome::Leased(lease) => return Ok(lease),
				SlotOutcome::MustConstruct => {
					let connection = self.adapter.connect().await?;
					let mut slots = self.slots.lock().await;
					let id = slots.next_id;
					slots.next_id += 1;
					let mut entry = PoolEntry::new(id, connection.clone());
					entry.state = ConnectionState::InUse;
					entry.in_flight_count = 1;
					entry.acquired_by = Some(acquired_by);
					entry.acquired_at = Some(Utc::now());
					slots.entries.push(entry);
					debug!(pool_size = slots.entries.len(), "grew connection pool");
					return Ok(Lease { id, connection });
				},
				SlotOutcome::Full => {
					let remaining = self.config.acquire_timeout.saturating_sub(started.elapsed());
					if remaining.is_zero() {
						self.events
							.publish(GatewayEvent::PoolExhausted {
								bridge: self.adapter.name().to_string(),
							})
							.await;
						return Err(GatewayError::PoolExhausted {
							waited: started.elapsed(),
						});
					}
					let notified = self.notify.notified();
					tokio::select! {
						_ = notified => continue,
						_ = tokio::time::sleep(remaining) => {
							self.events
								.publish(GatewayEvent::PoolExhausted {
									bridge: self.adapter.name().to_string(),
								})
								.await;
							return Err(GatewayError::PoolExhausted {
								waited: started.elapsed(),
							});
						}
					}
				},
			}
		}
	}

	/// Returns a leased connection to the idle set and wakes any blocked
	/// `acquire` waiters. Fails with `ConnectionClosed` if the slot was
	/// already reclaimed out from under the caller (evicted by the leak
	/// sweeper while still held) rather than silently no-opping.
	///
	/// Per spec §4.3, a connection going idle is closed immediately instead
	/// of rejoining the free list when the idle count already exceeds
	/// `max_idle` or the connection is older than `idle_ttl` — the background
	/// reaper only has to catch what this synchronous check doesn't, not carry
	/// the whole policy.
	pub async fn release(&self, lease: Lease) -> Result<()> {
		let mut slots = self.slots.lock().await;
		let Some(idx) = slots.entries.iter().position(|e| e.id == lease.id) else {
			drop(slots);
			self.notify.notify_waiters();
			return Err(GatewayError::ConnectionClosed(format!(
				"connection {} was reclaimed before release",
				lease.id
			)));
		};
		slots.entries[idx].in_flight_count = slots.entries[idx].in_flight_count.saturating_sub(1);
		slots.entries[idx].last_used = Utc::now();
		if slots.entries[idx].in_flight_count > 0 {
			drop(slots);
			self.notify.notify_waiters();
			return Ok(());
		}

		let idle_count = slots.entries.iter().filter(|e| e.state == ConnectionState::Idle).count();
		let is_aged_out = elapsed_since(slots.entries[idx].created_at) > self.config.idle_timeout;
		let over_idle_cap = idle_count >= self.config.max_idle;
		let would_drop_below_min = slots.entries.len().saturating_sub(1) < self.config.min_size;

		if (is_aged_out || over_idle_cap) && !would_drop_below_min {
			slots.entries.remove(idx);
			debug!(idle_count, over_idle_cap, is_aged_out, "closed connection on release instead of returning it idle");
		} else {
			let entry = &mut slots.entries[idx];
			entry.state = ConnectionState::Idle;
			entry.acquired_by = None;
			entry.acquired_at = None;
		}
		drop(slots);
		self.notify.notify_waiters();
		Ok(())
	}

	/// Closes every pooled connection and disconnects the adapter.
	pub async fn close(&self) -> Result<()> {
		let mut slots = self.slots.lock().await;
		slots.entries.clear();
		drop(slots);
		self.notify.notify_waiters();
		self.adapter.disconnect().await
	}

	pub async fn size(&self) -> usize {
		self.slots.lock().await.entries.len()
	}

	pub async fn idle_count(&self) -> usize {
		self.slots
			.lock()
			.await
			.entries
			.iter()
			.filter(|e| e.state == ConnectionState::Idle)
			.count()
	}

	/// Evicts connections idle longer than `idle_timeout`, never dropping
	/// below `min_size`.
	async fn reap_idle(&self) {
		let mut slots = self.slots.lock().await;
		let min_size = self.config.min_size;
		let idle_timeout = self.config.idle_timeout;
		let total = slots.entries.len();
		let taken = std::mem::take(&mut slots.entries);
		let mut kept = Vec::with_capacity(total);
		let mut evicted = 0;
		for entry in taken {
			let is_stale = entry.state == ConnectionState::Idle && elapsed_since(entry.last_used) > idle_timeout;
			let would_drop_below_min = total - evicted - 1 < min_size;
			if is_stale && !would_drop_below_min {
				evicted += 1;
				continue;
			}
			kept.push(entry);
		}
		slots.entries = kept;
		if evicted > 0 {
			debug!(evicted, "reaped idle pool connections");
		}
	}

	/// Marks connections held past `leak_timeout` as `Evicted` and logs a
	/// warning; a leaked connection is never silently returned to service.
	/// The original leaseholder learns of this only when it later calls
	/// `release` and gets back `ConnectionClosed`, since the pool holds no
	/// channel back to an in-flight caller.
	async fn sweep_leaks(&self) {
		let mut slots = self.slots.lock().await;
		let leak_timeout = self.config.leak_timeout;
		let mut leaked: Vec<String> = Vec::new();
		for entry in slots.entries.iter_mut() {
			if entry.state != ConnectionState::InUse {
				continue;
			}
			if let Some(acquired_at) = entry.acquired_at {
				let held_for = elapsed_since(acquired_at);
				if held_for > leak_timeout {
					let acquired_by = entry.acquired_by.clone().unwrap_or_else(|| "unknown".to_string());
					warn!(acquired_by = %acquired_by, held_for_secs = held_for.as_secs(), "connection leak detected, evicting");
					entry.state = ConnectionState::Evicted;
					leaked.push(acquired_by);
				}
			}
		}
		let had_evictions = !leaked.is_empty();
		slots.entries.retain(|e| e.state != ConnectionState::Evicted);
		drop(slots);
		if had_evictions {
			self.notify.notify_waiters();
			self.leaks.fetch_add(leaked.len() as u64, Ordering::Relaxed);
			for acquired_by in leaked {
				self.events
					.publish(GatewayEvent::ConnectionLeaked {
						bridge: self.adapter.name().to_string(),
						acquired_by,
					})
					.await;
			}
		}
	}

	/// Total connections ever evicted by the leak sweeper, for admin/metrics
	/// introspection.
	pub fn leaked_count(&self) -> u64 {
		self.leaks.load(Ordering::Relaxed)
	}

	/// Spawns the idle-reaper and leak-sweeper loops, both stopped by `ct`.
	pub fn spawn_maintenance(self: &Arc<Self>, ct: CancellationToken) {
		let pool = self.clone();
		let reap_ct = ct.clone();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(pool.config.idle_timeout / 2);
			loop {
				tokio::select! {
					_ = reap_ct.cancelled() => return,
					_ = interval.tick() => pool.reap_idle().await,
				}
			}
		});

		let pool = self.clone();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(pool.config.leak_timeout / 2);
			loop {
				tokio::select! {
					_ = ct.cancelled() => return,
					_ = interval.tick() => pool.sweep_leaks().await,
				}
			}
		});
	}
}
