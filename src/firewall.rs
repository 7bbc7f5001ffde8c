//! Rate limiter / firewall admission layer (spec §4.4).
//!
//! Grounded on the teacher's `rbac::RbacEngine`: a flat rule list checked
//! against a match context, generalized from "claims equality" to the
//! priority-ordered predicate/action model spec.md §3/§4.4 describes.
//! `evaluate()` always returns the richer tuple-shaped [`FirewallDecision`]
//! per §9's resolution of the Open Question; substring/prefix matching uses
//! `str::contains`/`str::starts_with` directly rather than porting a broken
//! helper. IP rules match via `ipnet` CIDR membership (the teacher carries
//! `ipnet` for the same reason: a bare string-equality match can't express
//! "any address in 10.0.0.0/8").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{Direction, Rule, RuleAction, RuleType};

/// What a rule is checked against; assembled by the caller (typically the
/// [`crate::bridge::Bridge`] dispatch path) from the inbound request.
#[derive(Clone, Debug, Default)]
pub struct MatchContext {
	pub source_ip: Option<String>,
	pub url: Option<String>,
	pub headers: HashMap<String, String>,
	pub content: Option<String>,
	pub direction: Direction,
	/// Overrides the rate-limit key derived from `source_ip`/`url`.
	pub rate_key: Option<String>,
}

impl MatchContext {
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
	Allow,
	Deny,
	/// Denied specifically because a `rate`-typed rule's bucket is exhausted;
	/// kept distinct from a plain `Deny` so callers can surface
	/// `GatewayError::RateLimitExceeded`'s `throttle_for` hint instead of a
	/// bare access-denied error.
	RateLimited,
	Log,
	Challenge,
}

/// Uniform result of [`Firewall::evaluate`] (spec §9 design note).
#[derive(Clone, Debug)]
pub struct FirewallDecision {
	pub action: Verdict,
	pub matched_rule: Option<String>,
	pub reason: String,
	pub throttle_for: Option<Duration>,
	pub remaining: Option<u32>,
	pub reset_at: Option<DateTime<Utc>>,
}

impl FirewallDecision {
	fn allow(reason: impl Into<String>) -> Self {
		Self {
			action: Verdict::Allow,
			matched_rule: None,
			reason: reason.into(),
			throttle_for: None,
			remaining: None,
			reset_at: None,
		}
	}
}

/// Matches `rule.match_spec` (a single address or a CIDR block, e.g.
/// `10.0.0.0/8`) against `source_ip`. A bare address is treated as a /32
/// (or /128) network so exact-match rules keep working unchanged.
fn ip_matches(match_spec: &str, source_ip: &str) -> bool {
	let source_addr: std::net::IpAddr = match source_ip.parse() {
		Ok(addr) => addr,
		Err(_) => return false,
	};
	if let Ok(net) = match_spec.parse::<IpNet>() {
		return net.contains(&source_addr);
	}
	match_spec.parse::<std::net::IpAddr>().is_ok_and(|addr| addr == source_addr)
}

fn rule_matches(rule: &Rule, ctx: &MatchContext) -> bool {
	if rule.direction != ctx.direction {
		return false;
	}
	match rule.rule_type {
		RuleType::Ip => ctx.source_ip.as_deref().is_some_and(|ip| ip_matches(&rule.match_spec, ip)),
		RuleType::Url => ctx
			.url
			.as_deref()
			.is_some_and(|url| url.starts_with(&rule.match_spec) || url.contains(&rule.match_spec)),
		RuleType::Header => rule
			.match_spec
			.split_once('=')
			.is_some_and(|(name, value)| ctx.header(name) == Some(value)),
		RuleType::Content => ctx.content.as_deref().is_some_and(|c| c.contains(&rule.match_spec)),
		RuleType::Rate | RuleType::Geo => true,
	}
}

fn rate_key_for(rule: &Rule, ctx: &MatchContext) -> String {
	if let Some(key) = &ctx.rate_key {
		return key.clone();
	}
	let default_fields = ["source_ip".to_string()];
	let fields = rule.rate_key_override.as_deref().unwrap_or(&default_fields);
	fields
		.iter()
		.map(|field| match field.as_str() {
			"source_ip" => ctx.source_ip.clone().unwrap_or_default(),
			"url" => ctx.url.clone().unwrap_or_default(),
			other => ctx.header(other).unwrap_or_default().to_string(),
		})
		.collect::<Vec<_>>()
		.join(":")
}

/// Sliding-window token bucket per rate-limit key, with a burst allowance.
struct Bucket {
	tokens: f64,
	last_refill: DateTime<Utc>,
	last_touched: DateTime<Utc>,
}

/// Crate-wide rate limiter defaults, overridden per-rule by
/// `Rule.rate_limit`/`rate_burst_factor` (spec §4.4/§6's
/// `security.rateLimiting.{defaultLimit,interval}`).
#[derive(Clone, Copy, Debug)]
pub struct RateLimitDefaults {
	pub refill_per_sec: f64,
	pub burst_factor: f64,
}

impl Default for RateLimitDefaults {
	fn default() -> Self {
		Self {
			refill_per_sec: 10.0,
			burst_factor: 1.5,
		}
	}
}

struct RateLimiter {
	buckets: RwLock<HashMap<String, Bucket>>,
	max_entries: usize,
	entry_ttl: Duration,
	defaults: RateLimitDefaults,
	evictions: AtomicU64,
}

impl RateLimiter {
	fn new(max_entries: usize, entry_ttl: Duration, defaults: RateLimitDefaults) -> Self {
		Self {
			buckets: RwLock::new(HashMap::new()),
			max_entries,
			entry_ttl,
			defaults,
			evictions: AtomicU64::new(0),
		}
	}

	/// Refills then attempts to withdraw one token for `key`, at `rule`'s
	/// refill rate/burst factor if it overrides the crate-wide defaults;
	/// returns `(allowed, remaining, throttle_for, reset_at)`.
	async fn check(&self, key: &str, rule: &Rule) -> (bool, u32, Option<Duration>, DateTime<Utc>) {
		let refill_per_sec = rule.rate_limit.unwrap_or(self.defaults.refill_per_sec);
		let burst_factor = rule.rate_burst_factor.unwrap_or(self.defaults.burst_factor);
		let capacity = refill_per_sec * burst_factor;
		let mut buckets = self.buckets.write().await;
		let now = Utc::now();
		let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
			tokens: capacity,
			last_refill: now,
			last_touched: now,
		});
		let elapsed = (now - bucket.last_refill).to_std().unwrap_or(Duration::ZERO).as_secs_f64();
		bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
		bucket.last_refill = now;
		bucket.last_touched = now;

		if bucket.tokens >= 1.0 {
			bucket.tokens -= 1.0;
			let remaining = bucket.tokens.floor().max(0.0) as u32;
			(true, remaining, None, now)
		} else {
			let deficit = 1.0 - bucket.tokens;
			let wait = Duration::from_secs_f64(deficit / refill_per_sec);
			(
				false,
				0,
				Some(wait),
				now + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero()),
			)
		}
	}

	/// Drops buckets untouched for `entry_ttl`, then LRU-evicts down to
	/// `max_entries` if still over capacity.
	async fn sweep(&self) {
		let mut buckets = self.buckets.write().await;
		let ttl = self.entry_ttl;
		let before = buckets.len();
		buckets.retain(|_, bucket| (Utc::now() - bucket.last_touched).to_std().unwrap_or(Duration::ZERO) <= ttl);
		if buckets.len() > self.max_entries {
			let mut by_age: Vec<(String, DateTime<Utc>)> =
				buckets.iter().map(|(k, v)| (k.clone(), v.last_touched)).collect();
			by_age.sort_by_key(|(_, touched)| *touched);
			let overflow = buckets.len() - self.max_entries;
			for (key, _) in by_age.into_iter().take(overflow) {
				buckets.remove(&key);
			}
		}
		let evicted = before.saturating_sub(buckets.len());
		if evicted > 0 {
			self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
			debug!(evicted, "swept stale rate limiter entries");
		}
	}
}

/// Priority-ordered rule set plus the sliding-window limiter it consults for
/// `rate`-typed rules.
pub struct Firewall {
	rules: RwLock<Vec<Rule>>,
	limiter: RateLimiter,
	next_sequence: AtomicU64,
}

impl Firewall {
	pub fn new(max_rate_entries: usize, rate_entry_ttl: Duration) -> Self {
		Self::with_rate_defaults(max_rate_entries, rate_entry_ttl, RateLimitDefaults::default())
	}

	pub fn with_rate_defaults(max_rate_entries: usize, rate_entry_ttl: Duration, defaults: RateLimitDefaults) -> Self {
		Self {
			rules: RwLock::new(Vec::new()),
			limiter: RateLimiter::new(max_rate_entries, rate_entry_ttl, defaults),
			next_sequence: AtomicU64::new(0),
		}
	}

	/// Adds a rule, stamping it with an insertion sequence used to break
	/// priority ties deterministically (first-registered wins).
	pub async fn add_rule(&self, mut rule: Rule) {
		rule.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
		let mut rules = self.rules.write().await;
		rules.push(rule);
		rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));
	}

	pub async fn remove_rule(&self, id: &str) -> bool {
		let mut rules = self.rules.write().await;
		let before = rules.len();
		rules.retain(|r| r.id != id);
		rules.len() != before
	}

	pub async fn rules(&self) -> Vec<Rule> {
		self.rules.read().await.clone()
	}

	/// Evaluates `ctx` against every enabled rule in priority order. The
	/// first matching rule decides; if none match, the request is allowed.
	pub async fn evaluate(&self, ctx: &MatchContext) -> FirewallDecision {
		let rules = self.rules.read().await;
		for rule in rules.iter().filter(|r| r.enabled) {
			if !rule_matches(rule, ctx) {
				continue;
			}
			return match rule.action {
				RuleAction::Allow => FirewallDecision {
					action: Verdict::Allow,
					matched_rule: Some(rule.id.clone()),
					reason: format!("allowed by rule {}", rule.id),
					throttle_for: None,
					remaining: None,
					reset_at: None,
				},
				RuleAction::Deny => FirewallDecision {
					action: Verdict::Deny,
					matched_rule: Some(rule.id.clone()),
					reason: format!("denied by rule {}", rule.id),
					throttle_for: None,
					remaining: None,
					reset_at: None,
				},
				RuleAction::Log => {
					debug!(rule_id = %rule.id, "firewall rule matched (log-only)");
					continue;
				},
				RuleAction::Challenge => FirewallDecision {
					action: Verdict::Challenge,
					matched_rule: Some(rule.id.clone()),
					reason: format!("challenge required by rule {}", rule.id),
					throttle_for: None,
					remaining: None,
					reset_at: None,
				},
				RuleAction::Rate => {
					let key = rate_key_for(rule, ctx);
					let (allowed, remaining, throttle_for, reset_at) = self.limiter.check(&key, rule).await;
					if allowed {
						FirewallDecision {
							action: Verdict::Allow,
							matched_rule: Some(rule.id.clone()),
							reason: format!("within rate limit for rule {}", rule.id),
							throttle_for: None,
							remaining: Some(remaining),
							reset_at: Some(reset_at),
						}
					} else {
						FirewallDecision {
							action: Verdict::RateLimited,
							matched_rule: Some(rule.id.clone()),
							reason: format!("rate limit exceeded for rule {}", rule.id),
							throttle_for,
							remaining: Some(0),
							reset_at: Some(reset_at),
						}
					}
				},
			};
		}
		FirewallDecision::allow("no rule matched")
	}

	/// Spawns the periodic rate-limiter sweep, grounded on `authn::sync_jwks_loop`'s
	/// `tokio::select!` + `CancellationToken` shape.
	pub fn spawn_sweeper(self: &std::sync::Arc<Self>, ct: CancellationToken, interval: Duration) {
		let firewall = self.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			loop {
				tokio::select! {
					_ = ct.cancelled() => return,
					_ = ticker.tick() => firewall.limiter.sweep().await,
				}
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rule(id: &str, rule_type: RuleType, priority: i64, action: RuleAction, match_spec: &str) -> Rule {
		Rule {
			id: id.to_string(),
			rule_type,
			direction: Direction::Inbound,
			priority,
			action,
			match_spec: match_spec.to_string(),
			enabled: true,
			rate_key_override: None,
			rate_limit: None,
			rate_burst_factor: None,
			sequence: 0,
		}
	}

	#[tokio::test]
	async fn no_rules_allows_everything() {
		let firewall = Firewall::new(1000, Duration::from_secs(60));
		let decision = firewall.evaluate(&MatchContext::default()).await;
		assert_eq!(decision.action, Verdict::Allow);
		assert!(decision.matched_rule.is_none());
	}

	#[tokio::test]
	async fn higher_priority_rule_wins_over_lower() {
		let firewall = Firewall::new(1000, Duration::from_secs(60));
		firewall
			.add_rule(rule("allow-all", RuleType::Ip, 1, RuleAction::Allow, "1.2.3.4"))
			.await;
		firewall
			.add_rule(rule("deny-ip", RuleType::Ip, 10, RuleAction::Deny, "1.2.3.4"))
			.await;
		let ctx = MatchContext {
			source_ip: Some("1.2.3.4".to_string()),
			..Default::default()
		};
		let decision = firewall.evaluate(&ctx).await;
		assert_eq!(decision.action, Verdict::Deny);
		assert_eq!(decision.matched_rule.as_deref(), Some("deny-ip"));
	}

	#[tokio::test]
	async fn url_prefix_rule_matches_starts_with() {
		let firewall = Firewall::new(1000, Duration::from_secs(60));
		firewall
			.add_rule(rule("block-admin", RuleType::Url, 1, RuleAction::Deny, "/admin"))
			.await;
		let ctx = MatchContext {
			url: Some("/admin/users".to_string()),
			..Default::default()
		};
		let decision = firewall.evaluate(&ctx).await;
		assert_eq!(decision.action, Verdict::Deny);
	}

	#[tokio::test]
	async fn rate_rule_denies_after_burst_exhausted() {
		let firewall = Firewall::new(1000, Duration::from_secs(60));
		firewall
			.add_rule(rule("throttle", RuleType::Rate, 1, RuleAction::Rate, ""))
			.await;
		let ctx = MatchContext {
			source_ip: Some("9.9.9.9".to_string()),
			..Default::default()
		};
		let mut last = None;
		for _ in 0..40 {
			last = Some(firewall.evaluate(&ctx).await);
		}
		let decision = last.unwrap();
		assert_eq!(decision.action, Verdict::RateLimited);
		assert!(decision.throttle_for.is_some());
	}

	#[tokio::test]
	async fn ip_rule_matches_cidr_block() {
		let firewall = Firewall::new(1000, Duration::from_secs(60));
		firewall
			.add_rule(rule("deny-subnet", RuleType::Ip, 10, RuleAction::Deny, "10.0.0.0/8"))
			.await;
		let ctx = MatchContext {
			source_ip: Some("10.1.2.3".to_string()),
			..Default::default()
		};
		let decision = firewall.evaluate(&ctx).await;
		assert_eq!(decision.action, Verdict::Deny);
		let ctx = MatchContext {
			source_ip: Some("11.1.2.3".to_string()),
			..Default::default()
		};
		let decision = firewall.evaluate(&ctx).await;
		assert_eq!(decision.action, Verdict::Allow);
	}

	#[tokio::test]
	async fn disabled_rule_is_skipped() {
		let firewall = Firewall::new(1000, Duration::from_secs(60));
		let mut r = rule("deny-ip", RuleType::Ip, 10, RuleAction::Deny, "1.2.3.4");
		r.enabled = false;
		firewall.add_rule(r).await;
		let ctx = MatchContext {
			source_ip: Some("1.2.3.4".to_string()),
			..Default::default()
		};
		let decision = firewall.evaluate(&ctx).await;
		assert_eq!(decision.action, Verdict::Allow);
	}

	#[tokio::test]
	async fn sweep_evicts_entries_past_ttl() {
		let firewall = Firewall::new(1000, Duration::from_millis(1));
		let throttle_rule = rule("throttle", RuleType::Rate, 1, RuleAction::Rate, "");
		let _ = firewall.limiter.check("k1", &throttle_rule).await;
		tokio::time::sleep(Duration::from_millis(5)).await;
		firewall.limiter.sweep().await;
		assert!(firewall.limiter.buckets.read().await.is_empty());
	}
}
