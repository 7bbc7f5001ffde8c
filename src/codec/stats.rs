use chrono::{DateTime, Utc};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;

/// Monotonic counters tracked by every codec (spec §4.1).
#[derive(Clone, Debug, Default, Serialize)]
pub struct CodecStats {
	pub messages_encoded: u64,
	pub messages_decoded: u64,
	pub validation_errors: u64,
	pub encode_errors: u64,
	pub decode_errors: u64,
	pub total_bytes: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_message_at: Option<DateTime<Utc>>,
	pub processing_ns_total: u64,
	pub processing_count: u64,
}

impl CodecStats {
	/// `processing_ns_total / processing_count`, or `0.0` with no samples.
	pub fn avg_processing_ns(&self) -> f64 {
		if self.processing_count == 0 {
			0.0
		} else {
			self.processing_ns_total as f64 / self.processing_count as f64
		}
	}
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CodecLabel {
	codec: String,
}

/// Live counters for one codec instance, registered into a private
/// `prometheus-client` registry the same way `events.rs::MetricsSink`
/// registers its `Family<Labels, Counter>` gauges/counters into the shared
/// admin registry — one family per metric, labelled by codec name so the
/// registry composes cleanly if ever merged into a parent one.
pub(crate) struct StatsInner {
	label: CodecLabel,
	registry: Registry,
	messages_encoded: Family<CodecLabel, Counter>,
	messages_decoded: Family<CodecLabel, Counter>,
	validation_errors: Family<CodecLabel, Counter>,
	encode_errors: Family<CodecLabel, Counter>,
	decode_errors: Family<CodecLabel, Counter>,
	total_bytes: Family<CodecLabel, Counter>,
	last_message_at_ms: Family<CodecLabel, Gauge>,
	processing_ns_total: Family<CodecLabel, Counter>,
	processing_count: Family<CodecLabel, Counter>,
}

impl StatsInner {
	pub fn new(codec: impl Into<String>) -> Self {
		let mut registry = Registry::default();

		let messages_encoded = Family::default();
		registry.register("messages_encoded", "Messages encoded by this codec", messages_encoded.clone());
		let messages_decoded = Family::default();
		registry.register("messages_decoded", "Messages decoded by this codec", messages_decoded.clone());
		let validation_errors = Family::default();
		registry.register("validation_errors", "Messages that failed validation", validation_errors.clone());
		let encode_errors = Family::default();
		registry.register("encode_errors", "Encode failures", encode_errors.clone());
		let decode_errors = Family::default();
		registry.register("decode_errors", "Decode failures", decode_errors.clone());
		let total_bytes = Family::default();
		registry.register("total_bytes", "Total bytes encoded and decoded", total_bytes.clone());
		let last_message_at_ms = Family::default();
		registry.register("last_message_at_ms", "Unix epoch ms of the last encode/decode", last_message_at_ms.clone());
		let processing_ns_total = Family::default();
		registry.register("processing_ns_total", "Total nanoseconds spent encoding/decoding", processing_ns_total.clone());
		let processing_count = Family::default();
		registry.register("processing_count", "Count of processing samples", processing_count.clone());

		Self {
			label: CodecLabel { codec: codec.into() },
			registry,
			messages_encoded,
			messages_decoded,
			validation_errors,
			encode_errors,
			decode_errors,
			total_bytes,
			last_message_at_ms,
			processing_ns_total,
			processing_count,
		}
	}

	/// The private registry backing this codec's counters, for callers that
	/// want to fold it into a parent `Registry` (e.g. under a `sub_registry`).
	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	pub fn record_encode(&self, bytes: usize) {
		self.messages_encoded.get_or_create(&self.label).inc();
		self.total_bytes.get_or_create(&self.label).inc_by(bytes as u64);
		self.touch();
	}

	pub fn record_decode(&self, bytes: usize) {
		self.messages_decoded.get_or_create(&self.label).inc();
		self.total_bytes.get_or_create(&self.label).inc_by(bytes as u64);
		self.touch();
	}

	pub fn record_processing(&self, nanos: u64) {
		self.processing_ns_total.get_or_create(&self.label).inc_by(nanos);
		self.processing_count.get_or_create(&self.label).inc();
	}

	fn touch(&self) {
		self.last_message_at_ms.get_or_create(&self.label).set(Utc::now().timestamp_millis());
	}

	pub fn snapshot(&self) -> CodecStats {
		let ms = self.last_message_at_ms.get_or_create(&self.label).get();
		let last_message_at = if ms == 0 { None } else { DateTime::from_timestamp_millis(ms) };
		CodecStats {
			messages_encoded: self.messages_encoded.get_or_create(&self.label).get(),
			messages_decoded: self.messages_decoded.get_or_create(&self.label).get(),
			validation_errors: self.validation_errors.get_or_create(&self.label).get(),
			encode_errors: self.encode_errors.get_or_create(&self.label).get(),
			decode_errors: self.decode_errors.get_or_create(&self.label).get(),
			total_bytes: self.total_bytes.get_or_create(&self.label).get(),
			last_message_at,
			processing_ns_total: self.processing_ns_total.get_or_create(&self.label).get(),
			processing_count: self.processing_count.get_or_create(&self.label).get(),
		}
	}
}

/// "validation_errors" has a field named `validation_errors`; increment
/// helpers beyond `record_encode`/`record_decode` live on `CodecCore` and
/// call straight through to the matching family here.
impl StatsInner {
	pub fn increment_validation_errors(&self) {
		self.validation_errors.get_or_create(&self.label).inc();
	}

	pub fn increment_encode_errors(&self) {
		self.encode_errors.get_or_create(&self.label).inc();
	}

	pub fn increment_decode_errors(&self) {
		self.decode_errors.get_or_create(&self.label).inc();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn avg_processing_ns_with_no_samples_is_zero() {
		let s = CodecStats::default();
		assert_eq!(s.avg_processing_ns(), 0.0);
	}

	#[test]
	fn avg_processing_ns_divides_total_by_count() {
		let mut s = CodecStats::default();
		s.processing_ns_total = 1000;
		s.processing_count = 4;
		assert_eq!(s.avg_processing_ns(), 250.0);
	}

	#[test]
	fn record_encode_and_decode_feed_prometheus_families() {
		let inner = StatsInner::new("json");
		inner.record_encode(10);
		inner.record_encode(5);
		inner.record_decode(8);
		let snapshot = inner.snapshot();
		assert_eq!(snapshot.messages_encoded, 2);
		assert_eq!(snapshot.messages_decoded, 1);
		assert_eq!(snapshot.total_bytes, 23);
		assert!(snapshot.last_message_at.is_some());
	}

	#[test]
	fn error_counters_increment_independently() {
		let inner = StatsInner::new("json");
		inner.increment_validation_errors();
		inner.increment_encode_errors();
		inner.increment_encode_errors();
		let snapshot = inner.snapshot();
		assert_eq!(snapshot.validation_errors, 1);
		assert_eq!(snapshot.encode_errors, 2);
		assert_eq!(snapshot.decode_errors, 0);
	}
}
