//! Plugin registry (spec §4.6): register/unregister/get/list plugins
//! (codecs or adapters) and track start-order dependencies between them.
//!
//! Per §9's design note, this is one explicit `Registry` value threaded
//! through the [`crate::manager::BridgeManager`], not the teacher's
//! process-wide `lazy_static! DEFAULT_ID` pattern — a gateway process hosts
//! more than one independently configured bridge set in tests, so a global
//! would leak state between them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::codec::Capability;
use crate::error::{GatewayError, Result};

/// What kind of plugin an entry is; a registry holds both codecs and
/// adapters side by side so a bridge can be assembled by name alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PluginType {
	Codec,
	Adapter,
}

#[derive(Clone)]
pub struct PluginEntry {
	pub id: String,
	pub plugin_type: PluginType,
	pub capabilities: HashSet<Capability>,
	pub codec: Option<Arc<dyn crate::codec::Codec>>,
	pub adapter: Option<Arc<dyn crate::adapter::Adapter>>,
}

#[derive(Default)]
struct Graph {
	entries: HashMap<String, PluginEntry>,
	/// `id -> ids it depends on`.
	depends_on: HashMap<String, HashSet<String>>,
}

/// Whether `entry`'s underlying codec/adapter plugin is currently in the
/// `Started` state.
fn entry_is_started(entry: &PluginEntry) -> bool {
	if let Some(codec) = &entry.codec {
		return codec.state() == crate::codec::PluginState::Started;
	}
	if let Some(adapter) = &entry.adapter {
		return adapter.state() == crate::codec::PluginState::Started;
	}
	false
}

/// A registered constructor for a plugin *kind* (e.g. `"http"`, `"json"`),
/// invoked by [`Registry::create`] to instantiate a named plugin instance
/// from that kind plus a config map, the way the teacher's adapter/codec
/// `match kind.as_str()` in `main.rs` picks a constructor — except kept in
/// the registry itself instead of inlined at the call site, so a caller
/// never has to know the closed set of kinds up front.
type AdapterFactory = Arc<dyn Fn(String) -> Arc<dyn crate::adapter::Adapter> + Send + Sync>;
type CodecFactory = Arc<dyn Fn(String) -> Arc<dyn crate::codec::Codec> + Send + Sync>;

#[derive(Default)]
struct Factories {
	adapters: HashMap<String, AdapterFactory>,
	codecs: HashMap<String, CodecFactory>,
}

/// Owns every registered codec/adapter plugin, the dependency edges between
/// them, and the factories `create` dispatches to (spec §4.6).
pub struct Registry {
	graph: RwLock<Graph>,
	factories: RwLock<Factories>,
}

impl Registry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			graph: RwLock::new(Graph::default()),
			factories: RwLock::new(Factories::default()),
		})
	}

	/// Registers a constructor for adapter kind `factory_id` (e.g. `"http"`).
	pub async fn register_adapter_factory<F>(&self, factory_id: impl Into<String>, factory: F)
	where
		F: Fn(String) -> Arc<dyn crate::adapter::Adapter> + Send + Sync + 'static,
	{
		self.factories.write().await.adapters.insert(factory_id.into(), Arc::new(factory));
	}

	/// Registers a constructor for codec kind `factory_id` (e.g. `"json"`).
	pub async fn register_codec_factory<F>(&self, factory_id: impl Into<String>, factory: F)
	where
		F: Fn(String) -> Arc<dyn crate::codec::Codec> + Send + Sync + 'static,
	{
		self.factories.write().await.codecs.insert(factory_id.into(), Arc::new(factory));
	}

	/// Instantiates and registers a plugin named `plugin_id` from the
	/// constructor registered under `factory_id`, initializing adapters with
	/// `config` before they're added to the graph. Fails with
	/// `PluginNotFound(factory_id)` if no factory is registered for that
	/// kind.
	pub async fn create(&self, factory_id: &str, plugin_id: &str, config: HashMap<String, String>) -> Result<()> {
		let adapter_factory = self.factories.read().await.adapters.get(factory_id).cloned();
		if let Some(factory) = adapter_factory {
			let adapter = factory(plugin_id.to_string());
			adapter.initialize(config).await?;
			self.register_adapter(adapter).await;
			return Ok(());
		}
		let codec_factory = self.factories.read().await.codecs.get(factory_id).cloned();
		if let Some(factory) = codec_factory {
			let codec = factory(plugin_id.to_string());
			self.register_codec(codec).await;
			return Ok(());
		}
		Err(GatewayError::PluginNotFound(factory_id.to_string()))
	}

	pub async fn register_codec(&self, codec: Arc<dyn crate::codec::Codec>) {
		let id = codec.name().to_string();
		let capabilities = codec.capabilities();
		let mut graph = self.graph.write().await;
		graph.entries.insert(
			id.clone(),
			PluginEntry {
				id,
				plugin_type: PluginType::Codec,
				capabilities,
				codec: Some(codec),
				adapter: None,
			},
		);
	}

	pub async fn register_adapter(&self, adapter: Arc<dyn crate::adapter::Adapter>) {
		let id = adapter.name().to_string();
		let mut graph = self.graph.write().await;
		graph.entries.insert(
			id.clone(),
			PluginEntry {
				id,
				plugin_type: PluginType::Adapter,
				capabilities: HashSet::new(),
				codec: None,
				adapter: Some(adapter),
			},
		);
	}

	/// Per spec.md:147, `id` cannot be unregistered (and therefore cannot be
	/// stopped) while any started plugin still depends on it.
	pub async fn unregister(&self, id: &str) -> Result<()> {
		let mut graph = self.graph.write().await;
		if !graph.entries.contains_key(id) {
			return Err(GatewayError::PluginNotFound(id.to_string()));
		}
		for (dependent, deps) in graph.depends_on.iter() {
			if !deps.contains(id) {
				continue;
			}
			let Some(entry) = graph.entries.get(dependent) else { continue };
			if entry_is_started(entry) {
				return Err(GatewayError::PluginInUse {
					plugin_id: id.to_string(),
					dependent: dependent.clone(),
				});
			}
		}
		graph.entries.remove(id);
		graph.depends_on.remove(id);
		for deps in graph.depends_on.values_mut() {
			deps.remove(id);
		}
		Ok(())
	}

	pub async fn get(&self, id: &str) -> Result<PluginEntry> {
		self.graph
			.read()
			.await
			.entries
			.get(id)
			.cloned()
			.ok_or_else(|| GatewayError::PluginNotFound(id.to_string()))
	}

	pub async fn list_by_type(&self, plugin_type: PluginType) -> Vec<PluginEntry> {
		self.graph
			.read()
			.await
			.entries
			.values()
			.filter(|e| e.plugin_type == plugin_type)
			.cloned()
			.collect()
	}

	pub async fn list_by_capability(&self, capability: Capability) -> Vec<PluginEntry> {
		self.graph
			.read()
			.await
			.entries
			.values()
			.filter(|e| e.capabilities.contains(&capability))
			.cloned()
			.collect()
	}

	/// Declares that `id` must start only after `depends_on` has started.
	/// Fails with `PluginNotFound` if either side is unregistered.
	pub async fn add_dependency(&self, id: &str, depends_on: &str) -> Result<()> {
		let mut graph = self.graph.write().await;
		if !graph.entries.contains_key(id) {
			return Err(GatewayError::PluginNotFound(id.to_string()));
		}
		if !graph.entries.contains_key(depends_on) {
			return Err(GatewayError::PluginNotFound(depends_on.to_string()));
		}
		graph.depends_on.entry(id.to_string()).or_default().insert(depends_on.to_string());
		Ok(())
	}

	/// Topologically orders every registered plugin so that each entry
	/// appears after everything it depends on. Fails with `Internal` if the
	/// dependency graph has a cycle.
	pub async fn start_order(&self) -> Result<Vec<String>> {
		let graph = self.graph.read().await;
		let mut visited: HashSet<String> = HashSet::new();
		let mut visiting: HashSet<String> = HashSet::new();
		let mut order = Vec::with_capacity(graph.entries.len());

		fn visit(
			id: &str,
			graph: &Graph,
			visited: &mut HashSet<String>,
			visiting: &mut HashSet<String>,
			order: &mut Vec<String>,
		) -> Result<()> {
			if visited.contains(id) {
				return Ok(());
			}
			if !visiting.insert(id.to_string()) {
				return Err(GatewayError::Internal(format!("dependency cycle detected at {id}")));
			}
			if let Some(deps) = graph.depends_on.get(id) {
				for dep in deps {
					visit(dep, graph, visited, visiting, order)?;
				}
			}
			visiting.remove(id);
			visited.insert(id.to_string());
			order.push(id.to_string());
			Ok(())
		}

		let mut ids: Vec<&String> = graph.entries.keys().collect();
		ids.sort();
		for id in ids {
			visit(id, &graph, &mut visited, &mut visiting, &mut order)?;
		}
		Ok(order)
	}

	/// Fails with `DependencyUnmet` if `id` depends on a plugin not present
	/// in `started`.
	pub async fn check_dependencies_started(&self, id: &str, started: &HashSet<String>) -> Result<()> {
		let graph = self.graph.read().await;
		if let Some(deps) = graph.depends_on.get(id) {
			for dep in deps {
				if !started.contains(dep) {
					return Err(GatewayError::DependencyUnmet {
						plugin_id: id.to_string(),
						depends_on: dep.clone(),
					});
				}
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::adapter::LoopbackAdapter;
	use crate::codec::{Codec, JsonCodec};

	#[tokio::test]
	async fn get_missing_plugin_is_plugin_not_found() {
		let registry = Registry::new();
		let err = registry.get("nope").await;
		assert!(matches!(err, Err(GatewayError::PluginNotFound(_))));
	}

	#[tokio::test]
	async fn register_then_get_round_trips() {
		let registry = Registry::new();
		registry.register_codec(Arc::new(JsonCodec::new("json"))).await;
		let entry = registry.get("json").await.unwrap();
		assert_eq!(entry.plugin_type, PluginType::Codec);
	}

	#[tokio::test]
	async fn list_by_capability_filters_correctly() {
		let registry = Registry::new();
		registry.register_codec(Arc::new(JsonCodec::new("json"))).await;
		let matches = registry.list_by_capability(Capability::Encode).await;
		assert_eq!(matches.len(), 1);
		let matches = registry.list_by_capability(Capability::Streaming).await;
		assert!(matches.is_empty());
	}

	#[tokio::test]
	async fn start_order_respects_dependencies() {
		let registry = Registry::new();
		registry.register_codec(Arc::new(JsonCodec::new("json"))).await;
		registry.register_adapter(Arc::new(LoopbackAdapter::new("loop"))).await;
		registry.add_dependency("json", "loop").await.unwrap();
		let order = registry.start_order().await.unwrap();
		let json_pos = order.iter().position(|id| id == "json").unwrap();
		let loop_pos = order.iter().position(|id| id == "loop").unwrap();
		assert!(loop_pos < json_pos);
	}

	#[tokio::test]
	async fn dependency_on_unregistered_plugin_fails() {
		let registry = Registry::new();
		registry.register_codec(Arc::new(JsonCodec::new("json"))).await;
		let err = registry.add_dependency("json", "missing").await;
		assert!(matches!(err, Err(GatewayError::PluginNotFound(_))));
	}

	#[tokio::test]
	async fn create_instantiates_and_registers_from_a_factory() {
		let registry = Registry::new();
		registry.register_codec_factory("json", |id| Arc::new(JsonCodec::new(id))).await;
		registry.create("json", "my-codec", HashMap::new()).await.unwrap();
		let entry = registry.get("my-codec").await.unwrap();
		assert_eq!(entry.plugin_type, PluginType::Codec);
	}

	#[tokio::test]
	async fn create_initializes_adapters_with_config() {
		let registry = Registry::new();
		registry
			.register_adapter_factory("loopback", |id| Arc::new(LoopbackAdapter::new(id)))
			.await;
		registry.create("loopback", "my-adapter", HashMap::new()).await.unwrap();
		let entry = registry.get("my-adapter").await.unwrap();
		assert_eq!(entry.plugin_type, PluginType::Adapter);
	}

	#[tokio::test]
	async fn create_with_unknown_factory_id_is_plugin_not_found() {
		let registry = Registry::new();
		let err = registry.create("nope", "x", HashMap::new()).await;
		assert!(matches!(err, Err(GatewayError::PluginNotFound(_))));
	}

	#[tokio::test]
	async fn unregister_fails_while_a_started_plugin_still_depends_on_it() {
		let registry = Registry::new();
		let codec = Arc::new(JsonCodec::new("json"));
		codec.initialize().await.unwrap();
		codec.start().await.unwrap();
		registry.register_codec(codec).await;
		registry.register_adapter(Arc::new(LoopbackAdapter::new("loop"))).await;
		registry.add_dependency("json", "loop").await.unwrap();

		let err = registry.unregister("loop").await;
		assert!(matches!(err, Err(GatewayError::PluginInUse { .. })));
		assert!(registry.get("loop").await.is_ok(), "dependency must still be registered after the failed unregister");
	}

	#[tokio::test]
	async fn unregister_succeeds_once_the_dependent_is_not_started() {
		let registry = Registry::new();
		registry.register_codec(Arc::new(JsonCodec::new("json"))).await;
		registry.register_adapter(Arc::new(LoopbackAdapter::new("loop"))).await;
		registry.add_dependency("json", "loop").await.unwrap();

		registry.unregister("loop").await.unwrap();
		assert!(registry.get("loop").await.is_err());
	}

	#[tokio::test]
	async fn check_dependencies_started_reports_unmet() {
		let registry = Registry::new();
		registry.register_codec(Arc::new(JsonCodec::new("json"))).await;
		registry.register_adapter(Arc::new(LoopbackAdapter::new("loop"))).await;
		registry.add_dependency("json", "loop").await.unwrap();
		let err = registry.check_dependencies_started("json", &HashSet::new()).await;
		assert!(matches!(err, Err(GatewayError::DependencyUnmet { .. })));
		let mut started = HashSet::new();
		started.insert("loop".to_string());
		assert!(registry.check_dependencies_started("json", &started).await.is_ok());
	}
}
