use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use prometheus_client::registry::Registry as PromRegistry;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use agentgateway::adapter::{HttpAdapter, LoopbackAdapter};
use agentgateway::admin::{self, AdminState};
use agentgateway::bridge::Bridge;
use agentgateway::codec::JsonCodec;
use agentgateway::config::{self, Config};
use agentgateway::events::{EventBus, MetricsSink};
use agentgateway::firewall::{Firewall, RateLimitDefaults};
use agentgateway::manager::BridgeManager;
use agentgateway::pool::{ConnectionPool, PoolConfig};
use agentgateway::registry::{PluginType, Registry};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Load configuration from a file.
	#[arg(short, long, value_name = "file")]
	file: Option<std::path::PathBuf>,

	/// Load configuration from an inline JSON/YAML string.
	#[arg(short, long, value_name = "config")]
	config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let raw = match (args.file, args.config) {
		(Some(path), None) => tokio::fs::read_to_string(path).await?,
		(None, Some(inline)) => inline,
		(Some(_), Some(_)) => bail!("both --file and --config cannot be provided"),
		(None, None) => bail!("either --file or --config must be provided"),
	};

	let Config::Local(local) = config::parse_config(&raw).context("invalid configuration")?;
	local.validate_posture().context("security posture check failed")?;

	let mut prom_registry = PromRegistry::default();
	let events = EventBus::new();
	let metrics = Arc::new(MetricsSink::new(&mut prom_registry));
	let (_metrics_subscriber_id, metrics_rx) = events.subscribe(256).await;
	MetricsSink::spawn_drain(metrics, metrics_rx);

	let rate_defaults = RateLimitDefaults {
		refill_per_sec: local.security.rate_limiting.refill_per_sec(),
		burst_factor: local.security.rate_limiting.burst_factor,
	};
	let firewall = Arc::new(Firewall::with_rate_defaults(10_000, Duration::from_secs(600), rate_defaults));
	for rule in local.firewall_rules.clone() {
		firewall.add_rule(rule).await;
	}

	let ct = CancellationToken::new();
	firewall.spawn_sweeper(ct.clone(), Duration::from_secs(600));

	let manager = BridgeManager::new(events.clone(), local.health_interval(), Duration::from_secs(30));
	let registry = Registry::new();
	registry.register_adapter_factory("http", |id| Arc::new(HttpAdapter::new(id))).await;
	registry.register_adapter_factory("loopback", |id| Arc::new(LoopbackAdapter::new(id))).await;
	registry.register_codec_factory("json", |id| Arc::new(JsonCodec::new(id))).await;

	for adapter_cfg in &local.adapters {
		registry
			.create(&adapter_cfg.kind, &adapter_cfg.name, adapter_cfg.config.clone())
			.await
			.map_err(|e| anyhow::anyhow!("adapter {} ({}) failed to initialize: {e}", adapter_cfg.name, adapter_cfg.kind))?;
	}
	for codec_cfg in &local.codecs {
		registry
			.create(&codec_cfg.kind, &codec_cfg.name, HashMap::new())
			.await
			.map_err(|e| anyhow::anyhow!("codec {} ({}) failed to register: {e}", codec_cfg.name, codec_cfg.kind))?;
	}

	for bridge_cfg in &local.bridges {
		registry.add_dependency(&bridge_cfg.codec, &bridge_cfg.adapter).await.ok();
		let adapter_entry = registry
			.get(&bridge_cfg.adapter)
			.await
			.with_context(|| format!("bridge {} references unknown adapter {}", bridge_cfg.name, bridge_cfg.adapter))?;
		let codec_entry = registry
			.get(&bridge_cfg.codec)
			.await
			.with_context(|| format!("bridge {} references unknown codec {}", bridge_cfg.name, bridge_cfg.codec))?;
		let adapter = adapter_entry
			.adapter
			.with_context(|| format!("plugin {} is not an adapter", bridge_cfg.adapter))?;
		let codec = codec_entry
			.codec
			.with_context(|| format!("plugin {} is not a codec", bridge_cfg.codec))?;

		let pool = ConnectionPool::with_events(
			adapter.clone(),
			PoolConfig {
				min_size: bridge_cfg.pool_min_size,
				max_size: bridge_cfg.pool_max_size,
				..PoolConfig::default()
			},
			events.clone(),
		);
		pool.spawn_maintenance(ct.clone());

		let bridge = Bridge::new(bridge_cfg.name.clone(), codec, adapter, pool, firewall.clone(), events.clone());
		manager
			.create_bridge(bridge)
			.await
			.map_err(|e| anyhow::anyhow!("failed to start bridge {}: {e}", bridge_cfg.name))?;
	}
	match registry.start_order().await {
		Ok(order) => tracing::debug!(?order, "plugin start order resolved"),
		Err(e) => tracing::warn!(error = %e, "plugin dependency graph has a cycle"),
	}
	tracing::info!(
		codecs = registry.list_by_type(PluginType::Codec).await.len(),
		adapters = registry.list_by_type(PluginType::Adapter).await.len(),
		"plugin registry populated"
	);

	let mut admin_state = AdminState::new(manager.clone(), firewall.clone(), Arc::new(Mutex::new(prom_registry)));
	if let Some(jwt_config) = &local.security.jwt {
		let authenticator = agentgateway::authn::JwtAuthenticator::new(jwt_config)
			.await
			.context("failed to initialize JWT authenticator")?;
		admin_state = admin_state.with_authenticator(Arc::new(authenticator));
	}
	let admin_router = admin::router(admin_state);
	let listener = tokio::net::TcpListener::bind((local.admin.host.as_str(), local.admin.port)).await?;
	tracing::info!(host = %local.admin.host, port = local.admin.port, "admin surface listening");

	tokio::select! {
		result = axum::serve(listener, admin_router) => {
			result?;
		}
		_ = shutdown_signal() => {
			tracing::info!("shutdown signal received");
		}
	}

	ct.cancel();
	manager.shutdown_all().await;
	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
	};
	#[cfg(unix)]
	let terminate = async {
		tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install signal handler")
			.recv()
			.await;
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();
	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
