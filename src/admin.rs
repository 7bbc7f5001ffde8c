//! Thin admin/introspection HTTP surface (SPEC_FULL.md §6).
//!
//! The REST/GraphQL frontend itself is out of scope for the bridge core
//! (spec §1), but the core still needs *some* surface for health checks and
//! operability, the way the teacher's `admin.rs`/`mtrcs.rs::App` expose a
//! thin `axum::Router` over shared state. Every response follows the
//! `{success, data?, error?, meta{...}}` envelope spec §6 describes.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::authn::JwtAuthenticator;
use crate::firewall::Firewall;
use crate::manager::BridgeManager;

/// Permissive CORS for the admin surface; narrower than the teacher's
/// `ui::add_cors_layer` fixed origin allowlist since this crate has no
/// bundled frontend to pin origins to.
fn cors_layer() -> CorsLayer {
	CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
}

#[derive(Clone, Serialize)]
struct Meta {
	timestamp: chrono::DateTime<Utc>,
	request_id: String,
	api_version: &'static str,
	time_elapsed_ms: f64,
}

/// The uniform response envelope every admin route returns (spec §6).
#[derive(Serialize)]
struct Envelope<T: Serialize> {
	success: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	data: Option<T>,
	#[serde(skip_serializing_if = "Option::is_none")]
	error: Option<ErrorBody>,
	meta: Meta,
}

#[derive(Serialize)]
struct ErrorBody {
	code: String,
	message: String,
}

fn ok<T: Serialize>(data: T, started: Instant) -> Json<Envelope<T>> {
	Json(Envelope {
		success: true,
		data: Some(data),
		error: None,
		meta: Meta {
			timestamp: Utc::now(),
			request_id: uuid_like(),
			api_version: "v1",
			time_elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
		},
	})
}

fn err(code: &str, message: impl Into<String>, started: Instant) -> Response {
	let status = if code == "PLUGIN_NOT_FOUND" {
		StatusCode::NOT_FOUND
	} else {
		StatusCode::INTERNAL_SERVER_ERROR
	};
	let body = Envelope::<()> {
		success: false,
		data: None,
		error: Some(ErrorBody {
			code: code.to_string(),
			message: message.into(),
		}),
		meta: Meta {
			timestamp: Utc::now(),
			request_id: uuid_like(),
			api_version: "v1",
			time_elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
		},
	};
	(status, Json(body)).into_response()
}

/// Good-enough unique id for request correlation without pulling in a UUID
/// crate for one field; collisions are immaterial since it's log-correlation
/// only, never a lookup key.
fn uuid_like() -> String {
	format!("{:x}-{:x}", Utc::now().timestamp_micros(), rand::random::<u32>())
}

#[derive(Clone)]
pub struct AdminState {
	manager: Arc<BridgeManager>,
	firewall: Arc<Firewall>,
	registry: Arc<Mutex<Registry>>,
	version: &'static str,
	/// Set when `security.authnEnabled` is configured; gates every protected
	/// route behind a verified bearer token (spec §6's production
	/// fail-closed posture has no effect without something to actually
	/// enforce once `authn_enabled` is true).
	authenticator: Option<Arc<JwtAuthenticator>>,
}

impl AdminState {
	pub fn new(manager: Arc<BridgeManager>, firewall: Arc<Firewall>, registry: Arc<Mutex<Registry>>) -> Self {
		Self {
			manager,
			firewall,
			registry,
			version: env!("CARGO_PKG_VERSION"),
			authenticator: None,
		}
	}

	pub fn with_authenticator(mut self, authenticator: Arc<JwtAuthenticator>) -> Self {
		self.authenticator = Some(authenticator);
		self
	}
}

/// Rejects any protected-route request without a valid `Authorization:
/// Bearer` token once an authenticator is configured; a no-op when none is
/// (e.g. `development` posture).
async fn require_bearer_auth(State(state): State<AdminState>, request: Request, next: Next) -> Response {
	let Some(authenticator) = &state.authenticator else {
		return next.run(request).await;
	};
	let token = request
		.headers()
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));
	let Some(token) = token else {
		return err("BAD_REQUEST", "missing bearer token", Instant::now());
	};
	match authenticator.authenticate(token).await {
		Ok(_claims) => next.run(request).await,
		Err(e) => err("ACCESS_DENIED", e.to_string(), Instant::now()),
	}
}

pub fn router(state: AdminState) -> Router {
	let protected = Router::new()
		.route("/bridges", get(list_bridges_handler))
		.route("/bridges/{name}", get(get_bridge_handler))
		.route("/rules", get(list_rules_handler))
		.route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_auth));

	Router::new()
		.route("/health", get(health_handler))
		.route("/metrics", get(metrics_handler))
		.merge(protected)
		.layer(TraceLayer::new_for_http())
		.layer(cors_layer())
		.with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
	status: &'static str,
	version: &'static str,
	components: serde_json::Value,
	timestamp: chrono::DateTime<Utc>,
}

async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
	let started = Instant::now();
	let bridges = state.manager.list_bridges().await;
	let components = serde_json::json!({
		"bridges": bridges.len(),
		"healthy": bridges.iter().filter(|(_, _, h)| *h == crate::types::HealthStatus::Healthy).count(),
	});
	ok(
		HealthBody {
			status: "ok",
			version: state.version,
			components,
			timestamp: Utc::now(),
		},
		started,
	)
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
	let mut buf = String::new();
	let registry = state.registry.lock().await;
	match encode(&mut buf, &registry) {
		Ok(()) => ([(axum::http::header::CONTENT_TYPE, "application/openmetrics-text; version=1.0.0; charset=utf-8")], buf).into_response(),
		Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
	}
}

#[derive(Serialize)]
struct BridgeSummary {
	name: String,
	state: crate::types::BridgeState,
	health: crate::types::HealthStatus,
}

async fn list_bridges_handler(State(state): State<AdminState>) -> impl IntoResponse {
	let started = Instant::now();
	let bridges = state
		.manager
		.list_bridges()
		.await
		.into_iter()
		.map(|(name, state, health)| BridgeSummary { name, state, health })
		.collect::<Vec<_>>();
	ok(bridges, started).into_response()
}

async fn get_bridge_handler(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
	let started = Instant::now();
	let bridge = match state.manager.get_bridge(&name).await {
		Ok(bridge) => bridge,
		Err(e) => return err(e.code(), e.to_string(), started),
	};
	let health = match state.manager.health_status(&name).await {
		Ok(health) => health,
		Err(e) => return err(e.code(), e.to_string(), started),
	};
	ok(
		BridgeSummary {
			name,
			state: bridge.state().await,
			health,
		},
		started,
	)
	.into_response()
}

async fn list_rules_handler(State(state): State<AdminState>) -> impl IntoResponse {
	let started = Instant::now();
	ok(state.firewall.rules().await, started)
}
