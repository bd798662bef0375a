//! Read-mostly admin API (spec §6), served on its own listener the way the teacher runs a
//! dedicated admin `axum::Router` alongside the data-plane listener rather than mixing the two.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::json;

use crate::config::ConfigSource;
use crate::reload::Reloader;

pub struct AdminState {
	pub reloader: Arc<Reloader>,
	pub config_source: ConfigSource,
	pub ready: gwcore::readiness::Ready,
	pub registry: parking_lot::Mutex<prometheus_client::registry::Registry>,
	drain_guard: parking_lot::Mutex<Option<gwcore::readiness::BlockReady>>,
}

impl AdminState {
	pub fn new(
		reloader: Arc<Reloader>,
		config_source: ConfigSource,
		ready: gwcore::readiness::Ready,
		registry: prometheus_client::registry::Registry,
	) -> AdminState {
		AdminState {
			reloader,
			config_source,
			ready,
			registry: parking_lot::Mutex::new(registry),
			drain_guard: parking_lot::Mutex::new(None),
		}
	}
}

pub fn router(state: Arc<AdminState>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/ready", get(ready))
		.route("/stats", get(stats))
		.route("/routes", get(routes))
		.route("/backends", get(backends))
		.route("/listeners", get(listeners))
		.route("/dashboard", get(dashboard))
		.route("/metrics", get(metrics))
		.route("/reload", post(reload))
		.route("/drain", post(drain))
		.route("/{feature}", get(feature_stats))
		.route("/canary/{route}/{action}", post(canary))
		.route("/maintenance/{route}/{action}", post(maintenance))
		.with_state(state)
}

async fn health() -> impl IntoResponse {
	Json(json!({ "status": "ok" }))
}

/// Not-ready while any registered startup task is still pending (spec: "configurable checks: min
/// healthy routes, external-store reachability, drain flag"; this repository only wires the
/// startup-task gate, since no external store is in scope).
async fn ready(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
	let pending = state.ready.pending();
	if pending.is_empty() {
		(StatusCode::OK, Json(json!({ "ready": true })))
	} else {
		(
			StatusCode::SERVICE_UNAVAILABLE,
			Json(json!({ "ready": false, "pending": pending })),
		)
	}
}

async fn stats(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
	let snapshot = state.reloader.current();
	Json(json!({
		"routes": snapshot.routes.len(),
		"history": state.reloader.history(),
	}))
}

async fn routes(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
	let snapshot = state.reloader.current();
	let ids: Vec<&String> = snapshot.routes.keys().collect();
	Json(json!({ "routes": ids }))
}

async fn backends(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
	let snapshot = state.reloader.current();
	let mut out = serde_json::Map::new();
	for (id, entry) in &snapshot.routes {
		let urls: Vec<String> = entry
			.balancer
			.get_backends()
			.iter()
			.map(|b| format!("{} (healthy={})", b.url, b.is_healthy()))
			.collect();
		out.insert(id.clone(), json!(urls));
	}
	Json(serde_json::Value::Object(out))
}

async fn listeners() -> impl IntoResponse {
	Json(json!({ "listeners": [] }))
}

async fn dashboard(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
	let snapshot = state.reloader.current();
	Json(json!({
		"routes": snapshot.routes.len(),
		"features": snapshot.features.admin_stats(),
		"history": state.reloader.history(),
	}))
}

async fn metrics(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
	let mut buf = String::new();
	let registry = state.registry.lock();
	match prometheus_client::encoding::text::encode(&mut buf, &registry) {
		Ok(()) => (StatusCode::OK, buf),
		Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
	}
}

async fn feature_stats(State(state): State<Arc<AdminState>>, Path(feature): Path<String>) -> impl IntoResponse {
	let snapshot = state.reloader.current();
	let stats = snapshot.features.admin_stats();
	match stats.get(feature.as_str()) {
		Some(v) => (StatusCode::OK, Json(v.clone())),
		None => (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown feature" }))),
	}
}

async fn reload(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
	match state.reloader.reload(&state.config_source).await {
		Ok(()) => {
			let last = state.reloader.history().pop();
			(StatusCode::OK, Json(json!({ "success": true, "result": last })))
		},
		Err(e) => (
			StatusCode::INTERNAL_SERVER_ERROR,
			Json(json!({ "success": false, "error": e.to_string() })),
		),
	}
}

async fn drain(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
	// Marking not-ready is sufficient per spec ("continue serving existing requests"): the readiness
	// gate is what an external load balancer polls to stop sending new traffic. The guard is held in
	// `AdminState` for the rest of the process lifetime rather than dropped at the end of this
	// handler, which would immediately flip readiness back.
	let mut guard = state.drain_guard.lock();
	if guard.is_none() {
		*guard = Some(state.ready.register_task("drain"));
	}
	Json(json!({ "draining": true }))
}

/// Canary/blue-green control is an out-of-scope external collaborator per the pipeline's own
/// traffic-split step (no canary controller is implemented here, only the `TrafficSplitConfig`
/// data model); this handler acknowledges the route exists but cannot mutate a canary state machine
/// that doesn't exist.
async fn canary(State(state): State<Arc<AdminState>>, Path((route, action)): Path<(String, String)>) -> impl IntoResponse {
	let snapshot = state.reloader.current();
	if !snapshot.routes.contains_key(&route) {
		return (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown route" })));
	}
	(
		StatusCode::NOT_IMPLEMENTED,
		Json(json!({ "route": route, "action": action, "error": "canary controller not implemented" })),
	)
}

async fn maintenance(State(state): State<Arc<AdminState>>, Path((route, action)): Path<(String, String)>) -> impl IntoResponse {
	let snapshot = state.reloader.current();
	if !snapshot.routes.contains_key(&route) {
		return (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown route" })));
	}
	(
		StatusCode::NOT_IMPLEMENTED,
		Json(json!({ "route": route, "action": action, "error": "maintenance short-circuit not implemented" })),
	)
}
