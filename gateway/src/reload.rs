//! Reloader (C12): the seven-step protocol from spec §4.12 — parse off-lock, build off-lock,
//! rebuild the transport pool, install under a short lock, drain the old snapshot, reconcile the
//! health checker, emit a reload event. Grounded in the teacher's `Config`/XDS apply path, which
//! the spec's §9 re-architecture note explicitly replaces with a full off-lock rebuild instead of
//! the teacher's incremental `StoreUpdater` mutation.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::balancer::Balancer;
use crate::breaker::CircuitBreaker;
use crate::cache::RouteCache;
use crate::client::{SharedTransportPool, TransportPool};
use crate::coalesce::Coalescer;
use crate::config::ConfigSource;
use crate::error::ProxyError;
use crate::features::FeatureRegistry;
use crate::features::auth::AuthFeature;
use crate::features::cors::CorsFeature;
use crate::features::ratelimit::RateLimitFeature;
use crate::features::transform::TransformFeature;
use crate::features::validation::ValidationFeature;
use crate::healthcheck::{HealthChecker, Subscription};
use crate::proxy::{RetryBudget, RouteProxy};
use crate::registry::{ServiceRegistry, spawn_watch};
use crate::router::Router;
use crate::snapshot::{RouteEntry, StateSnapshot};
use crate::types::{Backend, GatewayConfig, TransportConfig, UpstreamConfig};

/// External shape of one reload outcome, surfaced verbatim by the admin API's `/reload` response
/// and reload history. `changes` holds lexically sorted entries of the form `"route added: id"`,
/// `"route removed: id"`, `"route reloaded: id"` (route kept its id but its config differs from the
/// previous generation), and `"listeners changed: N -> M"`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReloadResult {
	pub success: bool,
	pub timestamp_unix: u64,
	pub error: Option<String>,
	pub changes: Vec<String>,
}

/// Bounded ring of the last 50 reload outcomes, surfaced on the admin API (§4.12 step 7, §6).
pub struct ReloadHistory {
	entries: Mutex<std::collections::VecDeque<ReloadResult>>,
}

impl ReloadHistory {
	pub fn new() -> ReloadHistory {
		ReloadHistory {
			entries: Mutex::new(std::collections::VecDeque::with_capacity(50)),
		}
	}

	pub fn push(&self, result: ReloadResult) {
		let mut entries = self.entries.lock();
		if entries.len() >= 50 {
			entries.pop_front();
		}
		entries.push_back(result);
	}

	pub fn snapshot(&self) -> Vec<ReloadResult> {
		self.entries.lock().iter().cloned().collect()
	}
}

impl Default for ReloadHistory {
	fn default() -> Self {
		Self::new()
	}
}

/// Owns the live `StateSnapshot` pointer and everything needed to build the next one.
pub struct Reloader {
	current: ArcSwap<StateSnapshot>,
	health_checker: Arc<HealthChecker>,
	registry: Arc<dyn ServiceRegistry>,
	history: ReloadHistory,
}

impl Reloader {
	pub fn new(initial: StateSnapshot, registry: Arc<dyn ServiceRegistry>) -> Reloader {
		Reloader {
			current: ArcSwap::from_pointee(initial),
			health_checker: Arc::new(HealthChecker::new()),
			registry,
			history: ReloadHistory::new(),
		}
	}

	/// Builds the very first snapshot from a config source and wraps it in a fresh `Reloader`. Used
	/// once at process startup; every later reload goes through `reload()` instead.
	pub async fn bootstrap(source: &ConfigSource, registry: Arc<dyn ServiceRegistry>) -> Result<Reloader, ProxyError> {
		let config = crate::config::parse_config(source).map_err(|e| ProxyError::ConfigError(e.to_string()))?;
		let snapshot = build_snapshot(&config, registry.clone()).await?;
		let reloader = Reloader::new(snapshot, registry);
		let live_urls = reloader.current.load().routes.values().flat_map(live_backend_urls).collect();
		reloader.health_checker.reconcile(&live_urls).await;
		for sub in health_subscriptions(&config, &reloader.current.load()) {
			reloader.health_checker.spawn(sub).await;
		}
		Ok(reloader)
	}

	pub fn current(&self) -> Arc<StateSnapshot> {
		self.current.load_full()
	}

	pub fn history(&self) -> Vec<ReloadResult> {
		self.history.snapshot()
	}

	/// Runs the full reload protocol. On any build failure the old snapshot keeps serving and the
	/// error is recorded in history (spec §4.12: "no partial installation").
	pub async fn reload(&self, source: &ConfigSource) -> Result<(), ProxyError> {
		let config = crate::config::parse_config(source).map_err(|e| ProxyError::ConfigError(e.to_string()))?;

		let old = self.current.load_full();
		let old_listener_count = old.listeners.len();

		let built = build_snapshot(&config, self.registry.clone()).await;
		let snapshot = match built {
			Ok(s) => s,
			Err(e) => {
				error!(err = %e, "reload build failed, keeping previous snapshot");
				self.history.push(ReloadResult {
					success: false,
					timestamp_unix: unix_now(),
					error: Some(e.to_string()),
					changes: vec![],
				});
				return Err(e);
			},
		};

		let changes = diff_routes(&old, &snapshot, old_listener_count);

		// Step 4: install under a short exclusive section (ArcSwap::store is the pointer swap).
		self.current.store(Arc::new(snapshot));

		// Step 5: drain the old snapshot. Dropping `old` here cancels its watch handles (Drop on
		// `WatchHandle`) once every in-flight request holding a clone of it finishes; we do not
		// wait for that here, matching "do not touch handlers, in-flight completion is the GC
		// signal".
		drop(old);

		// Step 6: reconcile health checker against the new config's live backend URLs.
		let live_urls = self.current.load().routes.values().flat_map(live_backend_urls).collect();
		self.health_checker.reconcile(&live_urls).await;
		for sub in health_subscriptions(&config, &self.current.load()) {
			self.health_checker.spawn(sub).await;
		}

		info!(changes = changes.len(), "reload complete");
		self.history.push(ReloadResult {
			success: true,
			timestamp_unix: unix_now(),
			error: None,
			changes,
		});
		Ok(())
	}
}

/// Computes the lexically sorted `changes[]` entries for one reload: routes added/removed/reloaded
/// (config differs under the same id, compared structurally via JSON since `RouteConfig` itself
/// does not derive `PartialEq`) and a listener-count change.
fn diff_routes(old: &StateSnapshot, new: &StateSnapshot, old_listener_count: usize) -> Vec<String> {
	let old_ids: HashSet<&String> = old.routes.keys().collect();
	let new_ids: HashSet<&String> = new.routes.keys().collect();

	let mut changes: Vec<String> = Vec::new();
	for id in new_ids.difference(&old_ids) {
		changes.push(format!("route added: {id}"));
	}
	for id in old_ids.difference(&new_ids) {
		changes.push(format!("route removed: {id}"));
	}
	for id in old_ids.intersection(&new_ids) {
		let before = serde_json::to_value(&old.routes[*id].config).ok();
		let after = serde_json::to_value(&new.routes[*id].config).ok();
		if before != after {
			changes.push(format!("route reloaded: {id}"));
		}
	}

	let new_listener_count = new.listeners.len();
	if old_listener_count != new_listener_count {
		changes.push(format!("listeners changed: {old_listener_count} -> {new_listener_count}"));
	}

	changes.sort();
	changes
}

fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn live_backend_urls(entry: &RouteEntry) -> Vec<String> {
	entry.balancer.get_backends().iter().map(|b| b.url.clone()).collect()
}

fn health_subscriptions(config: &GatewayConfig, snapshot: &StateSnapshot) -> Vec<Subscription> {
	let mut subs = Vec::new();
	for upstream in &config.upstreams {
		let Some(hc) = &upstream.health_check else { continue };
		let Some(entry) = snapshot.routes.values().find(|e| e.config.upstream.as_deref() == Some(upstream.name.as_str())) else {
			continue;
		};
		for backend in entry.balancer.get_backends() {
			subs.push(Subscription {
				url: backend.url.clone(),
				addr: backend.addr,
				config: hc.clone(),
				balancer: entry.balancer.clone(),
			});
		}
	}
	subs
}

/// Step 2-3 of §4.12: allocate every per-route manager and rebuild the transport pool, all off any
/// gateway-held lock (this function only touches data local to the call).
async fn build_snapshot(config: &GatewayConfig, registry: Arc<dyn ServiceRegistry>) -> Result<StateSnapshot, ProxyError> {
	let upstream_by_name: HashMap<String, &UpstreamConfig> =
		config.upstreams.iter().map(|u| (u.name.clone(), u)).collect();

	let mut features = FeatureRegistry::new();
	features.register(Arc::new(AuthFeature::new()));
	features.register(Arc::new(CorsFeature::new()));
	features.register(Arc::new(RateLimitFeature::new()));
	features.register(Arc::new(TransformFeature::new()));
	features.register(Arc::new(ValidationFeature::new()));
	features.setup_all(&config.routes)?;

	let transport_configs: HashMap<String, TransportConfig> = config
		.upstreams
		.iter()
		.map(|u| (u.name.clone(), u.transport.clone()))
		.collect();
	let transport = SharedTransportPool::new(TransportPool::build(&transport_configs));

	let mut retry_budgets: HashMap<String, Arc<RetryBudget>> = HashMap::new();
	let mut routes = HashMap::new();

	for route in &config.routes {
		let backend_configs = if let Some(name) = &route.upstream {
			upstream_by_name
				.get(name)
				.map(|u| u.backends.clone())
				.ok_or_else(|| ProxyError::ConfigError(format!("route {} references unknown upstream {name}", route.id)))?
		} else {
			route.backends.clone()
		};

		let backends: Vec<Arc<Backend>> = backend_configs
			.iter()
			.filter_map(|b| {
				let addr = crate::balancer::parse_socket_addr(&b.url).or_else(|| default_addr(&b.url))?;
				Some(Arc::new(Backend::new(b.url.clone(), addr, b.weight)))
			})
			.collect();

		let balancer = Arc::new(Balancer::new(route.lb_policy, backends));
		if matches!(route.lb_policy, crate::types::LbPolicy::Versioned) {
			for (version, backend_configs) in &route.versions {
				let sub_backends: Vec<Arc<Backend>> = backend_configs
					.iter()
					.filter_map(|b| {
						let addr = crate::balancer::parse_socket_addr(&b.url).or_else(|| default_addr(&b.url))?;
						Some(Arc::new(Backend::new(b.url.clone(), addr, b.weight)))
					})
					.collect();
				balancer.register_version(version.clone(), Balancer::new(crate::types::LbPolicy::RoundRobin, sub_backends));
			}
		}

		let upstream_name = route.upstream.clone();
		let budget = upstream_name
			.as_ref()
			.map(|name| {
				retry_budgets
					.entry(name.clone())
					.or_insert_with(|| Arc::new(RetryBudget::new(1, 0.2, Duration::from_secs(10))))
					.clone()
			})
			.unwrap_or_else(|| Arc::new(RetryBudget::new(1, 0.2, Duration::from_secs(10))));

		let breaker = route.breaker.enabled.then(|| Arc::new(CircuitBreaker::new(route.breaker.clone())));

		let proxy = Arc::new(RouteProxy::new(
			balancer.clone(),
			upstream_name.clone(),
			route.retry.clone(),
			route.timeout.clone(),
			transport.clone(),
			budget,
			breaker.clone(),
		));

		let cache = route.cache.enabled.then(|| RouteCache::new(&route.cache));

		let watch = upstream_name
			.as_ref()
			.and_then(|name| upstream_by_name.get(name))
			.and_then(|u| u.discovery.as_ref())
			.map(|d| {
				spawn_watch(
					registry.clone(),
					d.dns_name.clone(),
					d.port,
					d.refresh_interval,
					HashSet::new(),
					balancer.clone(),
				)
			});

		routes.insert(
			route.id.clone(),
			RouteEntry {
				config: route.clone(),
				balancer,
				proxy,
				breaker,
				cache,
				watch,
			},
		);
	}

	let router = Router::build(&config.routes);

	Ok(StateSnapshot {
		router,
		routes,
		features,
		coalescer: Arc::new(Coalescer::new()),
		transport,
		global_ip_allowlist: config.global.ip_allowlist.clone(),
		global_ip_denylist: config.global.ip_denylist.clone(),
		retry_budgets,
		listeners: config.listeners.iter().map(|l| l.address).collect(),
	})
}

fn default_addr(url: &str) -> Option<SocketAddr> {
	let without_scheme = url.split("://").next_back().unwrap_or(url);
	let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
	let (host, port) = host_port.rsplit_once(':')?;
	let port: u16 = port.parse().ok()?;
	let ip = std::net::ToSocketAddrs::to_socket_addrs(&(host, port)).ok()?.next()?;
	Some(ip)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::StaticRegistry;

	fn sample_config() -> GatewayConfig {
		let yaml = r#"
routes:
  - id: r1
    path: { kind: prefix, value: / }
    backends:
      - url: "http://127.0.0.1:9000"
"#;
		serde_yaml::from_str(yaml).unwrap()
	}

	#[tokio::test]
	async fn build_snapshot_produces_one_route_entry() {
		let snapshot = build_snapshot(&sample_config(), Arc::new(StaticRegistry::new(vec![])))
			.await
			.unwrap();
		assert!(snapshot.routes.contains_key("r1"));
	}

	#[tokio::test]
	async fn reload_with_bad_upstream_ref_fails_without_touching_current() {
		let good = build_snapshot(&sample_config(), Arc::new(StaticRegistry::new(vec![]))).await.unwrap();
		let reloader = Reloader::new(good, Arc::new(StaticRegistry::new(vec![])));

		let bad_yaml = r#"
routes:
  - id: r2
    path: { kind: prefix, value: / }
    upstream: does-not-exist
"#;
		let err = reloader.reload(&ConfigSource::Inline(bad_yaml.to_string())).await;
		assert!(err.is_err());
		assert!(reloader.current().routes.contains_key("r1"));
		assert!(!reloader.history().is_empty());
	}

	#[tokio::test]
	async fn successful_reload_replaces_routes_and_records_diff() {
		let good = build_snapshot(&sample_config(), Arc::new(StaticRegistry::new(vec![]))).await.unwrap();
		let reloader = Reloader::new(good, Arc::new(StaticRegistry::new(vec![])));

		let next_yaml = r#"
routes:
  - id: r2
    path: { kind: prefix, value: / }
    backends:
      - url: "http://127.0.0.1:9001"
"#;
		reloader.reload(&ConfigSource::Inline(next_yaml.to_string())).await.unwrap();
		assert!(reloader.current().routes.contains_key("r2"));
		assert!(!reloader.current().routes.contains_key("r1"));
		let last = reloader.history().pop().unwrap();
		assert!(last.success);
		assert_eq!(last.changes, vec!["route added: r2", "route removed: r1"]);
	}

	#[tokio::test]
	async fn reload_with_unchanged_route_config_reports_no_changes() {
		let good = build_snapshot(&sample_config(), Arc::new(StaticRegistry::new(vec![]))).await.unwrap();
		let reloader = Reloader::new(good, Arc::new(StaticRegistry::new(vec![])));

		let same_yaml = r#"
routes:
  - id: r1
    path: { kind: prefix, value: / }
    backends:
      - url: "http://127.0.0.1:9000"
"#;
		reloader.reload(&ConfigSource::Inline(same_yaml.to_string())).await.unwrap();
		let last = reloader.history().pop().unwrap();
		assert!(last.changes.is_empty(), "reloading identical config must not report a route as reloaded");
	}

	#[tokio::test]
	async fn reload_with_modified_route_config_reports_route_reloaded() {
		let good = build_snapshot(&sample_config(), Arc::new(StaticRegistry::new(vec![]))).await.unwrap();
		let reloader = Reloader::new(good, Arc::new(StaticRegistry::new(vec![])));

		let modified_yaml = r#"
routes:
  - id: r1
    path: { kind: prefix, value: / }
    backends:
      - url: "http://127.0.0.1:9000"
        weight: 5
"#;
		reloader.reload(&ConfigSource::Inline(modified_yaml.to_string())).await.unwrap();
		let last = reloader.history().pop().unwrap();
		assert_eq!(last.changes, vec!["route reloaded: r1"]);
	}

	#[tokio::test]
	async fn versioned_route_registers_sub_balancers_from_config() {
		let yaml = r#"
routes:
  - id: r1
    path: { kind: prefix, value: / }
    lbPolicy: { kind: versioned }
    versions:
      v1:
        - url: "http://127.0.0.1:9001"
      default:
        - url: "http://127.0.0.1:9000"
"#;
		let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
		let snapshot = build_snapshot(&config, Arc::new(StaticRegistry::new(vec![]))).await.unwrap();
		let entry = snapshot.routes.get("r1").unwrap();

		let ctx = crate::balancer::SelectionContext {
			sticky_key: None,
			version: Some("v1".to_string()),
		};
		assert_eq!(entry.balancer.next(&ctx).unwrap().url, "http://127.0.0.1:9001");

		let ctx_default = crate::balancer::SelectionContext {
			sticky_key: None,
			version: None,
		};
		assert_eq!(entry.balancer.next(&ctx_default).unwrap().url, "http://127.0.0.1:9000");
	}
}
