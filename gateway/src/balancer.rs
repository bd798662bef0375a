//! Load Balancer (C2). Grounded in the teacher's weighted-choice backend selection
//! (`proxy::httpproxy::select_backend` uses `choose_weighted`) and, for the smooth-weighted and
//! least-conn variants, the worked weighted round-robin / atomic counter state machine in
//! `traffic_management::manager::TrafficManager` (current-weight accumulator, per-backend
//! in-flight counters) from the example pack.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::seq::SliceRandom;

use crate::types::{Backend, LbPolicy, StickyConfig};

/// A single pass over the currently-healthy backends, sufficient for one `next()` call's
/// decision. Cloning `Backend` is cheap (it's `Arc`-shared from the caller's perspective through
/// `Vec<Arc<Backend>>`).
type Backends = Vec<Arc<Backend>>;

#[derive(Debug)]
struct RoundRobinState {
	counter: AtomicUsize,
}

#[derive(Debug)]
struct LeastConnState {
	in_flight: HashMap<String, AtomicU32>,
}

#[derive(Debug)]
struct WeightedState {
	current_weights: RwLock<HashMap<String, AtomicI64>>,
	sticky: Option<StickyConfig>,
	sticky_pins: RwLock<HashMap<String, String>>,
}

#[derive(Debug)]
enum Variant {
	RoundRobin(RoundRobinState),
	LeastConn(LeastConnState),
	Weighted(WeightedState),
	Versioned(RwLock<HashMap<String, Balancer>>),
}

/// Request-shaped facts a balancer may need to make a decision (sticky key, version token). The
/// Route Proxy extracts these once per request and passes them down; the balancer itself never
/// touches `http::Request` directly so it stays independently testable.
#[derive(Debug, Default, Clone)]
pub struct SelectionContext {
	pub sticky_key: Option<String>,
	pub version: Option<String>,
}

#[derive(Debug)]
pub struct Balancer {
	backends: RwLock<Backends>,
	variant: Variant,
}

impl Balancer {
	pub fn new(policy: LbPolicy, backends: Vec<Arc<Backend>>) -> Balancer {
		let variant = match policy {
			LbPolicy::RoundRobin => Variant::RoundRobin(RoundRobinState {
				counter: AtomicUsize::new(0),
			}),
			LbPolicy::LeastConn => Variant::LeastConn(LeastConnState {
				in_flight: backends
					.iter()
					.map(|b| (b.url.clone(), AtomicU32::new(0)))
					.collect(),
			}),
			LbPolicy::Weighted { sticky } => Variant::Weighted(WeightedState {
				current_weights: RwLock::new(
					backends
						.iter()
						.map(|b| (b.url.clone(), AtomicI64::new(0)))
						.collect(),
				),
				sticky: sticky.then(StickyConfig::default),
				sticky_pins: RwLock::new(HashMap::new()),
			}),
			LbPolicy::Versioned => Variant::Versioned(RwLock::new(HashMap::new())),
		};
		Balancer {
			backends: RwLock::new(backends),
			variant,
		}
	}

	pub fn next(&self, ctx: &SelectionContext) -> Option<Arc<Backend>> {
		match &self.variant {
			Variant::RoundRobin(s) => self.next_round_robin(s),
			Variant::LeastConn(s) => self.next_least_conn(s),
			Variant::Weighted(s) => self.next_weighted(s, ctx),
			Variant::Versioned(subs) => {
				let key = ctx.version.as_deref().unwrap_or("default");
				let subs = subs.read();
				subs.get(key)
					.or_else(|| subs.get("default"))
					.and_then(|b| b.next(ctx))
			},
		}
	}

	/// Called by the Route Proxy when a selected backend's call completes, so LeastConn can
	/// decrement its in-flight counter. A no-op for other variants.
	pub fn release(&self, backend: &Backend) {
		if let Variant::LeastConn(s) = &self.variant {
			if let Some(c) = s.in_flight.get(&backend.url) {
				c.fetch_sub(1, Ordering::Relaxed);
			}
		}
	}

	fn next_round_robin(&self, s: &RoundRobinState) -> Option<Arc<Backend>> {
		let healthy = self.healthy_snapshot();
		if healthy.is_empty() {
			return None;
		}
		let i = s.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
		Some(healthy[i].clone())
	}

	fn next_least_conn(&self, s: &LeastConnState) -> Option<Arc<Backend>> {
		let healthy = self.healthy_snapshot();
		let chosen = healthy.iter().min_by_key(|b| {
			s.in_flight
				.get(&b.url)
				.map(|c| c.load(Ordering::Relaxed))
				.unwrap_or(0)
		})?;
		if let Some(c) = s.in_flight.get(&chosen.url) {
			c.fetch_add(1, Ordering::Relaxed);
		}
		Some(chosen.clone())
	}

	/// Smooth weighted round-robin (Nginx's "current weight" algorithm): each backend's current
	/// weight grows by its static weight every pick; the pick with the highest current weight
	/// wins and has the total weight subtracted back off.
	fn next_weighted(&self, s: &WeightedState, ctx: &SelectionContext) -> Option<Arc<Backend>> {
		let healthy = self.healthy_snapshot();
		if healthy.is_empty() {
			return None;
		}

		if let Some(sticky) = &s.sticky {
			if let Some(key) = sticky_key(sticky, ctx) {
				let pins = s.sticky_pins.read();
				if let Some(url) = pins.get(&key) {
					if let Some(b) = healthy.iter().find(|b| &b.url == url) {
						return Some(b.clone());
					}
				}
				drop(pins);
				// Unhealthy or unpinned: fall through to weighted selection, then pin the result.
				let chosen = self.smooth_weighted_pick(s, &healthy);
				if let Some(b) = &chosen {
					s.sticky_pins.write().insert(key, b.url.clone());
				}
				return chosen;
			}
		}
		self.smooth_weighted_pick(s, &healthy)
	}

	fn smooth_weighted_pick(&self, s: &WeightedState, healthy: &Backends) -> Option<Arc<Backend>> {
		let total: i64 = healthy.iter().map(|b| b.weight as i64).sum();
		if total == 0 {
			return healthy.choose(&mut rand::thread_rng()).cloned();
		}
		let weights = s.current_weights.read();
		let mut best: Option<(&Arc<Backend>, i64)> = None;
		for b in healthy {
			let entry = weights.get(&b.url)?;
			let cur = entry.fetch_add(b.weight as i64, Ordering::Relaxed) + b.weight as i64;
			if best.map(|(_, w)| cur > w).unwrap_or(true) {
				best = Some((b, cur));
			}
		}
		let (chosen, _) = best?;
		if let Some(entry) = weights.get(&chosen.url) {
			entry.fetch_sub(total, Ordering::Relaxed);
		}
		Some(chosen.clone())
	}

	fn healthy_snapshot(&self) -> Backends {
		self
			.backends
			.read()
			.iter()
			.filter(|b| b.is_healthy())
			.cloned()
			.collect()
	}

	pub fn get_backends(&self) -> Backends {
		self.backends.read().clone()
	}

	/// Registry Watcher (C13) entry point: replaces the backend list. Readers of `next()` observe
	/// either the pre- or post-update list atomically (the write lock is held only long enough to
	/// swap the `Vec`), never a torn state.
	pub fn update_backends(&self, new_backends: Vec<Arc<Backend>>) {
		*self.backends.write() = new_backends;
	}

	pub fn mark_healthy(&self, url: &str, healthy: bool) {
		if let Some(b) = self.backends.read().iter().find(|b| b.url == url) {
			b.set_healthy(healthy);
		}
	}

	pub fn register_version(&self, version: String, sub: Balancer) {
		if let Variant::Versioned(subs) = &self.variant {
			subs.write().insert(version, sub);
		}
	}
}

fn sticky_key(cfg: &StickyConfig, ctx: &SelectionContext) -> Option<String> {
	if cfg.header.is_some() || cfg.cookie.is_some() || cfg.use_client_ip {
		ctx.sticky_key.clone()
	} else {
		None
	}
}

pub fn parse_socket_addr(url: &str) -> Option<SocketAddr> {
	let without_scheme = url.split("://").next_back().unwrap_or(url);
	let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
	host_port.parse().ok().or_else(|| {
		// Fall back to resolving a bare hostname:port against localhost; real resolution happens
		// in the Registry Watcher / DNS discovery path.
		None
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn backend(url: &str, weight: u32) -> Arc<Backend> {
		Arc::new(Backend::new(
			url.to_string(),
			"127.0.0.1:0".parse().unwrap(),
			weight,
		))
	}

	#[test]
	fn round_robin_cycles() {
		let b = Balancer::new(
			LbPolicy::RoundRobin,
			vec![backend("a", 1), backend("b", 1), backend("c", 1)],
		);
		let ctx = SelectionContext::default();
		let picks: Vec<_> = (0..6).map(|_| b.next(&ctx).unwrap().url.clone()).collect();
		assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
	}

	#[test]
	fn round_robin_skips_unhealthy() {
		let unhealthy = backend("b", 1);
		unhealthy.set_healthy(false);
		let b = Balancer::new(LbPolicy::RoundRobin, vec![backend("a", 1), unhealthy, backend("c", 1)]);
		let ctx = SelectionContext::default();
		for _ in 0..4 {
			assert_ne!(b.next(&ctx).unwrap().url, "b");
		}
	}

	#[test]
	fn no_healthy_backends_returns_none() {
		let dead = backend("a", 1);
		dead.set_healthy(false);
		let b = Balancer::new(LbPolicy::RoundRobin, vec![dead]);
		assert!(b.next(&SelectionContext::default()).is_none());
	}

	#[test]
	fn least_conn_prefers_idle_backend() {
		let b = Balancer::new(LbPolicy::LeastConn, vec![backend("a", 1), backend("b", 1)]);
		let ctx = SelectionContext::default();
		let first = b.next(&ctx).unwrap();
		// first is now in-flight=1; next pick should be the other one.
		let second = b.next(&ctx).unwrap();
		assert_ne!(first.url, second.url);
		b.release(&first);
		let third = b.next(&ctx).unwrap();
		assert_eq!(third.url, first.url);
	}

	#[test]
	fn weighted_distributes_by_weight() {
		let b = Balancer::new(
			LbPolicy::Weighted { sticky: false },
			vec![backend("heavy", 3), backend("light", 1)],
		);
		let ctx = SelectionContext::default();
		let mut heavy_count = 0;
		for _ in 0..8 {
			if b.next(&ctx).unwrap().url == "heavy" {
				heavy_count += 1;
			}
		}
		assert_eq!(heavy_count, 6);
	}

	#[test]
	fn sticky_pins_to_same_backend() {
		let b = Balancer::new(
			LbPolicy::Weighted { sticky: true },
			vec![backend("a", 1), backend("b", 1)],
		);
		let ctx = SelectionContext {
			sticky_key: Some("user-42".to_string()),
			version: None,
		};
		let first = b.next(&ctx).unwrap().url.clone();
		for _ in 0..5 {
			assert_eq!(b.next(&ctx).unwrap().url, first);
		}
	}

	#[test]
	fn sticky_falls_through_when_pinned_backend_unhealthy() {
		let b = Balancer::new(
			LbPolicy::Weighted { sticky: true },
			vec![backend("a", 1), backend("b", 1)],
		);
		let ctx = SelectionContext {
			sticky_key: Some("user-42".to_string()),
			version: None,
		};
		let first = b.next(&ctx).unwrap();
		first.set_healthy(false);
		let second = b.next(&ctx).unwrap();
		assert_ne!(second.url, first.url);
	}

	#[test]
	fn versioned_dispatches_to_sub_balancer() {
		let top = Balancer::new(LbPolicy::Versioned, vec![]);
		top.register_version(
			"v1".to_string(),
			Balancer::new(LbPolicy::RoundRobin, vec![backend("v1-a", 1)]),
		);
		top.register_version(
			"default".to_string(),
			Balancer::new(LbPolicy::RoundRobin, vec![backend("default-a", 1)]),
		);
		let ctx = SelectionContext {
			sticky_key: None,
			version: Some("v1".to_string()),
		};
		assert_eq!(top.next(&ctx).unwrap().url, "v1-a");
		let ctx_unknown = SelectionContext {
			sticky_key: None,
			version: Some("v99".to_string()),
		};
		assert_eq!(top.next(&ctx_unknown).unwrap().url, "default-a");
	}

	#[test]
	fn update_backends_is_observed_by_next_call() {
		let b = Balancer::new(LbPolicy::RoundRobin, vec![backend("a", 1)]);
		assert_eq!(b.next(&SelectionContext::default()).unwrap().url, "a");
		b.update_backends(vec![backend("z", 1)]);
		assert_eq!(b.next(&SelectionContext::default()).unwrap().url, "z");
	}
}
