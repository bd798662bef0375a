//! State Snapshot (C11): the immutable bundle every request handler closes over. Grounded in the
//! teacher's `proxy::Gateway` / `ProxyInputs` — the long-lived struct every request handler already
//! closed over in the teacher, generalized here to the route-keyed form spec §4.11 asks for and
//! wrapped in `arc_swap::ArcSwap` for atomic install (§4.11, §4.12).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::balancer::Balancer;
use crate::breaker::CircuitBreaker;
use crate::cache::RouteCache;
use crate::client::SharedTransportPool;
use crate::coalesce::Coalescer;
use crate::features::FeatureRegistry;
use crate::proxy::{RetryBudget, RouteProxy};
use crate::registry::WatchHandle;
use crate::router::Router;
use crate::types::{RouteConfig, RouteId};

/// Everything the Pipeline Composer needs to serve one route, built once per reload generation.
pub struct RouteEntry {
	pub config: RouteConfig,
	pub balancer: Arc<Balancer>,
	pub proxy: Arc<RouteProxy>,
	pub breaker: Option<Arc<CircuitBreaker>>,
	pub cache: Option<RouteCache>,
	/// Held only to keep the registry watch task (if any) alive for this route's lifetime;
	/// dropping the snapshot drops this, which aborts the task (§4.12 step 5, §4.13).
	pub watch: Option<WatchHandle>,
}

/// The full immutable bundle. Every field here is read-only after construction except whatever a
/// `Balancer` mutates internally via its own lock (§4.11: "the one permitted write path").
pub struct StateSnapshot {
	pub router: Router,
	pub routes: HashMap<RouteId, RouteEntry>,
	pub features: FeatureRegistry,
	pub coalescer: Arc<Coalescer>,
	pub transport: SharedTransportPool,
	pub global_ip_allowlist: Vec<String>,
	pub global_ip_denylist: Vec<String>,
	pub retry_budgets: HashMap<String, Arc<RetryBudget>>,
	/// Bind addresses from the config's `listeners` block (C12 reload does not currently rebind
	/// live sockets; new addresses added by a reload take effect on the next process restart).
	pub listeners: Vec<SocketAddr>,
}

impl StateSnapshot {
	pub fn route(&self, route_id: &str) -> Option<&RouteEntry> {
		self.routes.get(route_id)
	}
}
