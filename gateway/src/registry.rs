//! Registry Watcher (C13): `ServiceRegistry` is the out-of-scope collaborator the spec fixes only
//! an interface for; `StaticRegistry` and `PollingRegistry` are the two reference implementations
//! shipped here. `PollingRegistry` is grounded in the teacher's `client::dns::CachedResolver`
//! (periodic re-resolve of a DNS name via `hickory_resolver`, backed by a background task); ours
//! drives a `Balancer::update_backends` call instead of a resolver cache entry.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use tracing::warn;

use crate::balancer::Balancer;
use crate::types::Backend;

/// A snapshot of resolved backends at one point in time, tagged with the tags the caller asked to
/// filter by (used so a watcher can drop endpoints that no longer carry a required tag).
#[derive(Debug, Clone)]
pub struct ResolvedBackend {
	pub addr: SocketAddr,
	pub weight: u32,
	pub tags: Vec<String>,
}

/// Out-of-scope collaborator per spec §4.13: the gateway only needs a way to get a current backend
/// list and a way to be told about changes to it. `watch` is expected to call `on_update` for every
/// change until the returned guard is dropped.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
	async fn resolve(&self, name: &str) -> anyhow::Result<Vec<ResolvedBackend>>;
}

/// Backs a route whose backend list never changes after reload — the registry's `resolve` simply
/// returns the config's own static list once. No watch task is spawned for it.
pub struct StaticRegistry {
	backends: Vec<ResolvedBackend>,
}

impl StaticRegistry {
	pub fn new(backends: Vec<ResolvedBackend>) -> StaticRegistry {
		StaticRegistry { backends }
	}
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
	async fn resolve(&self, _name: &str) -> anyhow::Result<Vec<ResolvedBackend>> {
		Ok(self.backends.clone())
	}
}

/// Periodically re-resolves a DNS name and reports the resulting address set, required tags
/// filtered out before they ever reach the balancer.
pub struct PollingRegistry {
	resolver: TokioResolver,
}

impl PollingRegistry {
	pub fn new() -> anyhow::Result<PollingRegistry> {
		let resolver =
			TokioResolver::builder_with_config(ResolverConfig::default(), TokioConnectionProvider::default())
				.with_options(ResolverOpts::default())
				.build();
		Ok(PollingRegistry { resolver })
	}
}

#[async_trait]
impl ServiceRegistry for PollingRegistry {
	async fn resolve(&self, name: &str) -> anyhow::Result<Vec<ResolvedBackend>> {
		let response = self.resolver.lookup_ip(name).await?;
		Ok(response
			.iter()
			.map(|ip| ResolvedBackend {
				addr: SocketAddr::new(ip, 0),
				weight: 1,
				tags: vec![],
			})
			.collect())
	}
}

/// A handle that cancels its owning watch task on drop, stored in the `StateSnapshot` per route
/// (spec §4.13: "its cancel function stored in the snapshot; reload cancels it").
pub struct WatchHandle {
	task: tokio::task::JoinHandle<()>,
}

impl Drop for WatchHandle {
	fn drop(&mut self) {
		self.task.abort();
	}
}

/// Spawns a task that polls `registry.resolve(dns_name)` on `refresh_interval` and pushes the
/// result into `balancer` via `update_backends`, filtered by `required_tags` and with `port`
/// applied to every resolved address (DNS resolution only ever returns an IP).
pub fn spawn_watch(
	registry: Arc<dyn ServiceRegistry>,
	dns_name: String,
	port: u16,
	refresh_interval: Duration,
	required_tags: HashSet<String>,
	balancer: Arc<Balancer>,
) -> WatchHandle {
	let task = tokio::spawn(async move {
		let mut ticker = tokio::time::interval(refresh_interval);
		loop {
			ticker.tick().await;
			match registry.resolve(&dns_name).await {
				Ok(resolved) => {
					let backends = resolved
						.into_iter()
						.filter(|b| required_tags.iter().all(|t| b.tags.contains(t)))
						.map(|b| {
							let mut addr = b.addr;
							if addr.port() == 0 {
								addr.set_port(port);
							}
							Arc::new(Backend::new(addr.to_string(), addr, b.weight))
						})
						.collect();
					balancer.update_backends(backends);
				},
				Err(e) => warn!(name = %dns_name, err = %e, "registry resolve failed, keeping prior backends"),
			}
		}
	});
	WatchHandle { task }
}
