//! Health Checker (C3): one active-probe task per backend URL. On N consecutive successes or
//! failures the status flips and every subscribed balancer is updated exactly once.
//!
//! Grounded in the teacher's transition-on-threshold pattern (see
//! `traffic_management` health state machine in the example pack: `HealthState::Unhealthy {
//! consecutive_failures, .. }`) generalized to also count consecutive successes for the
//! unhealthy -> healthy transition, and wired to the Balancer via a plain callback instead of an
//! event bus (§9 design note: favor explicit callback registration over cyclic references).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::balancer::Balancer;
use crate::types::HealthCheckConfig;

/// A single backend's probe target and where to report transitions.
pub struct Subscription {
	pub url: String,
	pub addr: std::net::SocketAddr,
	pub config: HealthCheckConfig,
	pub balancer: Arc<Balancer>,
}

struct Counters {
	consecutive_successes: AtomicU32,
	consecutive_failures: AtomicU32,
}

/// Owns one probe task per distinct backend URL across the whole snapshot, satisfying the
/// invariant "for any backend URL, at most one Health-Checker task" even when several routes
/// reference the same upstream.
pub struct HealthChecker {
	tasks: AsyncMutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl HealthChecker {
	pub fn new() -> HealthChecker {
		HealthChecker {
			tasks: AsyncMutex::new(HashMap::new()),
		}
	}

	pub async fn spawn(&self, sub: Subscription) {
		let mut tasks = self.tasks.lock().await;
		if tasks.contains_key(&sub.url) {
			return;
		}
		let url = sub.url.clone();
		let handle = tokio::spawn(run_probe_loop(sub));
		tasks.insert(url, handle);
	}

	/// Reconciliation step of Reloader §4.12 step 6: drop subscriptions for URLs no longer
	/// referenced by the new config.
	pub async fn reconcile(&self, live_urls: &std::collections::HashSet<String>) {
		let mut tasks = self.tasks.lock().await;
		tasks.retain(|url, handle| {
			if live_urls.contains(url) {
				true
			} else {
				handle.abort();
				false
			}
		});
	}

	pub async fn shutdown(&self) {
		let mut tasks = self.tasks.lock().await;
		for (_, h) in tasks.drain() {
			h.abort();
		}
	}
}

impl Default for HealthChecker {
	fn default() -> Self {
		Self::new()
	}
}

async fn run_probe_loop(sub: Subscription) {
	let counters = Counters {
		consecutive_successes: AtomicU32::new(0),
		consecutive_failures: AtomicU32::new(0),
	};
	let client = reqwest_like_client();
	loop {
		tokio::time::sleep(sub.config.interval).await;
		let ok = probe_once(&client, &sub).await;
		let transitioned = record_outcome(&counters, ok, &sub.config);
		if let Some(now_healthy) = transitioned {
			debug!(url = %sub.url, healthy = now_healthy, "health transition");
			sub.balancer.mark_healthy(&sub.url, now_healthy);
		}
	}
}

/// Returns `Some(new_status)` only on the tick where the threshold was just crossed, so the
/// callback fires exactly once per transition (spec §4.3).
fn record_outcome(counters: &Counters, ok: bool, cfg: &HealthCheckConfig) -> Option<bool> {
	if ok {
		counters.consecutive_failures.store(0, Ordering::Relaxed);
		let n = counters.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
		(n == cfg.healthy_threshold).then_some(true)
	} else {
		counters.consecutive_successes.store(0, Ordering::Relaxed);
		let n = counters.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
		(n == cfg.unhealthy_threshold).then_some(false)
	}
}

/// Minimal probe transport: a fresh TCP-level HTTP/1.1 HEAD-or-GET request per tick using hyper's
/// client builder, bounded by the configured timeout. Kept deliberately small since the
/// production HTTP client stack lives in `client::TransportPool` (C4) and reusing it here would
/// make health checks share fate with data-plane connection pressure.
struct ProbeClient {
	client: hyper_util::client::legacy::Client<
		hyper_util::client::legacy::connect::HttpConnector,
		http_body_util::Empty<bytes::Bytes>,
	>,
}

fn reqwest_like_client() -> ProbeClient {
	ProbeClient {
		client: hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
			.build(hyper_util::client::legacy::connect::HttpConnector::new()),
	}
}

async fn probe_once(client: &ProbeClient, sub: &Subscription) -> bool {
	let uri = format!("http://{}{}", sub.addr, sub.config.path);
	let Ok(uri) = uri.parse::<http::Uri>() else {
		return false;
	};
	let req = http::Request::builder()
		.method(http::Method::GET)
		.uri(uri)
		.body(http_body_util::Empty::new())
		.expect("probe request is well-formed");

	let deadline = Instant::now() + sub.config.timeout;
	match tokio::time::timeout_at(deadline, client.client.request(req)).await {
		Ok(Ok(resp)) => {
			let status = resp.status().as_u16();
			status >= sub.config.expected_status.0 && status <= sub.config.expected_status.1
		},
		Ok(Err(e)) => {
			warn!(url = %sub.url, err = %e, "health probe transport error");
			false
		},
		Err(_) => {
			warn!(url = %sub.url, timeout = ?sub.config.timeout, "health probe timed out");
			false
		},
	}
}
