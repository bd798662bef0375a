//! Route Proxy (C6): selects a backend, forwards the request, retries per policy against a shared
//! retry budget, and reports the outcome. Grounded in the teacher's `proxy::httpproxy` request
//! forwarding path (`select_backend` + `Client::call` + outcome reporting into retry/outlier
//! state), adapted to this repository's `Balancer`/`SharedTransportPool`/`CircuitBreaker` types.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use tracing::warn;

use crate::balancer::{Balancer, SelectionContext};
use crate::breaker::CircuitBreaker;
use crate::client::{ProxyBody, SharedTransportPool};
use crate::error::ProxyError;
use crate::types::{Backend, RetryPolicy, TimeoutPolicy, UpstreamName};

/// A sliding window over recent request/retry counts shared by every route on the same named
/// upstream pool, implementing §4.6's `max(min_retries, ratio × recent_requests)` budget.
pub struct RetryBudget {
	min_retries: u32,
	ratio: f64,
	window: Duration,
	state: Mutex<BudgetState>,
	requests_in_window: AtomicU32,
	retries_in_window: AtomicU32,
}

struct BudgetState {
	window_started: Instant,
}

impl RetryBudget {
	pub fn new(min_retries: u32, ratio: f64, window: Duration) -> RetryBudget {
		RetryBudget {
			min_retries,
			ratio,
			window,
			state: Mutex::new(BudgetState {
				window_started: Instant::now(),
			}),
			requests_in_window: AtomicU32::new(0),
			retries_in_window: AtomicU32::new(0),
		}
	}

	fn maybe_roll(&self) {
		let mut state = self.state.lock().unwrap();
		if state.window_started.elapsed() >= self.window {
			state.window_started = Instant::now();
			self.requests_in_window.store(0, Ordering::Relaxed);
			self.retries_in_window.store(0, Ordering::Relaxed);
		}
	}

	pub fn record_request(&self) {
		self.maybe_roll();
		self.requests_in_window.fetch_add(1, Ordering::Relaxed);
	}

	/// Returns `true` if a retry is still within budget, and if so, debits it.
	pub fn try_consume_retry(&self) -> bool {
		self.maybe_roll();
		let recent = self.requests_in_window.load(Ordering::Relaxed) as f64;
		let allowance = (self.min_retries as f64).max(self.ratio * recent) as u32;
		let mut current = self.retries_in_window.load(Ordering::Relaxed);
		loop {
			if current >= allowance {
				return false;
			}
			match self.retries_in_window.compare_exchange_weak(
				current,
				current + 1,
				Ordering::AcqRel,
				Ordering::Relaxed,
			) {
				Ok(_) => return true,
				Err(observed) => current = observed,
			}
		}
	}
}

/// One per route. Owns the route's balancer and retry/timeout policy; borrows the upstream's
/// shared transport pool and retry budget, both of which outlive any single route (they're keyed
/// by upstream name, not route id).
pub struct RouteProxy {
	balancer: Arc<Balancer>,
	upstream: Option<UpstreamName>,
	retry: RetryPolicy,
	timeout: TimeoutPolicy,
	transport: SharedTransportPool,
	retry_budget: Arc<RetryBudget>,
	breaker: Option<Arc<CircuitBreaker>>,
}

impl RouteProxy {
	pub fn new(
		balancer: Arc<Balancer>,
		upstream: Option<UpstreamName>,
		retry: RetryPolicy,
		timeout: TimeoutPolicy,
		transport: SharedTransportPool,
		retry_budget: Arc<RetryBudget>,
		breaker: Option<Arc<CircuitBreaker>>,
	) -> RouteProxy {
		RouteProxy {
			balancer,
			upstream,
			retry,
			timeout,
			transport,
			retry_budget,
			breaker,
		}
	}

	/// `req` carries an already-buffered body: every earlier pipeline step that needs to inspect
	/// the body (validation's size check, coalescing's fingerprint) requires it read into memory
	/// first, so by the time a request reaches the proxy a fresh `Full<Bytes>` body can be rebuilt
	/// cheaply for every retry attempt without re-reading a stream.
	pub async fn serve(
		&self,
		req: Request<Bytes>,
		ctx: &SelectionContext,
	) -> Result<Response<ProxyBody>, ProxyError> {
		self.retry_budget.record_request();
		let method_is_idempotent = matches!(
			req.method(),
			&http::Method::GET | &http::Method::HEAD | &http::Method::PUT | &http::Method::DELETE | &http::Method::OPTIONS
		);
		let (parts, body) = req.into_parts();

		let mut attempt = 0u8;
		loop {
			attempt += 1;
			let permit = match &self.breaker {
				Some(b) => match b.try_acquire() {
					Some(p) => Some(p),
					None => return Err(ProxyError::BreakerOpen),
				},
				None => None,
			};

			let backend = self.balancer.next(ctx).ok_or(ProxyError::NoHealthyBackend)?;
			let attempt_req = build_request(&parts, body.clone(), &backend)?;
			let deadline = Duration::min(self.timeout.request_timeout, self.retry.per_try_timeout);

			let result = self.send_once(attempt_req, &backend, deadline).await;
			self.balancer.release(&backend);

			// Breaker failure per §4.7 covers transport errors *and* 5xx responses, not just a
			// transport-level Err — a backend that answers every request with 500 must still trip
			// the breaker even though the proxy call itself "succeeded".
			let breaker_failure = match &result {
				Ok(resp) => resp.status().is_server_error(),
				Err(_) => true,
			};
			if let Some(p) = permit {
				p.done(!breaker_failure);
			}

			match result {
				Ok(resp) => {
					let status = resp.status().as_u16();
					let retriable_status = self.retry.retry_on_status.contains(&status);
					let can_retry = retriable_status
						&& attempt < self.retry.attempts
						&& method_is_idempotent
						&& self.retry_budget.try_consume_retry();
					if !can_retry {
						return Ok(resp);
					}
				},
				Err(e) => {
					let retriable = self.retry.retry_on_connect_error
						&& e.counts_as_breaker_failure()
						&& (method_is_idempotent || matches!(e, ProxyError::Timeout));
					let can_retry =
						retriable && attempt < self.retry.attempts && self.retry_budget.try_consume_retry();
					if !can_retry {
						return Err(e);
					}
				},
			}
		}
	}

	async fn send_once(
		&self,
		req: Request<ProxyBody>,
		backend: &Backend,
		deadline: Duration,
	) -> Result<Response<ProxyBody>, ProxyError> {
		let pool = self.transport.current();
		let client = pool.get(self.upstream.as_deref());
		let call = client.request(req);
		match tokio::time::timeout(deadline, call).await {
			Ok(Ok(resp)) => Ok(resp.map(|b| b.map_err(Into::into).boxed())),
			Ok(Err(e)) => {
				warn!(backend = %backend.url, err = %e, "backend transport error");
				Err(ProxyError::BackendError(e.to_string()))
			},
			Err(_) => Err(ProxyError::Timeout),
		}
	}
}

fn build_request(
	parts: &http::request::Parts,
	body: Bytes,
	backend: &Backend,
) -> Result<Request<ProxyBody>, ProxyError> {
	let mut builder = Request::builder().method(parts.method.clone()).uri(rewrite_uri(&parts.uri, backend)?);
	for (name, value) in &parts.headers {
		builder = builder.header(name, value);
	}
	builder
		.body(Full::new(body).map_err(Into::into).boxed())
		.map_err(|e| ProxyError::Internal(e.to_string()))
}

fn rewrite_uri(uri: &Uri, backend: &Backend) -> Result<Uri, ProxyError> {
	let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
	format!("http://{}{}", backend.addr, path_and_query)
		.parse()
		.map_err(|e: http::uri::InvalidUri| ProxyError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn retry_budget_allows_up_to_ratio_of_recent_requests() {
		let budget = RetryBudget::new(1, 0.5, Duration::from_secs(60));
		for _ in 0..10 {
			budget.record_request();
		}
		// allowance = max(1, 0.5*10) = 5
		let mut consumed = 0;
		while budget.try_consume_retry() {
			consumed += 1;
		}
		assert_eq!(consumed, 5);
	}

	#[test]
	fn retry_budget_floor_is_min_retries_even_with_no_traffic() {
		let budget = RetryBudget::new(2, 0.5, Duration::from_secs(60));
		assert!(budget.try_consume_retry());
		assert!(budget.try_consume_retry());
		assert!(!budget.try_consume_retry());
	}

	#[test]
	fn rewrite_uri_preserves_path_and_query() {
		let backend = Backend::new("b".to_string(), "10.0.0.5:8080".parse().unwrap(), 1);
		let uri: Uri = "http://original-host/a/b?x=1".parse().unwrap();
		let rewritten = rewrite_uri(&uri, &backend).unwrap();
		assert_eq!(rewritten.to_string(), "http://10.0.0.5:8080/a/b?x=1");
	}
}
