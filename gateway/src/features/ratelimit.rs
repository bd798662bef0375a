//! Local rate limit feature: Pipeline Composer step 17. Grounded in the teacher's
//! `http::localratelimit::RateLimit`, including its own choice to keep a small hand-rolled token
//! bucket in-tree (the teacher's comment: "Forked from
//! https://github.com/pelikan-io/rustcommon/tree/main/ratelimit to provide some additional
//! functions") rather than depend on a registry crate whose API didn't quite fit; ours is a
//! from-scratch token bucket in the same spirit, sized to what `check` actually needs.

use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::ProxyError;
use crate::features::Feature;
use crate::types::{RateLimitConfig, RouteConfig, RouteId};

mod bucket {
	use std::sync::Mutex;
	use std::time::{Duration, Instant};

	/// Simple refilling token bucket. `try_take` returns `Ok(())` if a token was available, or
	/// `Err(retry_after)` with the wait until the next token would be available.
	pub struct TokenBucket {
		max_tokens: u64,
		tokens_per_fill: u64,
		fill_interval: Duration,
		state: Mutex<State>,
	}

	struct State {
		available: u64,
		last_refill: Instant,
	}

	impl TokenBucket {
		pub fn new(max_tokens: u64, tokens_per_fill: u64, fill_interval: Duration) -> TokenBucket {
			TokenBucket {
				max_tokens,
				tokens_per_fill,
				fill_interval,
				state: Mutex::new(State {
					available: max_tokens,
					last_refill: Instant::now(),
				}),
			}
		}

		fn refill(&self, state: &mut State, now: Instant) {
			let elapsed = now.saturating_duration_since(state.last_refill);
			if elapsed >= self.fill_interval && self.fill_interval > Duration::ZERO {
				let fills = elapsed.as_nanos() / self.fill_interval.as_nanos().max(1);
				let added = fills as u64 * self.tokens_per_fill;
				state.available = (state.available + added).min(self.max_tokens);
				state.last_refill += self.fill_interval * fills as u32;
			}
		}

		pub fn try_take(&self, now: Instant) -> Result<(), Duration> {
			let mut state = self.state.lock().unwrap();
			self.refill(&mut state, now);
			if state.available > 0 {
				state.available -= 1;
				Ok(())
			} else {
				Err(self.fill_interval)
			}
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn exhausts_then_refills() {
			let b = TokenBucket::new(2, 1, Duration::from_millis(10));
			let t0 = Instant::now();
			assert!(b.try_take(t0).is_ok());
			assert!(b.try_take(t0).is_ok());
			assert!(b.try_take(t0).is_err());
			assert!(b.try_take(t0 + Duration::from_millis(15)).is_ok());
		}
	}
}

#[derive(Default)]
pub struct RateLimitFeature {
	per_route: DashMap<RouteId, bucket::TokenBucket>,
}

impl RateLimitFeature {
	pub fn new() -> RateLimitFeature {
		RateLimitFeature::default()
	}

	pub fn check(&self, route_id: &str) -> Result<(), ProxyError> {
		let Some(b) = self.per_route.get(route_id) else {
			return Ok(());
		};
		b.try_take(Instant::now().into_std())
			.map_err(|retry_after| ProxyError::RateLimited {
				retry_after_secs: retry_after.as_secs().max(1),
			})
	}
}

impl Feature for RateLimitFeature {
	fn name(&self) -> &'static str {
		"rate_limit"
	}

	fn setup(&self, route: &RouteConfig) -> Result<(), ProxyError> {
		if !route.rate_limit.enabled {
			self.per_route.remove(&route.id);
			return Ok(());
		}
		self
			.per_route
			.insert(route.id.clone(), compile(&route.rate_limit));
		Ok(())
	}

	fn route_ids(&self) -> Vec<RouteId> {
		self.per_route.iter().map(|e| e.key().clone()).collect()
	}

	fn as_any(&self) -> &dyn std::any::Any {
		self
	}
}

fn compile(cfg: &RateLimitConfig) -> bucket::TokenBucket {
	bucket::TokenBucket::new(cfg.max_tokens, cfg.tokens_per_fill, cfg.fill_interval)
}
