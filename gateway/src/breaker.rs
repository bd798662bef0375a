//! Circuit Breaker (C7): a rolling time-bucketed failure-rate window per route, with half-open
//! probing. Grounded in the teacher's sliding-window counters in `traffic_management` (the example
//! pack's `HealthState`/bucket rotation idea, generalized here from health-check outcomes to
//! per-request outcomes) and the classic `Allow() -> (done(err), err)` breaker contract from
//! hystrix-style libraries the teacher's retry/timeout middleware is modeled after.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::types::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Default)]
struct Bucket {
	successes: AtomicU32,
	failures: AtomicU32,
}

/// Fixed-size ring of time buckets covering `window`; the current bucket is whichever slot
/// `elapsed / bucket_width` lands in, with stale slots cleared lazily on access (spec §4.7: "no
/// background sweeper, rotate on read").
struct RollingWindow {
	buckets: Vec<Bucket>,
	bucket_width: Duration,
	started_at: Instant,
	last_index: AtomicU64,
}

impl RollingWindow {
	fn new(window: Duration, count: usize) -> RollingWindow {
		RollingWindow {
			buckets: (0..count).map(|_| Bucket::default()).collect(),
			bucket_width: window / count.max(1) as u32,
			started_at: Instant::now(),
			last_index: AtomicU64::new(0),
		}
	}

	fn current_index(&self, now: Instant) -> u64 {
		let elapsed = now.saturating_duration_since(self.started_at);
		(elapsed.as_nanos() / self.bucket_width.as_nanos().max(1)) as u64
	}

	/// Clears any bucket that's aged out since it was last touched, then records into the current
	/// one. Buckets are addressed by `index % len`, so a bucket untouched for a full window is
	/// guaranteed stale and safe to zero before reuse.
	fn record(&self, now: Instant, success: bool) {
		let idx = self.current_index(now);
		let slot = &self.buckets[(idx as usize) % self.buckets.len()];
		let prev = self.last_index.swap(idx, Ordering::AcqRel);
		if idx != prev {
			// Entering a different bucket slot than last write: it holds a stale generation's
			// counts (or is fresh), either way safe to zero before recording into it.
			slot.successes.store(0, Ordering::Relaxed);
			slot.failures.store(0, Ordering::Relaxed);
		}
		if success {
			slot.successes.fetch_add(1, Ordering::Relaxed);
		} else {
			slot.failures.fetch_add(1, Ordering::Relaxed);
		}
	}

	fn totals(&self, now: Instant) -> (u32, u32) {
		let idx = self.current_index(now);
		let len = self.buckets.len() as u64;
		let mut successes = 0;
		let mut failures = 0;
		for i in 0..len {
			if idx.saturating_sub(i) >= len {
				continue;
			}
			let slot = &self.buckets[((idx.saturating_sub(i)) as usize) % self.buckets.len()];
			successes += slot.successes.load(Ordering::Relaxed);
			failures += slot.failures.load(Ordering::Relaxed);
		}
		(successes, failures)
	}

	/// Zeroes every bucket. Called when a half-open probe run closes the breaker so the pre-trip
	/// failures that tripped it don't linger into the freshly closed window and cause an
	/// immediate re-trip on the next few requests.
	fn reset(&self) {
		for bucket in &self.buckets {
			bucket.successes.store(0, Ordering::Relaxed);
			bucket.failures.store(0, Ordering::Relaxed);
		}
	}
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

pub struct CircuitBreaker {
	config: BreakerConfig,
	window: RollingWindow,
	state: AtomicU8,
	opened_at: Mutex<Option<Instant>>,
	half_open_inflight: AtomicU32,
	/// Cumulative successful probes in the current half-open episode. Reset whenever a new
	/// episode starts (the open -> half-open transition) or a probe fails (back to open).
	half_open_successes: AtomicU32,
}

/// A permit returned by `try_acquire`; the caller must report the outcome through `done` exactly
/// once. Dropping it without calling `done` is treated as neither success nor failure (the request
/// was abandoned before an outcome was known).
pub struct Permit<'a> {
	breaker: &'a CircuitBreaker,
	is_probe: bool,
	done: bool,
}

impl<'a> Permit<'a> {
	pub fn done(mut self, success: bool) {
		self.breaker.record(success, self.is_probe);
		self.done = true;
	}
}

impl<'a> Drop for Permit<'a> {
	fn drop(&mut self) {
		if !self.done && self.is_probe {
			self.breaker.half_open_inflight.fetch_sub(1, Ordering::AcqRel);
		}
	}
}

impl CircuitBreaker {
	pub fn new(config: BreakerConfig) -> CircuitBreaker {
		CircuitBreaker {
			window: RollingWindow::new(config.window, config.buckets),
			config,
			state: AtomicU8::new(STATE_CLOSED),
			opened_at: Mutex::new(None),
			half_open_inflight: AtomicU32::new(0),
			half_open_successes: AtomicU32::new(0),
		}
	}

	pub fn state(&self) -> State {
		match self.state.load(Ordering::Acquire) {
			STATE_OPEN => State::Open,
			STATE_HALF_OPEN => State::HalfOpen,
			_ => State::Closed,
		}
	}

	/// `Allow()` from spec §4.7: returns a `Permit` to proceed, or `None` if the breaker is open
	/// and not yet due for a half-open probe.
	pub fn try_acquire(&self) -> Option<Permit<'_>> {
		if !self.config.enabled {
			return Some(Permit {
				breaker: self,
				is_probe: false,
				done: false,
			});
		}
		match self.state.load(Ordering::Acquire) {
			STATE_CLOSED => Some(Permit {
				breaker: self,
				is_probe: false,
				done: false,
			}),
			STATE_OPEN => {
				let mut opened_at = self.opened_at.lock().unwrap();
				let due = opened_at.is_some_and(|t| t.elapsed() >= self.config.open_timeout);
				if !due {
					return None;
				}
				*opened_at = None;
				if self
					.state
					.compare_exchange(STATE_OPEN, STATE_HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
					.is_ok()
				{
					self.half_open_successes.store(0, Ordering::Relaxed);
				}
				self.try_acquire_half_open()
			},
			_ => self.try_acquire_half_open(),
		}
	}

	fn try_acquire_half_open(&self) -> Option<Permit<'_>> {
		let mut current = self.half_open_inflight.load(Ordering::Acquire);
		loop {
			if current >= self.config.half_open_max_requests {
				return None;
			}
			match self.half_open_inflight.compare_exchange_weak(
				current,
				current + 1,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => {
					return Some(Permit {
						breaker: self,
						is_probe: true,
						done: false,
					});
				},
				Err(observed) => current = observed,
			}
		}
	}

	fn record(&self, success: bool, was_probe: bool) {
		if !self.config.enabled {
			return;
		}
		let now = Instant::now();
		self.window.record(now, success);

		if was_probe {
			self.half_open_inflight.fetch_sub(1, Ordering::AcqRel);
			if success {
				// Per spec: the breaker only closes once *all* half_open_max_requests probes in
				// this episode have succeeded, not on the first one.
				let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
				if successes >= self.config.half_open_max_requests.max(1) {
					self.window.reset();
					self.state.store(STATE_CLOSED, Ordering::Release);
				}
			} else {
				self.half_open_successes.store(0, Ordering::Relaxed);
				self.trip(now);
			}
			return;
		}

		if self.state.load(Ordering::Acquire) != STATE_CLOSED {
			return;
		}
		let (successes, failures) = self.window.totals(now);
		let total = successes + failures;
		if total < self.config.min_requests_in_window {
			return;
		}
		let failure_rate = failures as f64 / total as f64;
		if failure_rate >= self.config.failure_threshold {
			self.trip(now);
		}
	}

	fn trip(&self, now: Instant) {
		self.state.store(STATE_OPEN, Ordering::Release);
		*self.opened_at.lock().unwrap() = Some(now);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg() -> BreakerConfig {
		BreakerConfig {
			enabled: true,
			window: Duration::from_secs(10),
			buckets: 10,
			failure_threshold: 0.5,
			min_requests_in_window: 4,
			open_timeout: Duration::from_millis(50),
			half_open_max_requests: 1,
		}
	}

	#[test]
	fn stays_closed_below_min_requests() {
		let b = CircuitBreaker::new(cfg());
		for _ in 0..3 {
			b.try_acquire().unwrap().done(false);
		}
		assert_eq!(b.state(), State::Closed);
	}

	#[test]
	fn opens_once_failure_rate_crosses_threshold() {
		let b = CircuitBreaker::new(cfg());
		b.try_acquire().unwrap().done(true);
		b.try_acquire().unwrap().done(false);
		b.try_acquire().unwrap().done(false);
		b.try_acquire().unwrap().done(false);
		assert_eq!(b.state(), State::Open);
		assert!(b.try_acquire().is_none());
	}

	#[test]
	fn half_open_probe_recovers_to_closed_on_success() {
		let b = CircuitBreaker::new(cfg());
		for _ in 0..4 {
			b.try_acquire().unwrap().done(false);
		}
		assert_eq!(b.state(), State::Open);
		std::thread::sleep(Duration::from_millis(60));
		let permit = b.try_acquire().expect("should allow one probe");
		permit.done(true);
		assert_eq!(b.state(), State::Closed);
	}

	#[test]
	fn half_open_probe_failure_reopens() {
		let b = CircuitBreaker::new(cfg());
		for _ in 0..4 {
			b.try_acquire().unwrap().done(false);
		}
		std::thread::sleep(Duration::from_millis(60));
		let permit = b.try_acquire().unwrap();
		permit.done(false);
		assert_eq!(b.state(), State::Open);
	}

	#[test]
	fn half_open_limits_concurrent_probes() {
		let b = CircuitBreaker::new(cfg());
		for _ in 0..4 {
			b.try_acquire().unwrap().done(false);
		}
		std::thread::sleep(Duration::from_millis(60));
		let _p1 = b.try_acquire().expect("first probe allowed");
		assert!(b.try_acquire().is_none());
	}

	#[test]
	fn half_open_requires_every_probe_to_succeed_before_closing() {
		let mut c = cfg();
		c.half_open_max_requests = 2;
		let b = CircuitBreaker::new(c);
		for _ in 0..4 {
			b.try_acquire().unwrap().done(false);
		}
		std::thread::sleep(Duration::from_millis(60));

		b.try_acquire().expect("first probe allowed").done(true);
		assert_eq!(b.state(), State::HalfOpen, "must stay half-open until every probe has succeeded");

		b.try_acquire().expect("second probe allowed").done(true);
		assert_eq!(b.state(), State::Closed);
	}

	#[test]
	fn half_open_probe_failure_after_partial_successes_reopens_and_resets_streak() {
		let mut c = cfg();
		c.half_open_max_requests = 2;
		let b = CircuitBreaker::new(c);
		for _ in 0..4 {
			b.try_acquire().unwrap().done(false);
		}
		std::thread::sleep(Duration::from_millis(60));

		b.try_acquire().expect("first probe allowed").done(true);
		b.try_acquire().expect("second probe allowed").done(false);
		assert_eq!(b.state(), State::Open, "a failing probe reopens even after partial successes");
	}

	#[test]
	fn closing_from_half_open_clears_stale_failure_counts() {
		let b = CircuitBreaker::new(cfg());
		for _ in 0..4 {
			b.try_acquire().unwrap().done(false);
		}
		std::thread::sleep(Duration::from_millis(60));
		b.try_acquire().expect("probe allowed").done(true);
		assert_eq!(b.state(), State::Closed);

		// The 4 pre-trip failures must not still be sitting in the window: two more failures
		// alone are below min_requests_in_window (4) and must not immediately re-trip.
		b.try_acquire().unwrap().done(false);
		b.try_acquire().unwrap().done(false);
		assert_eq!(b.state(), State::Closed);
	}

	#[test]
	fn disabled_breaker_always_allows() {
		let mut cfg = cfg();
		cfg.enabled = false;
		let b = CircuitBreaker::new(cfg);
		for _ in 0..100 {
			b.try_acquire().unwrap().done(false);
		}
		assert_eq!(b.state(), State::Closed);
	}
}
