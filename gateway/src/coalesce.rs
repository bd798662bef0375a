//! Request Coalescer (C8): single-flight per fingerprint. Grounded in the teacher's
//! `client::dns` cache's "in-flight resolution" dedup idea (one resolve per hostname shared by
//! concurrent callers via a broadcast channel), generalized here from DNS lookups to full proxied
//! responses with a leader/follower buffered-response protocol.
//!
//! Open question (spec §9) resolved: a caller arriving after a follower has already detached into
//! its own fallthrough call simply becomes the new leader of a fresh group under the same
//! fingerprint — the detached follower's own call is not itself coalesced into. This keeps the
//! group map's invariant simple (a fingerprint maps to at most one live leader at a time) at the
//! cost of that one caller potentially duplicating backend work, which matches the "fail open
//! toward extra backend calls over blocking" bias the rest of this component takes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::types::CoalesceConfig;

#[derive(Clone)]
pub struct BufferedResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

#[derive(Clone)]
enum GroupResult {
	Response(BufferedResponse),
	/// The leader's call itself failed; followers fall through to their own call rather than
	/// replaying an error (an error response isn't necessarily safe to share across callers that
	/// may have slightly different request shapes past the fingerprinted fields).
	LeaderFailed,
}

struct Group {
	tx: broadcast::Sender<GroupResult>,
	had_follower: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
pub struct Coalescer {
	groups: Mutex<HashMap<String, Arc<Group>>>,
	pub timeout_count: std::sync::atomic::AtomicU64,
}

pub enum Outcome {
	/// This caller is the leader: run the downstream call, buffer it, then call
	/// [`Coalescer::publish`].
	Leader(LeaderToken),
	/// This caller attached as a follower and received the leader's buffered response.
	Shared(BufferedResponse),
	/// This caller must run the downstream call itself (no group, a timed-out wait, or the
	/// leader's own call failed).
	RunOwn,
}

pub struct LeaderToken {
	fingerprint: String,
	group: Arc<Group>,
}

impl Coalescer {
	pub fn new() -> Coalescer {
		Coalescer::default()
	}

	pub fn fingerprint(
		method: &http::Method,
		path: &str,
		query: &str,
		vary_headers: &[String],
		headers: &HeaderMap,
	) -> String {
		let mut key = format!("{method}|{path}|{query}");
		for name in vary_headers {
			key.push('|');
			if let Some(v) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
				key.push_str(v);
			}
		}
		key
	}

	pub async fn join(&self, fingerprint: &str, cfg: &CoalesceConfig) -> Outcome {
		let (group, is_leader) = {
			let mut groups = self.groups.lock();
			if let Some(existing) = groups.get(fingerprint) {
				existing.had_follower.store(true, std::sync::atomic::Ordering::Relaxed);
				(existing.clone(), false)
			} else {
				let (tx, _rx) = broadcast::channel(1);
				let group = Arc::new(Group {
					tx,
					had_follower: std::sync::atomic::AtomicBool::new(false),
				});
				groups.insert(fingerprint.to_string(), group.clone());
				(group, true)
			}
		};

		if is_leader {
			return Outcome::Leader(LeaderToken {
				fingerprint: fingerprint.to_string(),
				group,
			});
		}

		let mut rx = group.tx.subscribe();
		match tokio::time::timeout(cfg.timeout, rx.recv()).await {
			Ok(Ok(GroupResult::Response(resp))) => Outcome::Shared(resp),
			Ok(Ok(GroupResult::LeaderFailed)) | Ok(Err(_)) => Outcome::RunOwn,
			Err(_) => {
				self.timeout_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
				Outcome::RunOwn
			},
		}
	}

	/// Called by the leader once its downstream call completes. Removes the group (so a later
	/// caller with the same fingerprint starts a fresh one) and broadcasts the result to any
	/// followers that are still waiting.
	pub fn publish(&self, token: LeaderToken, result: Option<BufferedResponse>) -> bool {
		self.groups.lock().remove(&token.fingerprint);
		let had_follower = token.group.had_follower.load(std::sync::atomic::Ordering::Relaxed);
		let payload = match result {
			Some(resp) => GroupResult::Response(resp),
			None => GroupResult::LeaderFailed,
		};
		let _ = token.group.tx.send(payload);
		had_follower
	}

	pub fn eligible(cfg: &CoalesceConfig, method: &http::Method) -> bool {
		cfg.enabled && cfg.methods.iter().any(|m| m.eq_ignore_ascii_case(method.as_str()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration as StdDuration;

	fn cfg(timeout: StdDuration) -> CoalesceConfig {
		CoalesceConfig {
			enabled: true,
			methods: vec!["GET".to_string()],
			vary_headers: vec![],
			timeout,
			max_body_bytes: 1024,
		}
	}

	fn resp(body: &str) -> BufferedResponse {
		BufferedResponse {
			status: StatusCode::OK,
			headers: HeaderMap::new(),
			body: Bytes::from(body.to_string()),
		}
	}

	#[tokio::test]
	async fn follower_shares_leader_response() {
		let c = Arc::new(Coalescer::new());
		let fp = "GET|/x|";
		let leader = match c.join(fp, &cfg(Duration::from_secs(1))).await {
			Outcome::Leader(t) => t,
			_ => panic!("expected leader"),
		};

		let c2 = c.clone();
		let follower = tokio::spawn(async move { c2.join(fp, &cfg(Duration::from_secs(1))).await });
		tokio::task::yield_now().await;

		let had_follower = c.publish(leader, Some(resp("hello")));
		assert!(had_follower);

		match follower.await.unwrap() {
			Outcome::Shared(b) => assert_eq!(b.body, Bytes::from("hello")),
			_ => panic!("expected shared"),
		}
	}

	#[tokio::test]
	async fn different_fingerprints_never_share_a_group() {
		let c = Coalescer::new();
		let l1 = match c.join("GET|/a|", &cfg(Duration::from_secs(1))).await {
			Outcome::Leader(t) => t,
			_ => panic!(),
		};
		let l2 = match c.join("GET|/b|", &cfg(Duration::from_secs(1))).await {
			Outcome::Leader(t) => t,
			_ => panic!("expected a distinct leader for a distinct fingerprint"),
		};
		c.publish(l1, Some(resp("a")));
		c.publish(l2, Some(resp("b")));
	}

	#[tokio::test]
	async fn follower_times_out_and_runs_own() {
		let c = Arc::new(Coalescer::new());
		let fp = "GET|/slow|";
		let _leader = match c.join(fp, &cfg(Duration::from_millis(20))).await {
			Outcome::Leader(t) => t,
			_ => panic!(),
		};
		match c.join(fp, &cfg(Duration::from_millis(20))).await {
			Outcome::RunOwn => {},
			_ => panic!("expected timeout fallthrough"),
		}
		assert_eq!(c.timeout_count.load(std::sync::atomic::Ordering::Relaxed), 1);
	}

	#[tokio::test]
	async fn leader_failure_sends_followers_to_run_own() {
		let c = Arc::new(Coalescer::new());
		let fp = "GET|/err|";
		let leader = match c.join(fp, &cfg(Duration::from_secs(1))).await {
			Outcome::Leader(t) => t,
			_ => panic!(),
		};
		let c2 = c.clone();
		let follower = tokio::spawn(async move { c2.join(fp, &cfg(Duration::from_secs(1))).await });
		tokio::task::yield_now().await;
		c.publish(leader, None);
		match follower.await.unwrap() {
			Outcome::RunOwn => {},
			_ => panic!("expected run-own after leader failure"),
		}
	}

	#[test]
	fn eligible_checks_method_and_enabled_flag() {
		let mut cfg = cfg(Duration::from_secs(1));
		assert!(Coalescer::eligible(&cfg, &http::Method::GET));
		assert!(!Coalescer::eligible(&cfg, &http::Method::POST));
		cfg.enabled = false;
		assert!(!Coalescer::eligible(&cfg, &http::Method::GET));
	}
}
