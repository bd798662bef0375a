//! End-to-end scenarios that exercise the whole snapshot-build-and-serve path against real TCP
//! backends instead of mocking any single component. Each backend is a tiny hyper server spawned on
//! an ephemeral port; requests go through `Reloader::bootstrap`/`reload` and `pipeline::handle`
//! exactly the way `gateway::gateway::serve_one` drives them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use gateway::config::ConfigSource;
use gateway::gateway::auto_server;
use gateway::pipeline::{self, RequestContext};
use gateway::registry::StaticRegistry;
use gateway::reload::Reloader;
use gateway::snapshot::StateSnapshot;
use gateway::varctx::VarCtx;

/// Spawns a backend on `127.0.0.1:0` that counts every request it receives, waits `delay`, then
/// answers with `status`. Returns its bound address and a shared hit counter.
async fn spawn_backend(status: u16, delay: Duration) -> (SocketAddr, Arc<AtomicUsize>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let hits = Arc::new(AtomicUsize::new(0));
	let hits_for_task = hits.clone();
	tokio::spawn(async move {
		loop {
			let (stream, _) = match listener.accept().await {
				Ok(pair) => pair,
				Err(_) => break,
			};
			let hits = hits_for_task.clone();
			tokio::spawn(async move {
				let io = TokioIo::new(stream);
				let svc = hyper::service::service_fn(move |_req: Request<hyper::body::Incoming>| {
					let hits = hits.clone();
					async move {
						hits.fetch_add(1, Ordering::SeqCst);
						if !delay.is_zero() {
							tokio::time::sleep(delay).await;
						}
						let resp = http::Response::builder()
							.status(StatusCode::from_u16(status).unwrap())
							.body(Full::new(Bytes::from_static(b"ok")))
							.unwrap();
						Ok::<_, std::convert::Infallible>(resp)
					}
				});
				let _ = auto_server().serve_connection_with_upgrades(io, svc).await;
			});
		}
	});
	(addr, hits)
}

fn req(method: Method, path: &str, headers: &[(&str, &str)]) -> Request<Bytes> {
	let mut builder = Request::builder().method(method).uri(path);
	for (k, v) in headers {
		builder = builder.header(*k, *v);
	}
	builder.body(Bytes::new()).unwrap()
}

async fn serve(snapshot: &StateSnapshot, route_id: &str, request: Request<Bytes>) -> http::Response<gateway::client::ProxyBody> {
	let mut ctx = RequestContext {
		snapshot,
		client_addr: "127.0.0.1".parse().unwrap(),
		varctx: VarCtx {
			request_id: "test".to_string(),
			..Default::default()
		},
	};
	pipeline::handle(&mut ctx, route_id, request).await
}

#[tokio::test]
async fn coalesce_concurrent_identical_requests_hit_backend_once() {
	let (addr, hits) = spawn_backend(200, Duration::from_millis(50)).await;
	let yaml = format!(
		r#"
routes:
  - id: r1
    path: {{ kind: exact, value: /r1 }}
    backends:
      - url: "http://{addr}"
    coalesce:
      enabled: true
      methods: ["GET"]
      timeout: 2s
"#
	);
	let reloader = Reloader::bootstrap(&ConfigSource::Inline(yaml), Arc::new(StaticRegistry::new(vec![])))
		.await
		.unwrap();
	let snapshot = reloader.current();

	let calls = (0..5).map(|_| serve(&snapshot, "r1", req(Method::GET, "/r1", &[])));
	let responses = join_all(calls).await;

	assert!(responses.into_iter().all(|r| r.status() == StatusCode::OK));
	assert_eq!(hits.load(Ordering::SeqCst), 1, "all concurrent identical requests should coalesce onto one backend call");
}

#[tokio::test]
async fn coalesce_followers_receive_the_leaders_actual_body() {
	let (addr, hits) = spawn_backend(200, Duration::from_millis(50)).await;
	let yaml = format!(
		r#"
routes:
  - id: r1
    path: {{ kind: exact, value: /r1 }}
    backends:
      - url: "http://{addr}"
    coalesce:
      enabled: true
      methods: ["GET"]
      timeout: 2s
"#
	);
	let reloader = Reloader::bootstrap(&ConfigSource::Inline(yaml), Arc::new(StaticRegistry::new(vec![])))
		.await
		.unwrap();
	let snapshot = reloader.current();

	let calls = (0..5).map(|_| serve(&snapshot, "r1", req(Method::GET, "/r1", &[])));
	let responses = join_all(calls).await;

	let mut saw_coalesced = false;
	for resp in responses {
		let coalesced = resp.headers().get("x-coalesced").is_some();
		saw_coalesced |= coalesced;
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(body.as_ref(), b"ok", "every caller, leader or follower, must see the real backend body");
	}
	assert!(saw_coalesced, "at least one of the five calls should have been served as a coalesce follower");
	assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mirror_sends_a_real_copy_to_the_mirror_backend() {
	let (addr, hits) = spawn_backend(200, Duration::ZERO).await;
	let (mirror_addr, mirror_hits) = spawn_backend(200, Duration::ZERO).await;
	let yaml = format!(
		r#"
routes:
  - id: r1
    path: {{ kind: exact, value: /r1 }}
    backends:
      - url: "http://{addr}"
    mirror:
      enabled: true
      backendUrl: "http://{mirror_addr}"
      percentage: 100.0
"#
	);
	let reloader = Reloader::bootstrap(&ConfigSource::Inline(yaml), Arc::new(StaticRegistry::new(vec![])))
		.await
		.unwrap();
	let snapshot = reloader.current();

	let resp = serve(&snapshot, "r1", req(Method::GET, "/r1", &[])).await;
	assert_eq!(resp.status(), StatusCode::OK);

	// The mirror copy is fire-and-forget; give its spawned task a moment to land.
	for _ in 0..50 {
		if mirror_hits.load(Ordering::SeqCst) > 0 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert_eq!(hits.load(Ordering::SeqCst), 1);
	assert_eq!(mirror_hits.load(Ordering::SeqCst), 1, "mirror backend should have received its own copy of the request");
}

#[tokio::test]
async fn coalesce_distinguishes_by_vary_header() {
	let (addr, hits) = spawn_backend(200, Duration::from_millis(50)).await;
	let yaml = format!(
		r#"
routes:
  - id: r1
    path: {{ kind: exact, value: /r1 }}
    backends:
      - url: "http://{addr}"
    coalesce:
      enabled: true
      methods: ["GET"]
      varyHeaders: ["x-key"]
      timeout: 2s
"#
	);
	let reloader = Reloader::bootstrap(&ConfigSource::Inline(yaml), Arc::new(StaticRegistry::new(vec![])))
		.await
		.unwrap();
	let snapshot = reloader.current();

	let a = serve(&snapshot, "r1", req(Method::GET, "/r1", &[("x-key", "a")]));
	let b = serve(&snapshot, "r1", req(Method::GET, "/r1", &[("x-key", "b")]));
	let (ra, rb) = tokio::join!(a, b);

	assert_eq!(ra.status(), StatusCode::OK);
	assert_eq!(rb.status(), StatusCode::OK);
	assert_eq!(hits.load(Ordering::SeqCst), 2, "differing vary-header values must not share a coalesce group");
}

#[tokio::test]
async fn coalesce_follower_falls_through_once_wait_exceeds_timeout() {
	let (addr, hits) = spawn_backend(200, Duration::from_millis(150)).await;
	let yaml = format!(
		r#"
routes:
  - id: r1
    path: {{ kind: exact, value: /r1 }}
    backends:
      - url: "http://{addr}"
    coalesce:
      enabled: true
      methods: ["GET"]
      timeout: 20ms
"#
	);
	let reloader = Reloader::bootstrap(&ConfigSource::Inline(yaml), Arc::new(StaticRegistry::new(vec![])))
		.await
		.unwrap();
	let snapshot = reloader.current();

	let leader = serve(&snapshot, "r1", req(Method::GET, "/r1", &[]));
	let follower = serve(&snapshot, "r1", req(Method::GET, "/r1", &[]));
	let (leader_resp, follower_resp) = tokio::join!(leader, follower);

	assert_eq!(leader_resp.status(), StatusCode::OK);
	assert_eq!(follower_resp.status(), StatusCode::OK);
	assert_eq!(hits.load(Ordering::SeqCst), 2, "a follower whose wait exceeds the coalesce timeout must run its own call");
}

#[tokio::test]
async fn breaker_opens_after_failure_threshold_and_short_circuits_further_calls() {
	let (addr, hits) = spawn_backend(500, Duration::ZERO).await;
	let yaml = format!(
		r#"
routes:
  - id: r1
    path: {{ kind: exact, value: /r1 }}
    backends:
      - url: "http://{addr}"
    breaker:
      enabled: true
      window: 10s
      buckets: 10
      failureThreshold: 0.5
      minRequestsInWindow: 4
      openTimeout: 5s
      halfOpenMaxRequests: 1
"#
	);
	let reloader = Reloader::bootstrap(&ConfigSource::Inline(yaml), Arc::new(StaticRegistry::new(vec![])))
		.await
		.unwrap();
	let snapshot = reloader.current();

	for _ in 0..4 {
		let resp = serve(&snapshot, "r1", req(Method::GET, "/r1", &[])).await;
		assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
	}
	let hits_before_trip = hits.load(Ordering::SeqCst);
	assert_eq!(hits_before_trip, 4);

	let tripped = serve(&snapshot, "r1", req(Method::GET, "/r1", &[])).await;
	assert_eq!(tripped.status(), StatusCode::SERVICE_UNAVAILABLE);
	assert_eq!(
		hits.load(Ordering::SeqCst),
		hits_before_trip,
		"an open breaker must short-circuit without reaching the backend"
	);
}

#[tokio::test]
async fn reload_adds_and_removes_routes() {
	let (addr1, _hits1) = spawn_backend(200, Duration::ZERO).await;
	let (addr2, _hits2) = spawn_backend(200, Duration::ZERO).await;

	let initial = format!(
		r#"
routes:
  - id: r1
    path: {{ kind: exact, value: /r1 }}
    backends:
      - url: "http://{addr1}"
"#
	);
	let reloader = Reloader::bootstrap(&ConfigSource::Inline(initial), Arc::new(StaticRegistry::new(vec![])))
		.await
		.unwrap();
	assert!(reloader.current().routes.contains_key("r1"));

	let next = format!(
		r#"
routes:
  - id: r2
    path: {{ kind: exact, value: /r2 }}
    backends:
      - url: "http://{addr2}"
"#
	);
	reloader.reload(&ConfigSource::Inline(next)).await.unwrap();

	assert!(!reloader.current().routes.contains_key("r1"));
	assert!(reloader.current().routes.contains_key("r2"));

	let resp = serve(&reloader.current(), "r2", req(Method::GET, "/r2", &[])).await;
	assert_eq!(resp.status(), StatusCode::OK);

	let history = reloader.history();
	let last = history.last().unwrap();
	assert_eq!(last.changes, vec!["route added: r2".to_string(), "route removed: r1".to_string()]);
}

#[tokio::test]
async fn reload_does_not_disrupt_an_unchanged_route_sharing_an_upstream() {
	let (addr, hits) = spawn_backend(200, Duration::ZERO).await;
	let config = |route_count: usize| {
		let mut routes = String::new();
		for i in 0..route_count {
			routes.push_str(&format!(
				"  - id: r{i}\n    path: {{ kind: exact, value: /r{i} }}\n    upstream: shared\n"
			));
		}
		format!(
			"upstreams:\n  - name: shared\n    backends:\n      - url: \"http://{addr}\"\nroutes:\n{routes}"
		)
	};

	let reloader = Reloader::bootstrap(&ConfigSource::Inline(config(1)), Arc::new(StaticRegistry::new(vec![])))
		.await
		.unwrap();
	let before = serve(&reloader.current(), "r0", req(Method::GET, "/r0", &[])).await;
	assert_eq!(before.status(), StatusCode::OK);

	reloader.reload(&ConfigSource::Inline(config(2))).await.unwrap();

	let still_there = serve(&reloader.current(), "r0", req(Method::GET, "/r0", &[])).await;
	assert_eq!(still_there.status(), StatusCode::OK, "r0 must keep serving against the shared upstream after reload");
	let new_route = serve(&reloader.current(), "r1", req(Method::GET, "/r1", &[])).await;
	assert_eq!(new_route.status(), StatusCode::OK, "r1 added by the reload shares the same upstream and must resolve too");

	assert_eq!(hits.load(Ordering::SeqCst), 3);
}
