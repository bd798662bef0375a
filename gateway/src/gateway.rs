//! Listener accept loop. Grounded in the teacher's `proxy::gateway::Gateway` (one task per bind
//! address, `hyper_util::server::conn::auto` for HTTP/1+2 multiplexing, connections wrapped in
//! `gwcore::drain::Watch::wrap_connection` for graceful shutdown). TLS/HBONE termination is out of
//! scope here — the spec treats the gateway as agnostic to what terminates the connection in front
//! of it, so every listener in this repository speaks plaintext HTTP.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use gwcore::drain::DrainWatcher;
use http::Request;
use http_body_util::BodyExt;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::client::ProxyBody;
use crate::pipeline::{self, RequestContext};
use crate::reload::Reloader;
use crate::router::MatchedRoute;
use crate::telemetry::log::RequestLog;
use crate::varctx::VarCtxPool;

pub fn auto_server() -> auto::Builder<TokioExecutor> {
	let mut b = auto::Builder::new(TokioExecutor::new());
	b.http2().timer(hyper_util::rt::TokioTimer::new());
	b
}

pub struct Gateway {
	reloader: Arc<Reloader>,
	varctx_pool: Arc<VarCtxPool>,
	drain: DrainWatcher,
}

impl Gateway {
	pub fn new(reloader: Arc<Reloader>, drain: DrainWatcher) -> Gateway {
		Gateway {
			reloader,
			varctx_pool: Arc::new(VarCtxPool::new()),
			drain,
		}
	}

	/// Runs one accept loop per configured listener address until the process-wide drain fires.
	pub async fn run(self, addresses: Vec<SocketAddr>) -> anyhow::Result<()> {
		let mut tasks = tokio::task::JoinSet::new();
		for addr in addresses {
			let reloader = self.reloader.clone();
			let varctx_pool = self.varctx_pool.clone();
			let drain = self.drain.clone();
			tasks.spawn(async move {
				if let Err(e) = run_listener(addr, reloader, varctx_pool, drain).await {
					warn!(%addr, err = %e, "listener stopped");
				}
			});
		}
		while let Some(res) = tasks.join_next().await {
			if let Err(e) = res {
				warn!(err = %e, "listener task panicked");
			}
		}
		Ok(())
	}
}

async fn run_listener(
	addr: SocketAddr,
	reloader: Arc<Reloader>,
	varctx_pool: Arc<VarCtxPool>,
	drain: DrainWatcher,
) -> anyhow::Result<()> {
	let listener = TcpListener::bind(addr).await?;
	info!(%addr, "listening");
	let drain_watch = drain.clone();
	let (mut upgrader, weak) = drain.into_weak();
	let wait = drain_watch.wait_for_drain();
	tokio::pin!(wait);
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, peer) = match accepted {
					Ok(pair) => pair,
					Err(e) => { warn!(err = %e, "accept failed"); continue; },
				};
				let conn_drain = upgrader.upgrade(weak.clone());
				let reloader = reloader.clone();
				let varctx_pool = varctx_pool.clone();
				tokio::spawn(
					async move {
						let io = TokioIo::new(stream);
						let svc = hyper::service::service_fn(move |req| {
							serve_one(req, peer, reloader.clone(), varctx_pool.clone())
						});
						let serve = auto_server().serve_connection_with_upgrades(io, svc);
						let serve = conn_drain.wrap_connection(serve);
						if let Err(e) = serve.await {
							debug!(err = %e, "connection closed with error");
						}
					}
					.in_current_span(),
				);
			}
			_ = &mut wait => {
				upgrader.disable();
				info!(%addr, "listener draining");
				return Ok(());
			}
		}
	}
}

async fn serve_one(
	req: Request<hyper::body::Incoming>,
	peer: SocketAddr,
	reloader: Arc<Reloader>,
	varctx_pool: Arc<VarCtxPool>,
) -> Result<http::Response<ProxyBody>, Infallible> {
	let start = Instant::now();
	let request_id = uuid_like();
	let snapshot = reloader.current();

	let (parts, body) = req.into_parts();
	let body_bytes = match body.collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(_) => Bytes::new(),
	};

	let host = parts
		.headers
		.get(http::header::HOST)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.split(':').next().unwrap_or(s).to_string());
	let query: std::collections::HashMap<String, String> = parts
		.uri
		.query()
		.map(|q| {
			url_query_pairs(q)
				.into_iter()
				.collect::<std::collections::HashMap<_, _>>()
		})
		.unwrap_or_default();

	let matched = snapshot.router.route(host.as_deref(), parts.uri.path(), &parts.method, &parts.headers, &query);
	let method_str = parts.method.to_string();
	let path_str = parts.uri.path().to_string();

	let mut varctx = varctx_pool.acquire(request_id.clone());
	let route_id = matched.as_ref().map(|m: &MatchedRoute| m.route_id.clone());
	if let Some(m) = &matched {
		varctx.path_params = m.path_params.clone();
	}

	let span = info_span!("connection", %request_id, %peer);
	let response = async {
		match route_id {
			Some(route_id) => {
				let mut ctx = RequestContext {
					snapshot: &snapshot,
					client_addr: peer.ip(),
					varctx,
				};
				let req = Request::from_parts(parts, body_bytes);
				let resp = pipeline::handle(&mut ctx, &route_id, req).await;
				varctx_pool.release(ctx.varctx);
				resp
			},
			None => {
				varctx_pool.release(varctx);
				not_found()
			},
		}
	}
	.instrument(span)
	.await;

	RequestLog {
		request_id,
		route_id: matched.map(|m| m.route_id),
		method: method_str,
		path: path_str,
		status: response.status().as_u16(),
		duration: start.elapsed(),
		client_addr: peer.to_string(),
		upstream: None,
		cache_status: response
			.headers()
			.get("x-cache")
			.and_then(|v| v.to_str().ok())
			.map(|_| "present")
			.or(None),
		error_kind: None,
	}
	.emit();

	Ok(response)
}

fn not_found() -> http::Response<ProxyBody> {
	http::Response::builder()
		.status(http::StatusCode::NOT_FOUND)
		.body(http_body_util::Empty::new().map_err(Into::into).boxed())
		.unwrap()
}

fn url_query_pairs(q: &str) -> Vec<(String, String)> {
	q.split('&')
		.filter_map(|pair| {
			let mut it = pair.splitn(2, '=');
			let k = it.next()?;
			let v = it.next().unwrap_or("");
			Some((k.to_string(), v.to_string()))
		})
		.collect()
}

fn uuid_like() -> String {
	use std::sync::atomic::{AtomicU64, Ordering};
	static COUNTER: AtomicU64 = AtomicU64::new(0);
	let n = COUNTER.fetch_add(1, Ordering::Relaxed);
	format!("{:016x}-{:08x}", std::process::id(), n)
}
