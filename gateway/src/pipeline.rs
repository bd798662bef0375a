//! Pipeline Composer (C10): executes the fixed outer-to-inner middleware order for one route.
//! Grounded in the teacher's `proxy::httpproxy::proxy` request handler, which runs a similarly
//! fixed sequence (extract metadata, authn, rate limit, proxy, record outcome) as a flat function
//! rather than a generic middleware stack — this repository keeps that shape (one `handle` method,
//! explicit steps) instead of building a dynamic `Vec<Box<dyn Middleware>>`, since the step order is
//! fixed by spec rather than configurable per route.
//!
//! Steps whose concrete implementation is an out-of-scope external collaborator (WAF engines,
//! OpenAPI/GraphQL validators, ext-auth, mTLS, priority admission, rules engines, mock/static-file
//! short-circuits, response rewriting beyond header transforms) are represented as a fixed point in
//! the order where such a `Feature` would run, but no concrete middleware occupies them here — only
//! the features this repository actually implements (CORS, auth, rate limit, header transform,
//! coalesce, cache, breaker, mirror, traffic split) are wired in.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use rand::Rng;
use tracing::{Instrument, debug, info_span};

use crate::balancer::SelectionContext;
use crate::cache::RouteCache;
use crate::client::{ProxyBody, SharedTransportPool};
use crate::coalesce::{BufferedResponse, Coalescer, Outcome as CoalesceOutcome};
use crate::error::ProxyError;
use crate::features::FeatureRegistry;
use crate::snapshot::StateSnapshot;
use crate::varctx::VarCtx;

/// Request-shaped facts extracted once at the top of the pipeline and threaded through every step,
/// standing in for the teacher's per-request `RequestLog` plus this repository's `VarCtx` (§4.10
/// step 6).
pub struct RequestContext<'a> {
	pub snapshot: &'a StateSnapshot,
	pub client_addr: std::net::IpAddr,
	pub varctx: VarCtx,
}

/// Runs the whole composed pipeline for one already-routed request. `body` is the full request
/// body read up front (step 12's body-size check and the coalescer's fingerprint both need it
/// before any downstream call, so there is no benefit to streaming it further in this design).
pub async fn handle(
	ctx: &mut RequestContext<'_>,
	route_id: &str,
	req: Request<Bytes>,
) -> Response<ProxyBody> {
	let span = info_span!("request", request_id = %ctx.varctx.request_id, route_id);
	async {
		match run(ctx, route_id, req).await {
			Ok(resp) => resp,
			Err(e) => error_response(&e),
		}
	}
	.instrument(span)
	.await
}

async fn run(
	ctx: &mut RequestContext<'_>,
	route_id: &str,
	mut req: Request<Bytes>,
) -> Result<Response<ProxyBody>, ProxyError> {
	let entry = ctx.snapshot.route(route_id).ok_or(ProxyError::NotFound)?;
	let features = &ctx.snapshot.features;

	// Step 4: global + per-route IP filter.
	check_ip_filters(ctx)?;

	// Step 5: CORS (preflight short-circuit, else decorate later).
	let cors = feature::<crate::features::cors::CorsFeature>(features, "cors");
	let cors_outcome = cors.map(|c| c.apply(route_id, req.method(), req.headers()));
	if let Some(crate::features::cors::CorsOutcome::Preflight(resp)) = &cors_outcome {
		return Ok(resp.clone().map(|_| empty_body()));
	}

	// Step 6: varctx already carries route id; fill in path params from the router match.
	ctx.varctx.route_id = Some(route_id.to_string());

	// Step 12: body size limit.
	let validation = feature::<crate::features::validation::ValidationFeature>(features, "validation");
	if let Some(v) = validation {
		v.check_content_length(route_id, Some(req.body().len() as u64))?;
	}

	// Step 13: authentication.
	if let Some(auth) = feature::<crate::features::auth::AuthFeature>(features, "auth") {
		if let Some(claims) = auth.authenticate(route_id, req.headers())? {
			ctx.varctx.identity.subject = claims.sub;
			ctx.varctx.identity.claims = Arc::new(claims.extra);
		}
	}

	// Step 15: request validation (required headers; body-shape validators are out of scope).
	if let Some(v) = validation {
		v.check_headers(route_id, req.headers())?;
	}

	// Step 17: rate limit.
	if let Some(rl) = feature::<crate::features::ratelimit::RateLimitFeature>(features, "rate_limit") {
		rl.check(route_id)?;
	}

	// Step 19: request header transforms.
	if let Some(t) = feature::<crate::features::transform::TransformFeature>(features, "transform") {
		t.apply_request(route_id, req.headers_mut());
	}

	// Step 24: mirror — fire-and-forget copy, never affects the primary response.
	maybe_mirror(&entry.config.mirror, &req, &ctx.snapshot.transport);

	// Steps 21-25: coalesce -> cache -> breaker -> traffic split/versioning -> route proxy.
	let sel_ctx = SelectionContext {
		sticky_key: sticky_key(&entry.config, &req, ctx.client_addr),
		version: req
			.headers()
			.get("x-api-version")
			.and_then(|v| v.to_str().ok())
			.map(str::to_string),
	};

	let method = req.method().clone();
	let (parts, body) = req.into_parts();
	let path = parts.uri.path().to_string();
	let query = parts.uri.query().unwrap_or("").to_string();

	let mut response = serve_cached_or_coalesced(
		ctx.snapshot,
		entry,
		route_id,
		&method,
		&path,
		&query,
		Request::from_parts(parts, body),
		&sel_ctx,
	)
	.await?;

	// Response-phase wrappers (run between steps 18-24 per spec; applied here on the way out).
	if let Some(t) = feature::<crate::features::transform::TransformFeature>(features, "transform") {
		t.apply_response(route_id, response.headers_mut());
	}
	if let Some(outcome) = &cors_outcome {
		if let crate::features::cors::CorsOutcome::Decorate(headers) = outcome {
			for (name, value) in headers {
				response.headers_mut().insert(name.clone(), value.clone());
			}
		}
	}

	Ok(response)
}

#[allow(clippy::too_many_arguments)]
async fn serve_cached_or_coalesced(
	snapshot: &StateSnapshot,
	entry: &crate::snapshot::RouteEntry,
	route_id: &str,
	method: &Method,
	path: &str,
	query: &str,
	req: Request<Bytes>,
	sel_ctx: &SelectionContext,
) -> Result<Response<ProxyBody>, ProxyError> {
	let cache_cfg = &entry.config.cache;
	if let Some(cache) = &entry.cache {
		if RouteCache::should_cache_request(cache_cfg, method, req.headers()) {
			let key = RouteCache::key(method, path, query, &cache_cfg.vary_headers, req.headers());
			if let Some(hit) = cache.get(&key) {
				if hit.matches_conditional(req.headers()) {
					return Ok(Response::builder()
						.status(StatusCode::NOT_MODIFIED)
						.body(empty_body())
						.unwrap());
				}
				return Ok(Response::builder()
					.status(hit.status)
					.body(Full::new(hit.body).map_err(Into::into).boxed())
					.map(|mut r| {
						*r.headers_mut() = hit.headers;
						r.headers_mut().insert("x-cache", "HIT".parse().unwrap());
						r
					})
					.unwrap());
			}
		}
	}

	let coalesce_cfg = &entry.config.coalesce;
	if Coalescer::eligible(coalesce_cfg, method) {
		let fingerprint = format!(
			"{}|{}",
			route_id,
			Coalescer::fingerprint(method, path, query, &coalesce_cfg.vary_headers, req.headers())
		);
		match snapshot.coalescer.join(&fingerprint, coalesce_cfg).await {
			CoalesceOutcome::Leader(token) => {
				let result = run_breaker_and_proxy(entry, req, sel_ctx).await;
				let result = match result {
					Ok(resp) => {
						let (buffered, rebuilt) = buffer_for_sharing(resp, coalesce_cfg.max_body_bytes).await;
						snapshot.coalescer.publish(token, buffered);
						Ok(rebuilt)
					},
					Err(e) => {
						snapshot.coalescer.publish(token, None);
						Err(e)
					},
				};
				return finish(entry, cache_cfg, method, path, query, result, false).await;
			},
			CoalesceOutcome::Shared(buffered) => {
				let mut resp = Response::builder()
					.status(buffered.status)
					.body(Full::new(buffered.body).map_err(Into::into).boxed())
					.unwrap();
				*resp.headers_mut() = buffered.headers;
				resp.headers_mut().insert("x-coalesced", "true".parse().unwrap());
				return Ok(resp);
			},
			CoalesceOutcome::RunOwn => {},
		}
	}

	let result = run_breaker_and_proxy(entry, req, sel_ctx).await;
	finish(entry, cache_cfg, method, path, query, result, false).await
}

async fn run_breaker_and_proxy(
	entry: &crate::snapshot::RouteEntry,
	req: Request<Bytes>,
	sel_ctx: &SelectionContext,
) -> Result<Response<ProxyBody>, ProxyError> {
	entry.proxy.serve(req, sel_ctx).await
}

async fn finish(
	entry: &crate::snapshot::RouteEntry,
	cache_cfg: &crate::types::CacheConfig,
	method: &Method,
	path: &str,
	query: &str,
	result: Result<Response<ProxyBody>, ProxyError>,
	_already_shared: bool,
) -> Result<Response<ProxyBody>, ProxyError> {
	let resp = result?;
	let is_mutating = matches!(method, &Method::POST | &Method::PUT | &Method::DELETE | &Method::PATCH);
	if is_mutating && resp.status().is_success() {
		if let Some(cache) = &entry.cache {
			cache.invalidate_prefix(path);
		}
	}
	if let Some(cache) = &entry.cache {
		if !is_mutating
			&& RouteCache::should_cache_request(cache_cfg, method, resp.headers())
			&& RouteCache::should_store(cache_cfg, resp.status(), resp.headers(), 0)
		{
			let key = RouteCache::key(method, path, query, &cache_cfg.vary_headers, resp.headers());
			let status = resp.status();
			let headers = resp.headers().clone();
			let (parts, body) = resp.into_parts();
			let bytes = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
			if RouteCache::should_store(cache_cfg, status, &headers, bytes.len()) {
				cache.store(cache_cfg, key, status, headers.clone(), bytes.clone());
			}
			let mut rebuilt = Response::from_parts(parts, Full::new(bytes).map_err(Into::into).boxed());
			*rebuilt.headers_mut() = headers;
			return Ok(rebuilt);
		}
	}
	Ok(resp)
}

/// Consumes the leader's response body once and returns both a `BufferedResponse` for followers
/// to replay and a freshly rebuilt `Response` (same status/headers, body re-wrapped in a `Full`)
/// for the leader itself to return and for `finish` to cache. Bodies over `max_body_bytes` are
/// still buffered here (the leader already paid for reading the stream once `join` committed it
/// to the leader role) but not shared: followers that needed the body at that size fall through
/// to `RunOwn` once their wait exceeds the coalesce timeout, matching the "oversize responses are
/// not shared" allowance.
async fn buffer_for_sharing(resp: Response<ProxyBody>, max_body_bytes: usize) -> (Option<BufferedResponse>, Response<ProxyBody>) {
	let status = resp.status();
	let headers = resp.headers().clone();
	let (parts, body) = resp.into_parts();
	let bytes = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
	let rebuilt = Response::from_parts(parts, Full::new(bytes.clone()).map_err(Into::into).boxed());
	let buffered = (bytes.len() <= max_body_bytes).then(|| BufferedResponse {
		status,
		headers,
		body: bytes,
	});
	(buffered, rebuilt)
}

fn feature<T: 'static>(features: &FeatureRegistry, name: &str) -> Option<&T> {
	features
		.iter()
		.find(|f| f.name() == name)
		.and_then(|f| f.as_any().downcast_ref::<T>())
}

fn check_ip_filters(ctx: &RequestContext<'_>) -> Result<(), ProxyError> {
	let ip = ctx.client_addr.to_string();
	if !ctx.snapshot.global_ip_denylist.is_empty() && ctx.snapshot.global_ip_denylist.contains(&ip) {
		return Err(ProxyError::Forbidden("client ip denied".to_string()));
	}
	if !ctx.snapshot.global_ip_allowlist.is_empty() && !ctx.snapshot.global_ip_allowlist.contains(&ip) {
		return Err(ProxyError::Forbidden("client ip not allowed".to_string()));
	}
	Ok(())
}

fn sticky_key(cfg: &crate::types::RouteConfig, req: &Request<Bytes>, client_addr: std::net::IpAddr) -> Option<String> {
	if let Some(header) = &cfg.sticky.header {
		if let Some(v) = req.headers().get(header.as_str()).and_then(|v| v.to_str().ok()) {
			return Some(v.to_string());
		}
	}
	if cfg.sticky.use_client_ip {
		return Some(client_addr.to_string());
	}
	None
}

/// Fires a best-effort copy of the inbound request at `cfg.backend_url` without ever affecting the
/// primary response: the spawned task's result, success or failure, is only logged. Reuses the
/// route's transport pool's default client rather than opening a dedicated connection per mirrored
/// request.
fn maybe_mirror(cfg: &crate::types::MirrorConfig, req: &Request<Bytes>, transport: &SharedTransportPool) {
	if !cfg.enabled {
		return;
	}
	if rand::thread_rng().gen::<f64>() * 100.0 > cfg.percentage {
		return;
	}
	let backend_url = cfg.backend_url.trim_end_matches('/').to_string();
	let path_and_query = req
		.uri()
		.path_and_query()
		.map(|p| p.as_str().to_string())
		.unwrap_or_else(|| "/".to_string());
	let method = req.method().clone();
	let headers = req.headers().clone();
	let body = req.body().clone();
	let pool = transport.current();
	tokio::spawn(async move {
		let uri = match format!("{backend_url}{path_and_query}").parse::<http::Uri>() {
			Ok(uri) => uri,
			Err(e) => {
				debug!(err = %e, "mirror backend url did not parse, skipping");
				return;
			},
		};
		let mut builder = Request::builder().method(method).uri(uri);
		for (name, value) in &headers {
			builder = builder.header(name, value);
		}
		let mirrored = match builder.body(Full::new(body).map_err(Into::into).boxed()) {
			Ok(req) => req,
			Err(e) => {
				debug!(err = %e, "failed to build mirror request, skipping");
				return;
			},
		};
		if let Err(e) = pool.get(None).request(mirrored).await {
			debug!(err = %e, "mirror request failed");
		}
	});
}

fn empty_body() -> ProxyBody {
	http_body_util::Empty::<Bytes>::new().map_err(Into::into).boxed()
}

fn error_response(err: &ProxyError) -> Response<ProxyBody> {
	let body = serde_json::to_vec(&err.to_json_body()).unwrap_or_default();
	let mut resp = Response::builder()
		.status(err.status_code())
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(body)).map_err(Into::into).boxed())
		.unwrap();
	if let ProxyError::RateLimited { retry_after_secs } = err {
		resp
			.headers_mut()
			.insert(http::header::RETRY_AFTER, retry_after_secs.to_string().parse().unwrap());
	}
	resp
}
