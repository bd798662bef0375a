//! CORS feature: Pipeline Composer step 5 (preflight short-circuit, else decorate response
//! headers). Grounded in the teacher's `RouteFilter::CORS` which returns either a direct response
//! (preflight) or a header map to merge into the outgoing response.

use dashmap::DashMap;
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode, header};

use crate::error::ProxyError;
use crate::features::Feature;
use crate::types::{CorsConfig, RouteConfig, RouteId};

#[derive(Clone)]
struct Compiled {
	allowed_origins: Vec<String>,
	allowed_methods: String,
	allowed_headers: String,
	allow_credentials: bool,
}

#[derive(Default)]
pub struct CorsFeature {
	per_route: DashMap<RouteId, Compiled>,
}

pub enum CorsOutcome {
	/// Not a CORS request, or CORS disabled for this route: proceed normally.
	Passthrough,
	/// A preflight `OPTIONS` request: short-circuit with this response.
	Preflight(Response<()>),
	/// A regular cross-origin request: merge these headers into the eventual response.
	Decorate(HeaderMap),
}

impl CorsFeature {
	pub fn new() -> CorsFeature {
		CorsFeature::default()
	}

	pub fn apply(&self, route_id: &str, method: &Method, headers: &HeaderMap) -> CorsOutcome {
		let Some(cfg) = self.per_route.get(route_id) else {
			return CorsOutcome::Passthrough;
		};
		let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
			return CorsOutcome::Passthrough;
		};
		if !cfg.allowed_origins.iter().any(|o| o == "*" || o == origin) {
			return CorsOutcome::Passthrough;
		}

		let mut out = HeaderMap::new();
		out.insert(
			header::ACCESS_CONTROL_ALLOW_ORIGIN,
			HeaderValue::from_str(origin).unwrap_or(HeaderValue::from_static("*")),
		);
		if cfg.allow_credentials {
			out.insert(
				header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
				HeaderValue::from_static("true"),
			);
		}

		if method == Method::OPTIONS && headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD) {
			out.insert(
				header::ACCESS_CONTROL_ALLOW_METHODS,
				HeaderValue::from_str(&cfg.allowed_methods).unwrap(),
			);
			out.insert(
				header::ACCESS_CONTROL_ALLOW_HEADERS,
				HeaderValue::from_str(&cfg.allowed_headers).unwrap(),
			);
			let mut resp = Response::builder().status(StatusCode::NO_CONTENT).body(()).unwrap();
			*resp.headers_mut() = out;
			return CorsOutcome::Preflight(resp);
		}
		CorsOutcome::Decorate(out)
	}
}

impl Feature for CorsFeature {
	fn name(&self) -> &'static str {
		"cors"
	}

	fn setup(&self, route: &RouteConfig) -> Result<(), ProxyError> {
		if !route.cors.enabled {
			self.per_route.remove(&route.id);
			return Ok(());
		}
		self.per_route.insert(route.id.clone(), compile(&route.cors));
		Ok(())
	}

	fn route_ids(&self) -> Vec<RouteId> {
		self.per_route.iter().map(|e| e.key().clone()).collect()
	}

	fn as_any(&self) -> &dyn std::any::Any {
		self
	}
}

fn compile(cfg: &CorsConfig) -> Compiled {
	Compiled {
		allowed_origins: cfg.allowed_origins.clone(),
		allowed_methods: cfg.allowed_methods.join(", "),
		allowed_headers: cfg.allowed_headers.join(", "),
		allow_credentials: cfg.allow_credentials,
	}
}
