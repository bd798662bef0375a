//! Header transform feature: Pipeline Composer steps 14 (request) and 19 (response). Grounded in
//! the teacher's `http::transformation::Transform`, which applies add/remove header lists on the
//! way in and out; body transforms are out of scope here (the route config only names headers).

use dashmap::DashMap;
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::error::ProxyError;
use crate::features::Feature;
use crate::types::{RouteConfig, RouteId, TransformConfig};

#[derive(Clone, Default)]
struct Compiled {
	add_request: Vec<(HeaderName, HeaderValue)>,
	remove_request: Vec<HeaderName>,
	add_response: Vec<(HeaderName, HeaderValue)>,
	remove_response: Vec<HeaderName>,
}

#[derive(Default)]
pub struct TransformFeature {
	per_route: DashMap<RouteId, Compiled>,
}

impl TransformFeature {
	pub fn new() -> TransformFeature {
		TransformFeature::default()
	}

	pub fn apply_request(&self, route_id: &str, headers: &mut HeaderMap) {
		let Some(c) = self.per_route.get(route_id) else {
			return;
		};
		for name in &c.remove_request {
			headers.remove(name);
		}
		for (name, value) in &c.add_request {
			headers.insert(name.clone(), value.clone());
		}
	}

	pub fn apply_response(&self, route_id: &str, headers: &mut HeaderMap) {
		let Some(c) = self.per_route.get(route_id) else {
			return;
		};
		for name in &c.remove_response {
			headers.remove(name);
		}
		for (name, value) in &c.add_response {
			headers.insert(name.clone(), value.clone());
		}
	}
}

impl Feature for TransformFeature {
	fn name(&self) -> &'static str {
		"transform"
	}

	fn setup(&self, route: &RouteConfig) -> Result<(), ProxyError> {
		let t = &route.transform;
		if t.add_request_headers.is_empty()
			&& t.remove_request_headers.is_empty()
			&& t.add_response_headers.is_empty()
			&& t.remove_response_headers.is_empty()
		{
			self.per_route.remove(&route.id);
			return Ok(());
		}
		self.per_route.insert(route.id.clone(), compile(t)?);
		Ok(())
	}

	fn route_ids(&self) -> Vec<RouteId> {
		self.per_route.iter().map(|e| e.key().clone()).collect()
	}

	fn as_any(&self) -> &dyn std::any::Any {
		self
	}
}

fn compile(cfg: &TransformConfig) -> Result<Compiled, ProxyError> {
	let header_pair = |k: &str, v: &str| -> Result<(HeaderName, HeaderValue), ProxyError> {
		let name = HeaderName::try_from(k)
			.map_err(|e| ProxyError::ConfigError(format!("invalid header name {k}: {e}")))?;
		let value = HeaderValue::try_from(v)
			.map_err(|e| ProxyError::ConfigError(format!("invalid header value for {k}: {e}")))?;
		Ok((name, value))
	};
	let header_name = |k: &str| -> Result<HeaderName, ProxyError> {
		HeaderName::try_from(k).map_err(|e| ProxyError::ConfigError(format!("invalid header name {k}: {e}")))
	};

	let mut add_request = Vec::with_capacity(cfg.add_request_headers.len());
	for (k, v) in &cfg.add_request_headers {
		add_request.push(header_pair(k, v)?);
	}
	let mut add_response = Vec::with_capacity(cfg.add_response_headers.len());
	for (k, v) in &cfg.add_response_headers {
		add_response.push(header_pair(k, v)?);
	}
	let mut remove_request = Vec::with_capacity(cfg.remove_request_headers.len());
	for k in &cfg.remove_request_headers {
		remove_request.push(header_name(k)?);
	}
	let mut remove_response = Vec::with_capacity(cfg.remove_response_headers.len());
	for k in &cfg.remove_response_headers {
		remove_response.push(header_name(k)?);
	}

	Ok(Compiled {
		add_request,
		remove_request,
		add_response,
		remove_response,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn route_with_transform() -> RouteConfig {
		let mut r = crate::config::test_support::minimal_route("r1");
		r.transform = TransformConfig {
			add_request_headers: HashMap::from([("x-gw-route".to_string(), "r1".to_string())]),
			remove_request_headers: vec!["x-drop-me".to_string()],
			add_response_headers: HashMap::from([("x-served-by".to_string(), "gw".to_string())]),
			remove_response_headers: vec![],
		};
		r
	}

	#[test]
	fn request_headers_added_and_removed() {
		let f = TransformFeature::new();
		f.setup(&route_with_transform()).unwrap();
		let mut headers = HeaderMap::new();
		headers.insert("x-drop-me", "1".parse().unwrap());
		f.apply_request("r1", &mut headers);
		assert!(!headers.contains_key("x-drop-me"));
		assert_eq!(headers.get("x-gw-route").unwrap(), "r1");
	}

	#[test]
	fn response_headers_added() {
		let f = TransformFeature::new();
		f.setup(&route_with_transform()).unwrap();
		let mut headers = HeaderMap::new();
		f.apply_response("r1", &mut headers);
		assert_eq!(headers.get("x-served-by").unwrap(), "gw");
	}

	#[test]
	fn unconfigured_route_is_noop() {
		let f = TransformFeature::new();
		let mut headers = HeaderMap::new();
		headers.insert("x-keep", "1".parse().unwrap());
		f.apply_request("missing", &mut headers);
		assert_eq!(headers.len(), 1);
	}
}
