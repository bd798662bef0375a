//! Request validation feature: Pipeline Composer step 15 (body-size limit check happens earlier,
//! at step 12, directly against `Content-Length` before buffering; `required_headers` is checked
//! here). Grounded in the teacher's coarse request-shape checks in `http::validation`-style guards
//! that reject before the request reaches the backend.

use dashmap::DashMap;
use http::HeaderMap;

use crate::error::ProxyError;
use crate::features::Feature;
use crate::types::{RouteConfig, RouteId, ValidationConfig};

#[derive(Clone, Default)]
struct Compiled {
	max_body_bytes: Option<usize>,
	required_headers: Vec<String>,
}

#[derive(Default)]
pub struct ValidationFeature {
	per_route: DashMap<RouteId, Compiled>,
}

impl ValidationFeature {
	pub fn new() -> ValidationFeature {
		ValidationFeature::default()
	}

	/// Checked against the declared `Content-Length` before the body is buffered (step 12). A
	/// chunked request with no declared length is let through here; the body-reading path is
	/// responsible for enforcing the same limit as it streams.
	pub fn check_content_length(&self, route_id: &str, content_length: Option<u64>) -> Result<(), ProxyError> {
		let Some(c) = self.per_route.get(route_id) else {
			return Ok(());
		};
		if let (Some(max), Some(len)) = (c.max_body_bytes, content_length) {
			if len > max as u64 {
				return Err(ProxyError::BodyTooLarge);
			}
		}
		Ok(())
	}

	pub fn check_headers(&self, route_id: &str, headers: &HeaderMap) -> Result<(), ProxyError> {
		let Some(c) = self.per_route.get(route_id) else {
			return Ok(());
		};
		for required in &c.required_headers {
			if !headers.contains_key(required.as_str()) {
				return Err(ProxyError::ValidationFailed(format!("missing required header {required}")));
			}
		}
		Ok(())
	}
}

impl Feature for ValidationFeature {
	fn name(&self) -> &'static str {
		"validation"
	}

	fn setup(&self, route: &RouteConfig) -> Result<(), ProxyError> {
		if !route.validation.enabled {
			self.per_route.remove(&route.id);
			return Ok(());
		}
		self.per_route.insert(route.id.clone(), compile(&route.validation));
		Ok(())
	}

	fn route_ids(&self) -> Vec<RouteId> {
		self.per_route.iter().map(|e| e.key().clone()).collect()
	}

	fn as_any(&self) -> &dyn std::any::Any {
		self
	}
}

fn compile(cfg: &ValidationConfig) -> Compiled {
	Compiled {
		max_body_bytes: cfg.max_body_bytes,
		required_headers: cfg.required_headers.clone(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn route_with_validation() -> RouteConfig {
		let mut r = crate::config::test_support::minimal_route("r1");
		r.validation = ValidationConfig {
			enabled: true,
			max_body_bytes: Some(1024),
			required_headers: vec!["x-request-id".to_string()],
		};
		r
	}

	#[test]
	fn oversize_body_rejected() {
		let f = ValidationFeature::new();
		f.setup(&route_with_validation()).unwrap();
		assert!(matches!(
			f.check_content_length("r1", Some(2048)),
			Err(ProxyError::BodyTooLarge)
		));
		assert!(f.check_content_length("r1", Some(512)).is_ok());
	}

	#[test]
	fn missing_required_header_rejected() {
		let f = ValidationFeature::new();
		f.setup(&route_with_validation()).unwrap();
		assert!(f.check_headers("r1", &HeaderMap::new()).is_err());
		let mut headers = HeaderMap::new();
		headers.insert("x-request-id", "abc".parse().unwrap());
		assert!(f.check_headers("r1", &headers).is_ok());
	}

	#[test]
	fn disabled_route_always_passes() {
		let f = ValidationFeature::new();
		assert!(f.check_content_length("unconfigured", Some(u64::MAX)).is_ok());
		assert!(f.check_headers("unconfigured", &HeaderMap::new()).is_ok());
	}
}
