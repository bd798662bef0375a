//! Per-request access log. Grounded in the teacher's `RequestLog`-style struct logged once at the
//! end of a request via `tracing`, rather than a bespoke line-oriented writer.

use std::time::Duration;

use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct RequestLog {
	pub request_id: String,
	pub route_id: Option<String>,
	pub method: String,
	pub path: String,
	pub status: u16,
	pub duration: Duration,
	pub client_addr: String,
	pub upstream: Option<String>,
	pub cache_status: Option<&'static str>,
	pub error_kind: Option<&'static str>,
}

impl RequestLog {
	/// Emits one structured `tracing` event per request (spec's ambient access-log requirement;
	/// the teacher's equivalent is a single `info!` call carrying every field as a key).
	pub fn emit(&self) {
		info!(
			request_id = %self.request_id,
			route_id = self.route_id.as_deref().unwrap_or("-"),
			method = %self.method,
			path = %self.path,
			status = self.status,
			duration_ms = self.duration.as_millis() as u64,
			client_addr = %self.client_addr,
			upstream = self.upstream.as_deref().unwrap_or("-"),
			cache_status = self.cache_status.unwrap_or("-"),
			error_kind = self.error_kind.unwrap_or("-"),
			"request"
		);
	}
}
