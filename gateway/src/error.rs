//! The error taxonomy from spec §7, collapsed into a single enum the way the teacher collapses
//! its proxy-level failures into `proxy::ProxyError`. Every variant knows its HTTP status and
//! serializes to the standard `{error, message, details?}` body at the boundary (Pipeline Composer
//! step 1, Recovery).

use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
	#[error("no route matched")]
	NotFound,
	#[error("unauthorized: {0}")]
	Unauthorized(String),
	#[error("forbidden: {0}")]
	Forbidden(String),
	#[error("request body too large")]
	BodyTooLarge,
	#[error("validation failed: {0}")]
	ValidationFailed(String),
	#[error("rate limit exceeded")]
	RateLimited { retry_after_secs: u64 },
	#[error("quota exceeded")]
	QuotaExceeded,
	#[error("circuit breaker open")]
	BreakerOpen,
	#[error("no healthy backend")]
	NoHealthyBackend,
	#[error("backend error: {0}")]
	BackendError(String),
	#[error("request timed out")]
	Timeout,
	#[error("request cancelled")]
	Cancelled,
	#[error("internal error: {0}")]
	Internal(String),
	#[error("config error: {0}")]
	ConfigError(String),
}

#[derive(Serialize)]
struct ErrorBody {
	error: &'static str,
	message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	details: Option<serde_json::Value>,
}

impl ProxyError {
	pub fn kind(&self) -> &'static str {
		match self {
			ProxyError::NotFound => "not_found",
			ProxyError::Unauthorized(_) => "unauthorized",
			ProxyError::Forbidden(_) => "forbidden",
			ProxyError::BodyTooLarge => "body_too_large",
			ProxyError::ValidationFailed(_) => "validation_failed",
			ProxyError::RateLimited { .. } => "rate_limited",
			ProxyError::QuotaExceeded => "quota_exceeded",
			ProxyError::BreakerOpen => "breaker_open",
			ProxyError::NoHealthyBackend => "no_healthy_backend",
			ProxyError::BackendError(_) => "backend_error",
			ProxyError::Timeout => "timeout",
			ProxyError::Cancelled => "cancelled",
			ProxyError::Internal(_) => "internal_error",
			ProxyError::ConfigError(_) => "config_error",
		}
	}

	pub fn status_code(&self) -> StatusCode {
		match self {
			ProxyError::NotFound => StatusCode::NOT_FOUND,
			ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
			ProxyError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
			ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			ProxyError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
			ProxyError::BreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::NoHealthyBackend => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::BackendError(_) => StatusCode::BAD_GATEWAY,
			ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::Cancelled => StatusCode::from_u16(499).unwrap(),
			ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Is this a breaker failure outcome per spec §4.7 ("transport error, 5xx status")?
	pub fn counts_as_breaker_failure(&self) -> bool {
		matches!(
			self,
			ProxyError::BackendError(_) | ProxyError::Timeout | ProxyError::NoHealthyBackend
		)
	}

	pub fn to_json_body(&self) -> serde_json::Value {
		let body = ErrorBody {
			error: self.kind(),
			message: self.to_string(),
			details: None,
		};
		serde_json::to_value(body).unwrap_or(serde_json::Value::Null)
	}
}
