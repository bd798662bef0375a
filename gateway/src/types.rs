//! The route-scoped data model (spec §3). Every type here is immutable once a `StateSnapshot` is
//! built; the only permitted post-build mutation is `Balancer::update_backends` driven by the
//! Registry Watcher (C13).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type RouteId = String;
pub type UpstreamName = String;
pub type ListenerId = String;

/// One upstream endpoint. `healthy` is flipped by the Health Checker (C3) and read by the
/// Balancer (C2); it is the one field on `Backend` that changes after construction, so it's an
/// atomic rather than requiring the whole `Backend` to be rebuilt.
#[derive(Debug)]
pub struct Backend {
	pub url: String,
	pub addr: SocketAddr,
	pub weight: u32,
	healthy: AtomicBool,
}

impl Backend {
	pub fn new(url: String, addr: SocketAddr, weight: u32) -> Self {
		assert!(weight >= 1, "backend weight must be >= 1");
		Backend {
			url,
			addr,
			weight,
			healthy: AtomicBool::new(true),
		}
	}

	pub fn is_healthy(&self) -> bool {
		self.healthy.load(Ordering::Relaxed)
	}

	pub fn set_healthy(&self, healthy: bool) {
		self.healthy.store(healthy, Ordering::Relaxed);
	}
}

impl Clone for Backend {
	fn clone(&self) -> Self {
		Backend {
			url: self.url.clone(),
			addr: self.addr,
			weight: self.weight,
			healthy: AtomicBool::new(self.is_healthy()),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
	pub url: String,
	#[serde(default = "default_weight")]
	pub weight: u32,
	#[serde(default)]
	pub health_check: Option<HealthCheckConfig>,
}

fn default_weight() -> u32 {
	1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
	#[serde(with = "humantime_serde", default = "default_hc_interval")]
	pub interval: Duration,
	#[serde(with = "humantime_serde", default = "default_hc_timeout")]
	pub timeout: Duration,
	#[serde(default = "default_hc_path")]
	pub path: String,
	#[serde(default = "default_hc_threshold")]
	pub healthy_threshold: u32,
	#[serde(default = "default_hc_threshold")]
	pub unhealthy_threshold: u32,
	#[serde(default = "default_hc_expected_status")]
	pub expected_status: (u16, u16),
}

fn default_hc_interval() -> Duration {
	Duration::from_secs(10)
}
fn default_hc_timeout() -> Duration {
	Duration::from_secs(2)
}
fn default_hc_path() -> String {
	"/healthz".to_string()
}
fn default_hc_threshold() -> u32 {
	2
}
fn default_hc_expected_status() -> (u16, u16) {
	(200, 399)
}

impl Default for HealthCheckConfig {
	fn default() -> Self {
		HealthCheckConfig {
			interval: default_hc_interval(),
			timeout: default_hc_timeout(),
			path: default_hc_path(),
			healthy_threshold: default_hc_threshold(),
			unhealthy_threshold: default_hc_threshold(),
			expected_status: default_hc_expected_status(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
	pub name: UpstreamName,
	pub backends: Vec<BackendConfig>,
	#[serde(default)]
	pub health_check: Option<HealthCheckConfig>,
	#[serde(default)]
	pub transport: TransportConfig,
	/// If set, backends are (re)discovered from this DNS name on an interval instead of the
	/// static `backends` list (Registry Watcher, C13).
	#[serde(default)]
	pub discovery: Option<DiscoveryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
	pub dns_name: String,
	pub port: u16,
	#[serde(with = "humantime_serde", default = "default_discovery_interval")]
	pub refresh_interval: Duration,
}

fn default_discovery_interval() -> Duration {
	Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
	#[serde(with = "humantime_serde", default = "default_dial_timeout")]
	pub dial_timeout: Duration,
	#[serde(with = "humantime_serde", default = "default_resp_header_timeout")]
	pub response_header_timeout: Duration,
	#[serde(default = "default_max_idle")]
	pub max_idle_per_host: usize,
	#[serde(default = "default_max_conns")]
	pub max_conns_per_host: usize,
}

fn default_dial_timeout() -> Duration {
	Duration::from_secs(5)
}
fn default_resp_header_timeout() -> Duration {
	Duration::from_secs(30)
}
fn default_max_idle() -> usize {
	32
}
fn default_max_conns() -> usize {
	256
}

impl Default for TransportConfig {
	fn default() -> Self {
		TransportConfig {
			dial_timeout: default_dial_timeout(),
			response_header_timeout: default_resp_header_timeout(),
			max_idle_per_host: default_max_idle(),
			max_conns_per_host: default_max_conns(),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum LbPolicy {
	RoundRobin,
	LeastConn,
	Weighted { sticky: bool },
	Versioned,
}

impl Default for LbPolicy {
	fn default() -> Self {
		LbPolicy::RoundRobin
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickyConfig {
	#[serde(default)]
	pub header: Option<String>,
	#[serde(default)]
	pub cookie: Option<String>,
	#[serde(default)]
	pub use_client_ip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
	#[serde(default = "default_attempts")]
	pub attempts: u8,
	#[serde(with = "humantime_serde", default)]
	pub backoff: Option<Duration>,
	#[serde(default = "default_retry_codes")]
	pub retry_on_status: Vec<u16>,
	#[serde(default = "default_true")]
	pub retry_on_connect_error: bool,
	#[serde(with = "humantime_serde", default = "default_per_try_timeout")]
	pub per_try_timeout: Duration,
}

fn default_attempts() -> u8 {
	1
}
fn default_retry_codes() -> Vec<u16> {
	vec![502, 503, 504]
}
fn default_true() -> bool {
	true
}
fn default_per_try_timeout() -> Duration {
	Duration::from_secs(15)
}

impl Default for RetryPolicy {
	fn default() -> Self {
		RetryPolicy {
			attempts: default_attempts(),
			backoff: None,
			retry_on_status: default_retry_codes(),
			retry_on_connect_error: true,
			per_try_timeout: default_per_try_timeout(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutPolicy {
	#[serde(with = "humantime_serde", default = "default_request_timeout")]
	pub request_timeout: Duration,
}

fn default_request_timeout() -> Duration {
	Duration::from_secs(30)
}

impl Default for TimeoutPolicy {
	fn default() -> Self {
		TimeoutPolicy {
			request_timeout: default_request_timeout(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerConfig {
	pub enabled: bool,
	#[serde(default = "default_window")]
	pub window: Duration,
	#[serde(default = "default_buckets")]
	pub buckets: usize,
	#[serde(default = "default_failure_threshold")]
	pub failure_threshold: f64,
	#[serde(default = "default_min_requests")]
	pub min_requests_in_window: u32,
	#[serde(with = "humantime_serde", default = "default_open_timeout")]
	pub open_timeout: Duration,
	#[serde(default = "default_half_open_max")]
	pub half_open_max_requests: u32,
}

fn default_window() -> Duration {
	Duration::from_secs(10)
}
fn default_buckets() -> usize {
	10
}
fn default_failure_threshold() -> f64 {
	0.5
}
fn default_min_requests() -> u32 {
	10
}
fn default_open_timeout() -> Duration {
	Duration::from_secs(30)
}
fn default_half_open_max() -> u32 {
	1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoalesceConfig {
	pub enabled: bool,
	#[serde(default = "default_coalesce_methods")]
	pub methods: Vec<String>,
	#[serde(default)]
	pub vary_headers: Vec<String>,
	#[serde(with = "humantime_serde", default = "default_coalesce_timeout")]
	pub timeout: Duration,
	#[serde(default = "default_coalesce_max_body")]
	pub max_body_bytes: usize,
}

fn default_coalesce_methods() -> Vec<String> {
	vec!["GET".to_string(), "HEAD".to_string()]
}
fn default_coalesce_timeout() -> Duration {
	Duration::from_secs(30)
}
fn default_coalesce_max_body() -> usize {
	2 * 1024 * 1024
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
	pub enabled: bool,
	#[serde(default = "default_cache_methods")]
	pub methods: Vec<String>,
	#[serde(with = "humantime_serde", default = "default_ttl")]
	pub ttl: Duration,
	#[serde(default = "default_cache_max_entries")]
	pub max_entries: usize,
	#[serde(default = "default_cache_max_body")]
	pub max_entry_bytes: usize,
	#[serde(default)]
	pub vary_headers: Vec<String>,
	#[serde(default)]
	pub allow_authorization: bool,
	#[serde(default)]
	pub populate_conditional_headers: bool,
}

fn default_cache_methods() -> Vec<String> {
	vec!["GET".to_string()]
}
fn default_ttl() -> Duration {
	Duration::from_secs(60)
}
fn default_cache_max_entries() -> usize {
	10_000
}
fn default_cache_max_body() -> usize {
	1024 * 1024
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
	pub enabled: bool,
	#[serde(default = "default_rl_tokens")]
	pub max_tokens: u64,
	#[serde(default = "default_rl_tokens")]
	pub tokens_per_fill: u64,
	#[serde(with = "humantime_serde", default = "default_rl_interval")]
	pub fill_interval: Duration,
}

fn default_rl_tokens() -> u64 {
	100
}
fn default_rl_interval() -> Duration {
	Duration::from_secs(1)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsConfig {
	pub enabled: bool,
	#[serde(default)]
	pub allowed_origins: Vec<String>,
	#[serde(default = "default_cors_methods")]
	pub allowed_methods: Vec<String>,
	#[serde(default)]
	pub allowed_headers: Vec<String>,
	#[serde(default)]
	pub allow_credentials: bool,
}

fn default_cors_methods() -> Vec<String> {
	vec![
		"GET".into(),
		"POST".into(),
		"PUT".into(),
		"PATCH".into(),
		"DELETE".into(),
		"OPTIONS".into(),
	]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
	#[serde(default)]
	pub jwt: Option<JwtConfig>,
	#[serde(default)]
	pub api_key: Option<ApiKeyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtConfig {
	pub hmac_secret: String,
	#[serde(default)]
	pub required_claims: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyConfig {
	pub header: String,
	pub valid_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
	#[serde(default)]
	pub add_request_headers: HashMap<String, String>,
	#[serde(default)]
	pub remove_request_headers: Vec<String>,
	#[serde(default)]
	pub add_response_headers: HashMap<String, String>,
	#[serde(default)]
	pub remove_response_headers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
	pub enabled: bool,
	pub backend_url: String,
	#[serde(default = "default_mirror_percentage")]
	pub percentage: f64,
}

fn default_mirror_percentage() -> f64 {
	100.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSplitConfig {
	pub enabled: bool,
	/// variant name -> weight. The route's primary backends are the implicit "stable" variant.
	pub variants: HashMap<String, Vec<BackendConfig>>,
	pub weights: HashMap<String, u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionConfig {
	pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
	pub enabled: bool,
	#[serde(default)]
	pub max_body_bytes: Option<usize>,
	#[serde(default)]
	pub required_headers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMatch {
	#[serde(default)]
	pub host: Option<String>,
	pub path: PathMatch,
	#[serde(default)]
	pub methods: Vec<String>,
	#[serde(default)]
	pub headers: HashMap<String, String>,
	#[serde(default)]
	pub query: HashMap<String, String>,
}

/// A `{name}` segment in either variant's pattern captures the corresponding request path segment
/// (see `router::path_match`); any other segment must match literally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum PathMatch {
	Exact(String),
	Prefix(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
	pub id: RouteId,
	#[serde(flatten)]
	pub matcher: RouteMatch,
	#[serde(default)]
	pub upstream: Option<UpstreamName>,
	#[serde(default)]
	pub backends: Vec<BackendConfig>,
	#[serde(default)]
	pub lb_policy: LbPolicy,
	/// Per-version backend groups for `lb_policy: versioned` routes, keyed by the version token
	/// compared against the `x-api-version` header (a `"default"` entry is used when the header is
	/// absent or names an unregistered version). Ignored by every other `LbPolicy` variant.
	#[serde(default)]
	pub versions: HashMap<String, Vec<BackendConfig>>,
	#[serde(default)]
	pub sticky: StickyConfig,
	#[serde(default)]
	pub retry: RetryPolicy,
	#[serde(default)]
	pub timeout: TimeoutPolicy,
	#[serde(default)]
	pub auth: AuthConfig,
	#[serde(default)]
	pub rate_limit: RateLimitConfig,
	#[serde(default)]
	pub breaker: BreakerConfig,
	#[serde(default)]
	pub coalesce: CoalesceConfig,
	#[serde(default)]
	pub cache: CacheConfig,
	#[serde(default)]
	pub cors: CorsConfig,
	#[serde(default)]
	pub transform: TransformConfig,
	#[serde(default)]
	pub mirror: MirrorConfig,
	#[serde(default)]
	pub traffic_split: TrafficSplitConfig,
	#[serde(default)]
	pub compression: CompressionConfig,
	#[serde(default)]
	pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
	pub name: ListenerId,
	pub address: SocketAddr,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
	#[serde(default)]
	pub cors: CorsConfig,
	#[serde(default)]
	pub rate_limit: RateLimitConfig,
	#[serde(default)]
	pub ip_allowlist: Vec<String>,
	#[serde(default)]
	pub ip_denylist: Vec<String>,
	#[serde(default = "default_true")]
	pub access_log: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
	#[serde(default)]
	pub listeners: Vec<ListenerConfig>,
	#[serde(default)]
	pub upstreams: Vec<UpstreamConfig>,
	#[serde(default)]
	pub routes: Vec<RouteConfig>,
	#[serde(default)]
	pub global: GlobalConfig,
}
