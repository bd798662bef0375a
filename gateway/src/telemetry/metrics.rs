//! Prometheus collectors for the data plane. Grounded in `gwcore::metrics::sub_registry` (one
//! namespaced sub-registry per subsystem) and the teacher's habit of registering every instrument
//! once at process start and handing out cheap `Family` handles afterward.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteStatusLabels {
	pub route_id: String,
	pub status: String,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
	pub route_id: String,
}

pub struct GatewayMetrics {
	pub requests_total: Family<RouteStatusLabels, Counter>,
	pub request_duration_seconds: Family<RouteLabels, Histogram>,
	pub cache_hits_total: Family<RouteLabels, Counter>,
	pub cache_misses_total: Family<RouteLabels, Counter>,
	pub coalesced_total: Family<RouteLabels, Counter>,
	pub breaker_trips_total: Family<RouteLabels, Counter>,
	pub retries_total: Family<RouteLabels, Counter>,
}

impl GatewayMetrics {
	pub fn new(registry: &mut Registry) -> GatewayMetrics {
		let sub = gwcore::metrics::sub_registry(registry, "gateway");

		let requests_total = Family::default();
		sub.register("requests", "Total requests handled by route and status", requests_total.clone());

		let request_duration_seconds = Family::new_with_constructor(|| {
			Histogram::new([0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0].into_iter())
		});
		sub.register(
			"request_duration_seconds",
			"Request latency by route",
			request_duration_seconds.clone(),
		);

		let cache_hits_total = Family::default();
		sub.register("cache_hits", "Response cache hits by route", cache_hits_total.clone());

		let cache_misses_total = Family::default();
		sub.register("cache_misses", "Response cache misses by route", cache_misses_total.clone());

		let coalesced_total = Family::default();
		sub.register(
			"coalesced_requests",
			"Requests served from a leader's in-flight response",
			coalesced_total.clone(),
		);

		let breaker_trips_total = Family::default();
		sub.register("breaker_trips", "Circuit breaker open transitions by route", breaker_trips_total.clone());

		let retries_total = Family::default();
		sub.register("retries", "Backend retry attempts by route", retries_total.clone());

		GatewayMetrics {
			requests_total,
			request_duration_seconds,
			cache_hits_total,
			cache_misses_total,
			coalesced_total,
			breaker_trips_total,
			retries_total,
		}
	}
}
