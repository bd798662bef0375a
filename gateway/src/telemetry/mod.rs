//! Ambient observability stack: structured per-request access logs and Prometheus metrics.
//! Grounded in the teacher's `telemetry`/`metrics` split (request log as a plain struct logged via
//! `tracing`, counters/histograms registered once against a shared `prometheus_client::Registry`).

pub mod log;
pub mod metrics;
