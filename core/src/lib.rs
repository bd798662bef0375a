//! Small collection of process-wiring helpers shared by the gateway binary: graceful drain,
//! readiness tracking, signal handling, and telemetry bootstrap. Split out of the main crate so
//! it carries no dependency on gateway-specific config/route types.

pub mod drain;
pub mod metrics;
pub mod prelude;
pub mod readiness;
pub mod signal;
pub mod telemetry;
pub mod version;
