//! Programmable HTTP API gateway core. Module layout mirrors the teacher's flat `src/` tree (one
//! file or directory per subsystem, no deep nesting) rather than grouping by layer.

pub mod app;
pub mod balancer;
pub mod breaker;
pub mod cache;
pub mod client;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod features;
pub mod gateway;
pub mod healthcheck;
pub mod management;
pub mod pipeline;
pub mod proxy;
pub mod registry;
pub mod reload;
pub mod router;
pub mod snapshot;
pub mod telemetry;
pub mod types;
pub mod varctx;
