//! Feature Registry (C5).
//!
//! §9 design note: the teacher's dozens of parallel "ByRoute" managers are represented here as a
//! single `Feature` trait with a uniform lifecycle (`name`, `setup`, `route_ids`, optional
//! `admin_stats`), the way the spec asks — instead of a tree of bespoke manager types each wired
//! into the composer by hand. The Reloader registers one boxed `Feature` per capability over the
//! new config; each feature's `setup` reads the slice of route config it cares about and, if
//! enabled for that route, builds and stores its per-route manager. A `Setup` error aborts the
//! whole reload (spec §4.5, §4.12 step 2).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProxyError;
use crate::types::{RouteConfig, RouteId};

pub mod auth;
pub mod cors;
pub mod ratelimit;
pub mod transform;
pub mod validation;

/// A uniform per-route capability. Implementors own their own `DashMap<RouteId, Arc<PerRoute>>`
/// or similar internally; `Feature` itself only needs to expose the lifecycle the Reloader and
/// admin surface drive.
pub trait Feature: Send + Sync + std::any::Any {
	fn name(&self) -> &'static str;

	/// Called once per route during snapshot construction (§4.12 step 2). `route` is `None` when
	/// called for global-only setup (features that also have a gateway-wide default).
	fn setup(&self, route: &RouteConfig) -> Result<(), ProxyError>;

	fn route_ids(&self) -> Vec<RouteId>;

	fn admin_stats(&self) -> serde_json::Value {
		serde_json::Value::Null
	}

	/// Lets the Pipeline Composer recover the concrete feature type to call its typed
	/// per-request methods (`AuthFeature::authenticate` and friends); the registry itself only
	/// ever needs the uniform lifecycle above.
	fn as_any(&self) -> &dyn std::any::Any;
}

/// The ordered collection of registered features for one snapshot generation. Order here does
/// not determine pipeline order (the Pipeline Composer owns that, per the fixed §4.10 sequence);
/// this is purely bookkeeping for reload-time setup and admin stats dumps.
#[derive(Default)]
pub struct FeatureRegistry {
	features: Vec<Arc<dyn Feature>>,
}

impl FeatureRegistry {
	pub fn new() -> FeatureRegistry {
		FeatureRegistry::default()
	}

	pub fn register(&mut self, feature: Arc<dyn Feature>) {
		self.features.push(feature);
	}

	/// Runs every registered feature's `setup` for every route in the new config. Any error
	/// aborts with that error (§4.12: "Errors fail the entire reload").
	pub fn setup_all(&self, routes: &[RouteConfig]) -> Result<(), ProxyError> {
		for feature in &self.features {
			for route in routes {
				feature.setup(route)?;
			}
		}
		Ok(())
	}

	pub fn admin_stats(&self) -> HashMap<&'static str, serde_json::Value> {
		self
			.features
			.iter()
			.map(|f| (f.name(), f.admin_stats()))
			.collect()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Feature>> {
		self.features.iter()
	}
}
