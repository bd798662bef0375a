//! Variable Context (C14): a pooled, request-scoped bag of facts consumed by templating, rules
//! engines, and logging. Grounded in the teacher's request-scoped `RequestLog` accumulator
//! (`telemetry::log::RequestLog`, built once per request and threaded through every middleware by
//! mutable reference) generalized from "log fields only" to the fuller set of fields spec §4.14
//! needs (skip flags, overrides, identity).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::types::RouteId;

/// Per-request skip flags a rules engine can set to short-circuit later pipeline steps. Plain
/// bools keyed by feature name rather than a fixed struct, since the set of skippable features is
/// the same open set the Feature Registry (C5) enumerates.
#[derive(Debug, Default, Clone)]
pub struct SkipFlags(HashMap<String, bool>);

impl SkipFlags {
	pub fn set(&mut self, feature: &str, skip: bool) {
		self.0.insert(feature.to_string(), skip);
	}

	pub fn is_skipped(&self, feature: &str) -> bool {
		self.0.get(feature).copied().unwrap_or(false)
	}
}

/// Identity established by the Authentication step (§4.10 step 13). Cheap to clone: `Arc`-shared
/// rather than deep-copied, matching the "identities shared" half of the cloning rule in §4.14.
#[derive(Debug, Clone)]
pub struct Identity {
	pub subject: Option<String>,
	pub claims: Arc<serde_json::Map<String, serde_json::Value>>,
}

impl Default for Identity {
	fn default() -> Self {
		Identity {
			subject: None,
			claims: Arc::new(serde_json::Map::new()),
		}
	}
}

/// The per-request bag. `path_params` and `overrides` are deep-copied on `Clone` (they're owned
/// `HashMap<String, String>` values, so `#[derive(Clone)]` already gives the right semantics);
/// `identity` is `Arc`-shared, matching §4.14's "identities shared" rule.
#[derive(Debug, Clone, Default)]
pub struct VarCtx {
	pub route_id: Option<RouteId>,
	pub path_params: HashMap<String, String>,
	pub identity: Identity,
	pub traffic_group: Option<String>,
	pub skip_flags: SkipFlags,
	pub overrides: HashMap<String, String>,
	pub request_id: String,
}

impl VarCtx {
	/// Resolves a `$`-prefixed template variable the way the teacher's access-log format strings
	/// resolve `%REQ(...)%`-style placeholders: a small fixed set of well-known prefixes, falling
	/// back to `overrides` for anything rules have stashed.
	pub fn resolve(&self, var: &str) -> Option<String> {
		if let Some(param) = var.strip_prefix("route_param_") {
			return self.path_params.get(param).cloned();
		}
		if let Some(claim) = var.strip_prefix("jwt_claim_") {
			return self
				.identity
				.claims
				.get(claim)
				.and_then(|v| v.as_str())
				.map(str::to_string);
		}
		match var {
			"request_id" => Some(self.request_id.clone()),
			"route_id" => self.route_id.clone(),
			_ => self.overrides.get(var).cloned(),
		}
	}
}

/// A bounded pool of reusable `VarCtx` values, grounded in the teacher's object-pool pattern for
/// per-request buffers (avoids an allocation storm under load; spec §5 "parallel task workers, one
/// per accepted request" implies high concurrent turnover of exactly this kind of small struct).
pub struct VarCtxPool {
	free: Mutex<Vec<VarCtx>>,
}

impl VarCtxPool {
	pub fn new() -> VarCtxPool {
		VarCtxPool {
			free: Mutex::new(Vec::new()),
		}
	}

	pub fn acquire(&self, request_id: String) -> VarCtx {
		let mut ctx = self.free.lock().unwrap().pop().unwrap_or_default();
		ctx.route_id = None;
		ctx.path_params.clear();
		ctx.identity = Identity::default();
		ctx.traffic_group = None;
		ctx.skip_flags = SkipFlags::default();
		ctx.overrides.clear();
		ctx.request_id = request_id;
		ctx
	}

	pub fn release(&self, ctx: VarCtx) {
		let mut free = self.free.lock().unwrap();
		if free.len() < 4096 {
			free.push(ctx);
		}
	}
}

impl Default for VarCtxPool {
	fn default() -> Self {
		Self::new()
	}
}
