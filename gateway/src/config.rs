//! Config loading (ambient stack: C-config). Grounded in the teacher's `parse_config` /
//! `ConfigSource` split — a `ConfigSource` names where bytes come from, a `parse_config` function
//! turns the bytes into the typed `GatewayConfig` used to build a `StateSnapshot`. The teacher's
//! version also pulls in XDS/environment-variable overlays; this one is scoped to the single
//! `RouteConfig`-bearing YAML document the gateway actually needs for the routes/upstreams/global
//! sections.

use std::fs;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::GatewayConfig;

#[derive(Debug, Clone)]
pub enum ConfigSource {
	File(PathBuf),
	Inline(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_yaml::Error),
	#[error("config validation failed: {0}")]
	Invalid(String),
}

impl ConfigSource {
	fn load(&self) -> Result<String, ConfigError> {
		match self {
			ConfigSource::File(path) => fs::read_to_string(path).map_err(|source| ConfigError::Read {
				path: path.clone(),
				source,
			}),
			ConfigSource::Inline(s) => Ok(s.clone()),
		}
	}
}

/// Parses and validates a `GatewayConfig` from a source. Validation is deliberately light here
/// (route ids unique, every route resolves to either an inline backend list or a known upstream
/// name): deeper semantic checks (e.g. a matcher that can never hit) happen when the Reloader
/// tries to compile the config into a `StateSnapshot`.
pub fn parse_config(source: &ConfigSource) -> Result<GatewayConfig, ConfigError> {
	let contents = source.load()?;
	let config: GatewayConfig = serde_yaml::from_str(&contents)?;
	validate(&config)?;
	Ok(config)
}

fn validate(config: &GatewayConfig) -> Result<(), ConfigError> {
	let mut seen = std::collections::HashSet::new();
	for route in &config.routes {
		if !seen.insert(route.id.as_str()) {
			return Err(ConfigError::Invalid(format!("duplicate route id {}", route.id)));
		}
		let has_upstream = route
			.upstream
			.as_ref()
			.is_some_and(|name| config.upstreams.iter().any(|u| &u.name == name));
		if !has_upstream && route.backends.is_empty() {
			return Err(ConfigError::Invalid(format!(
				"route {} has neither a known upstream nor inline backends",
				route.id
			)));
		}
	}
	Ok(())
}

#[cfg(test)]
pub mod test_support {
	use std::collections::HashMap;

	use crate::types::{BackendConfig, PathMatch, RouteConfig, RouteMatch};

	/// Minimal valid route used across feature unit tests: one inline backend, exact path match,
	/// every other section at its default.
	pub fn minimal_route(id: &str) -> RouteConfig {
		RouteConfig {
			id: id.to_string(),
			matcher: RouteMatch {
				host: None,
				path: PathMatch::Exact(format!("/{id}")),
				methods: vec![],
				headers: HashMap::new(),
				query: HashMap::new(),
			},
			upstream: None,
			backends: vec![BackendConfig {
				url: "http://127.0.0.1:9000".to_string(),
				weight: 1,
				health_check: None,
			}],
			lb_policy: Default::default(),
			versions: Default::default(),
			sticky: Default::default(),
			retry: Default::default(),
			timeout: Default::default(),
			auth: Default::default(),
			rate_limit: Default::default(),
			breaker: Default::default(),
			coalesce: Default::default(),
			cache: Default::default(),
			cors: Default::default(),
			transform: Default::default(),
			mirror: Default::default(),
			traffic_split: Default::default(),
			compression: Default::default(),
			validation: Default::default(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimal_yaml() {
		let yaml = r#"
listeners:
  - name: main
    address: "0.0.0.0:8080"
upstreams: []
routes:
  - id: r1
    path:
      kind: prefix
      value: /
    backends:
      - url: "http://127.0.0.1:9000"
"#;
		let cfg = parse_config(&ConfigSource::Inline(yaml.to_string())).unwrap();
		assert_eq!(cfg.routes.len(), 1);
		assert_eq!(cfg.routes[0].id, "r1");
	}

	#[test]
	fn rejects_duplicate_route_ids() {
		let yaml = r#"
routes:
  - id: dup
    path: { kind: exact, value: /a }
    backends: [{ url: "http://127.0.0.1:9000" }]
  - id: dup
    path: { kind: exact, value: /b }
    backends: [{ url: "http://127.0.0.1:9000" }]
"#;
		let err = parse_config(&ConfigSource::Inline(yaml.to_string())).unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)));
	}

	#[test]
	fn rejects_route_with_no_backends_or_upstream() {
		let yaml = r#"
routes:
  - id: r1
    path: { kind: exact, value: /a }
"#;
		let err = parse_config(&ConfigSource::Inline(yaml.to_string())).unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)));
	}
}
