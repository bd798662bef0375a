//! Router (C1): matches an inbound request to exactly one route and extracts its path params.
//!
//! Builds a two-tier index (host -> ordered path matchers) the way the teacher's
//! `types::agent::Listener` groups `RouteSet` under a hostname. Exact paths beat prefix paths;
//! among prefixes, longer (more segments) beats shorter; ties keep insertion order (a stable sort
//! on a precomputed rank satisfies both requirements at once). A pattern segment written
//! `{name}` matches any single path segment and is captured into the returned param map under
//! `name`; every other segment must match literally.

use std::collections::HashMap;

use http::Method;

use crate::types::{PathMatch, RouteConfig, RouteId};

#[derive(Debug, Clone)]
pub struct MatchedRoute {
	pub route_id: RouteId,
	pub path_params: HashMap<String, String>,
}

#[derive(Debug)]
struct CompiledMatcher {
	route_id: RouteId,
	host: Option<String>,
	path: PathMatch,
	methods: Vec<Method>,
	headers: Vec<(String, String)>,
	query: Vec<(String, String)>,
	insertion_order: usize,
}

impl CompiledMatcher {
	/// Higher rank wins when multiple matchers match the same request. Prefix specificity is
	/// measured in path segments rather than bytes, so a `{param}` segment counts the same as a
	/// literal one.
	fn rank(&self) -> (u8, usize) {
		match &self.path {
			PathMatch::Exact(_) => (2, 0),
			PathMatch::Prefix(p) => (1, split_segments(p).len()),
		}
	}
}

#[derive(Debug, Default)]
pub struct Router {
	// Grouped by host so a concrete hostname is tried before falling back to the wildcard host.
	by_host: HashMap<String, Vec<CompiledMatcher>>,
	wildcard: Vec<CompiledMatcher>,
}

impl Router {
	pub fn build(routes: &[RouteConfig]) -> Router {
		let mut router = Router::default();
		for (idx, r) in routes.iter().enumerate() {
			let methods = r
				.matcher
				.methods
				.iter()
				.filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
				.collect();
			let matcher = CompiledMatcher {
				route_id: r.id.clone(),
				host: r.matcher.host.clone(),
				path: r.matcher.path.clone(),
				methods,
				headers: r.matcher.headers.clone().into_iter().collect(),
				query: r.matcher.query.clone().into_iter().collect(),
				insertion_order: idx,
			};
			match &matcher.host {
				Some(h) => router.by_host.entry(h.clone()).or_default().push(matcher),
				None => router.wildcard.push(matcher),
			}
		}
		for list in router.by_host.values_mut() {
			sort_matchers(list);
		}
		sort_matchers(&mut router.wildcard);
		router
	}

	pub fn route(
		&self,
		host: Option<&str>,
		path: &str,
		method: &Method,
		headers: &http::HeaderMap,
		query: &HashMap<String, String>,
	) -> Option<MatchedRoute> {
		if let Some(host) = host {
			if let Some(list) = self.by_host.get(host) {
				if let Some(m) = find_match(list, path, method, headers, query) {
					return Some(m);
				}
			}
		}
		find_match(&self.wildcard, path, method, headers, query)
	}
}

fn sort_matchers(list: &mut [CompiledMatcher]) {
	list.sort_by(|a, b| {
		b.rank()
			.cmp(&a.rank())
			.then(a.insertion_order.cmp(&b.insertion_order))
	});
}

/// Splits a path into its non-empty segments, ignoring leading/trailing slashes, so `"/a/{id}/"`
/// and `"a/{id}"` compile to the same pattern.
fn split_segments(path: &str) -> Vec<&str> {
	path.split('/').filter(|s| !s.is_empty()).collect()
}

/// A pattern segment of the form `{name}` captures whatever segment it lines up against; any
/// other segment must match literally. `Exact` requires the segment counts to match; `Prefix`
/// only requires the pattern's segments to line up with the request's leading segments.
fn path_match<'a>(m: &'a CompiledMatcher, path: &'a str) -> Option<HashMap<String, String>> {
	let path_segments = split_segments(path);
	match &m.path {
		PathMatch::Exact(pattern) => {
			let pattern_segments = split_segments(pattern);
			if pattern_segments.len() != path_segments.len() {
				return None;
			}
			match_segments(&pattern_segments, &path_segments)
		},
		PathMatch::Prefix(pattern) => {
			let pattern_segments = split_segments(pattern);
			if pattern_segments.len() > path_segments.len() {
				return None;
			}
			match_segments(&pattern_segments, &path_segments[..pattern_segments.len()])
		},
	}
}

fn match_segments(pattern: &[&str], path: &[&str]) -> Option<HashMap<String, String>> {
	let mut params = HashMap::new();
	for (p, s) in pattern.iter().zip(path.iter()) {
		match p.strip_prefix('{').and_then(|rest| rest.strip_suffix('}')) {
			Some(name) => {
				params.insert(name.to_string(), (*s).to_string());
			},
			None if p == s => {},
			None => return None,
		}
	}
	Some(params)
}

fn find_match(
	list: &[CompiledMatcher],
	path: &str,
	method: &Method,
	headers: &http::HeaderMap,
	query: &HashMap<String, String>,
) -> Option<MatchedRoute> {
	for m in list {
		let Some(path_params) = path_match(m, path) else {
			continue;
		};
		if !m.methods.is_empty() && !m.methods.contains(method) {
			continue;
		}
		if !m.headers.iter().all(|(k, v)| {
			headers
				.get(k)
				.and_then(|hv| hv.to_str().ok())
				.is_some_and(|hv| hv == v)
		}) {
			continue;
		}
		if !m
			.query
			.iter()
			.all(|(k, v)| query.get(k).is_some_and(|qv| qv == v))
		{
			continue;
		}
		return Some(MatchedRoute {
			route_id: m.route_id.clone(),
			path_params,
		});
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::RouteMatch;

	fn route(id: &str, path: PathMatch) -> RouteConfig {
		RouteConfig {
			id: id.to_string(),
			matcher: RouteMatch {
				host: None,
				path,
				methods: vec![],
				headers: HashMap::new(),
				query: HashMap::new(),
			},
			upstream: None,
			backends: vec![],
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

	#[test]
	fn exact_beats_prefix() {
		let routes = vec![
			route("prefix", PathMatch::Prefix("/a".into())),
			route("exact", PathMatch::Exact("/a/b".into())),
		];
		let router = Router::build(&routes);
		let m = router
			.route(None, "/a/b", &Method::GET, &http::HeaderMap::new(), &HashMap::new())
			.unwrap();
		assert_eq!(m.route_id, "exact");
	}

	#[test]
	fn longer_prefix_beats_shorter() {
		let routes = vec![
			route("short", PathMatch::Prefix("/a".into())),
			route("long", PathMatch::Prefix("/a/b".into())),
		];
		let router = Router::build(&routes);
		let m = router
			.route(None, "/a/b/c", &Method::GET, &http::HeaderMap::new(), &HashMap::new())
			.unwrap();
		assert_eq!(m.route_id, "long");
	}

	#[test]
	fn no_match_returns_none() {
		let routes = vec![route("only", PathMatch::Exact("/x".into()))];
		let router = Router::build(&routes);
		assert!(
			router
				.route(None, "/y", &Method::GET, &http::HeaderMap::new(), &HashMap::new())
				.is_none()
		);
	}

	#[test]
	fn param_segment_is_captured_and_matched_against_any_value() {
		let routes = vec![route("by_id", PathMatch::Exact("/users/{id}".into()))];
		let router = Router::build(&routes);
		let m = router
			.route(None, "/users/42", &Method::GET, &http::HeaderMap::new(), &HashMap::new())
			.unwrap();
		assert_eq!(m.route_id, "by_id");
		assert_eq!(m.path_params.get("id").map(String::as_str), Some("42"));
	}

	#[test]
	fn param_segment_in_prefix_pattern_still_requires_trailing_segments() {
		let routes = vec![route("scoped", PathMatch::Prefix("/accounts/{acct}".into()))];
		let router = Router::build(&routes);
		let m = router
			.route(None, "/accounts/7/orders", &Method::GET, &http::HeaderMap::new(), &HashMap::new())
			.unwrap();
		assert_eq!(m.path_params.get("acct").map(String::as_str), Some("7"));
		assert!(
			router
				.route(None, "/accounts", &Method::GET, &http::HeaderMap::new(), &HashMap::new())
				.is_none()
		);
	}

	#[test]
	fn insertion_order_breaks_ties() {
		let routes = vec![
			route("first", PathMatch::Prefix("/a".into())),
			route("second", PathMatch::Prefix("/a".into())),
		];
		let router = Router::build(&routes);
		let m = router
			.route(None, "/a/z", &Method::GET, &http::HeaderMap::new(), &HashMap::new())
			.unwrap();
		assert_eq!(m.route_id, "first");
	}
}
