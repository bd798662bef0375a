//! Response Cache (C9): keyed by method/path/query/vary-headers, TTL + conditional revalidation,
//! LRU eviction. Grounded in the teacher's `DashMap`-backed route caches (the same sharded-map
//! idiom used for `RouteAuth`/`RouteCors` tables elsewhere in this repository) plus an explicit LRU
//! order list, since `DashMap` alone gives no eviction ordering.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blake3::Hasher;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, StatusCode, header};

use crate::types::CacheConfig;

#[derive(Clone)]
pub struct CacheEntry {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub etag: Option<String>,
	pub last_modified: Option<String>,
	stored_at: Instant,
	ttl: Duration,
}

impl CacheEntry {
	pub fn is_fresh(&self) -> bool {
		self.stored_at.elapsed() < self.ttl
	}

	/// True if the request's conditional headers indicate the client already has this
	/// representation, i.e. a 304 should be returned instead of the cached body.
	pub fn matches_conditional(&self, request_headers: &HeaderMap) -> bool {
		if let (Some(etag), Some(inm)) = (
			&self.etag,
			request_headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()),
		) {
			if inm == etag {
				return true;
			}
		}
		if let (Some(lm), Some(ims)) = (
			&self.last_modified,
			request_headers.get(header::IF_MODIFIED_SINCE).and_then(|v| v.to_str().ok()),
		) {
			if ims == lm {
				return true;
			}
		}
		false
	}
}

struct Inner {
	entries: DashMap<String, CacheEntry>,
	order: parking_lot::Mutex<VecDeque<String>>,
}

/// One cache instance per route. The Reloader allocates a fresh one per reload generation (old
/// entries are simply dropped along with the old snapshot rather than migrated), matching the
/// "don't touch handlers on drain, let GC reclaim them" rule in §4.12.
#[derive(Clone)]
pub struct RouteCache {
	inner: Arc<Inner>,
	max_entries: usize,
	max_entry_bytes: usize,
}

impl RouteCache {
	pub fn new(cfg: &CacheConfig) -> RouteCache {
		RouteCache {
			inner: Arc::new(Inner {
				entries: DashMap::new(),
				order: parking_lot::Mutex::new(VecDeque::new()),
			}),
			max_entries: cfg.max_entries,
			max_entry_bytes: cfg.max_entry_bytes,
		}
	}

	pub fn key(method: &http::Method, path: &str, query: &str, vary_headers: &[String], headers: &HeaderMap) -> String {
		let mut key = format!("{method}|{path}|{query}");
		for name in vary_headers {
			key.push('|');
			if let Some(v) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
				key.push_str(v);
			}
		}
		key
	}

	pub fn should_cache_request(cfg: &CacheConfig, method: &http::Method, headers: &HeaderMap) -> bool {
		if !cfg.enabled || !cfg.methods.iter().any(|m| m.eq_ignore_ascii_case(method.as_str())) {
			return false;
		}
		if headers
			.get(header::CACHE_CONTROL)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|v| v.contains("no-cache") || v.contains("no-store"))
		{
			return false;
		}
		if headers.contains_key(header::AUTHORIZATION) && !cfg.allow_authorization {
			return false;
		}
		true
	}

	pub fn should_store(cfg: &CacheConfig, status: StatusCode, headers: &HeaderMap, body_len: usize) -> bool {
		if body_len > cfg.max_entry_bytes {
			return false;
		}
		if !matches!(status.as_u16(), 200 | 203 | 301 | 404) {
			return false;
		}
		!headers
			.get(header::CACHE_CONTROL)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|v| v.contains("no-store"))
	}

	pub fn get(&self, key: &str) -> Option<CacheEntry> {
		let entry = self.inner.entries.get(key)?;
		if entry.is_fresh() {
			Some(entry.clone())
		} else {
			drop(entry);
			self.inner.entries.remove(key);
			None
		}
	}

	pub fn store(
		&self,
		cfg: &CacheConfig,
		key: String,
		status: StatusCode,
		headers: HeaderMap,
		body: Bytes,
	) {
		if body.len() > self.max_entry_bytes {
			return;
		}
		let (etag, last_modified) = if cfg.populate_conditional_headers {
			(
				headers
					.get(header::ETAG)
					.and_then(|v| v.to_str().ok())
					.map(str::to_string)
					.or_else(|| Some(stable_etag(&body))),
				headers
					.get(header::LAST_MODIFIED)
					.and_then(|v| v.to_str().ok())
					.map(str::to_string),
			)
		} else {
			(None, None)
		};

		let entry = CacheEntry {
			status,
			headers,
			body,
			etag,
			last_modified,
			stored_at: Instant::now(),
			ttl: cfg.ttl,
		};

		let is_new = !self.inner.entries.contains_key(&key);
		self.inner.entries.insert(key.clone(), entry);
		if is_new {
			let mut order = self.inner.order.lock();
			order.push_back(key);
			while order.len() > self.max_entries {
				if let Some(evict) = order.pop_front() {
					self.inner.entries.remove(&evict);
				}
			}
		}
	}

	/// Invalidates every entry whose key's path component starts with `path_prefix`, called after
	/// a mutating method succeeds against the same route (§4.9 "invalidate by path prefix").
	pub fn invalidate_prefix(&self, path_prefix: &str) {
		let to_remove: Vec<String> = self
			.inner
			.entries
			.iter()
			.filter(|e| {
				e.key()
					.splitn(3, '|')
					.nth(1)
					.is_some_and(|p| p.starts_with(path_prefix))
			})
			.map(|e| e.key().clone())
			.collect();
		for key in to_remove {
			self.inner.entries.remove(&key);
		}
	}

	pub fn len(&self) -> usize {
		self.inner.entries.len()
	}
}

fn stable_etag(body: &Bytes) -> String {
	let mut hasher = Hasher::new();
	hasher.update(body);
	format!("\"{}\"", hasher.finalize().to_hex())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg() -> CacheConfig {
		CacheConfig {
			enabled: true,
			methods: vec!["GET".to_string()],
			ttl: Duration::from_secs(60),
			max_entries: 2,
			max_entry_bytes: 1024,
			vary_headers: vec![],
			allow_authorization: false,
			populate_conditional_headers: true,
		}
	}

	#[test]
	fn stores_and_hits() {
		let cache = RouteCache::new(&cfg());
		cache.store(&cfg(), "k1".to_string(), StatusCode::OK, HeaderMap::new(), Bytes::from("v1"));
		assert!(cache.get("k1").is_some());
		assert!(cache.get("missing").is_none());
	}

	#[test]
	fn expired_entry_is_removed_on_get() {
		let mut c = cfg();
		c.ttl = Duration::from_millis(1);
		let cache = RouteCache::new(&c);
		cache.store(&c, "k1".to_string(), StatusCode::OK, HeaderMap::new(), Bytes::from("v1"));
		std::thread::sleep(Duration::from_millis(10));
		assert!(cache.get("k1").is_none());
		assert_eq!(cache.len(), 0);
	}

	#[test]
	fn lru_evicts_oldest_beyond_max_entries() {
		let c = cfg();
		let cache = RouteCache::new(&c);
		cache.store(&c, "k1".to_string(), StatusCode::OK, HeaderMap::new(), Bytes::from("v1"));
		cache.store(&c, "k2".to_string(), StatusCode::OK, HeaderMap::new(), Bytes::from("v2"));
		cache.store(&c, "k3".to_string(), StatusCode::OK, HeaderMap::new(), Bytes::from("v3"));
		assert!(cache.get("k1").is_none());
		assert!(cache.get("k2").is_some());
		assert!(cache.get("k3").is_some());
	}

	#[test]
	fn invalidate_prefix_clears_matching_routes_path() {
		let c = cfg();
		let cache = RouteCache::new(&c);
		let key = RouteCache::key(&http::Method::GET, "/users/1", "", &[], &HeaderMap::new());
		cache.store(&c, key.clone(), StatusCode::OK, HeaderMap::new(), Bytes::from("v"));
		cache.invalidate_prefix("/users");
		assert!(cache.get(&key).is_none());
	}

	#[test]
	fn conditional_match_on_etag() {
		let c = cfg();
		let cache = RouteCache::new(&c);
		cache.store(&c, "k1".to_string(), StatusCode::OK, HeaderMap::new(), Bytes::from("body"));
		let entry = cache.get("k1").unwrap();
		let etag = entry.etag.clone().unwrap();
		let mut req_headers = HeaderMap::new();
		req_headers.insert(header::IF_NONE_MATCH, etag.parse().unwrap());
		assert!(entry.matches_conditional(&req_headers));
	}

	#[test]
	fn should_store_rejects_oversize_and_bad_status() {
		let c = cfg();
		assert!(!RouteCache::should_store(&c, StatusCode::OK, &HeaderMap::new(), 2048));
		assert!(!RouteCache::should_store(&c, StatusCode::INTERNAL_SERVER_ERROR, &HeaderMap::new(), 10));
		assert!(RouteCache::should_store(&c, StatusCode::NOT_FOUND, &HeaderMap::new(), 10));
	}

	#[test]
	fn should_cache_request_rejects_no_store_and_unpermitted_auth() {
		let c = cfg();
		let mut headers = HeaderMap::new();
		headers.insert(header::CACHE_CONTROL, "no-store".parse().unwrap());
		assert!(!RouteCache::should_cache_request(&c, &http::Method::GET, &headers));

		let mut headers = HeaderMap::new();
		headers.insert(header::AUTHORIZATION, "Bearer x".parse().unwrap());
		assert!(!RouteCache::should_cache_request(&c, &http::Method::GET, &headers));
	}
}
