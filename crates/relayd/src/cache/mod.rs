//! Route-policy HTTP response cache.
//!
//! Only GET/HEAD and a fixed set of response statuses are cacheable, and
//! `Cache-Control: private|no-store|no-cache` always wins. The store is a
//! bounded in-memory map; when full it discards the oldest insertions
//! (approximate, not LRU).

pub mod coalesce;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use crate::http::{Body, HeaderMap, HeaderName, Method, Response, StatusCode, header};
use crate::{RouteId, Strng, config};

const CACHEABLE_STATUS: [u16; 8] = [200, 203, 204, 206, 301, 308, 404, 410];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
	pub enabled: bool,
	pub ttl: Duration,
	pub max_object_bytes: usize,
	pub vary_headers: Vec<HeaderName>,
}

impl TryFrom<&config::CacheConfig> for CachePolicy {
	type Error = anyhow::Error;

	fn try_from(c: &config::CacheConfig) -> anyhow::Result<CachePolicy> {
		Ok(CachePolicy {
			enabled: c.enabled,
			ttl: Duration::from_millis(c.ttl_ms),
			max_object_bytes: c.max_object_bytes,
			vary_headers: c
				.vary_headers
				.iter()
				.map(|h| {
					HeaderName::from_bytes(h.as_bytes()).map_err(|e| anyhow::anyhow!("vary header {h}: {e}"))
				})
				.collect::<Result<_, _>>()?,
		})
	}
}

/// A fully buffered, cacheable response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub stored_at: Instant,
	pub ttl: Duration,
}

impl CacheEntry {
	pub fn fresh(&self, now: Instant) -> bool {
		now.saturating_duration_since(self.stored_at) < self.ttl
	}

	pub fn to_response(&self) -> Response {
		let mut builder = ::http::Response::builder().status(self.status);
		if let Some(headers) = builder.headers_mut() {
			*headers = self.headers.clone();
		}
		builder
			.body(Body::from(self.body.clone()))
			.expect("cached response was valid when stored")
	}
}

/// Builds the cache key: route, method, host, canonical path, and the values
/// of the configured vary headers.
pub fn fingerprint(
	route: &RouteId,
	method: &Method,
	host: &str,
	path_and_query: &str,
	vary_headers: &[HeaderName],
	request_headers: &HeaderMap,
) -> Strng {
	let mut key = String::with_capacity(64);
	key.push_str(route);
	key.push('\x1f');
	key.push_str(method.as_str());
	key.push('\x1f');
	key.push_str(host);
	key.push('\x1f');
	key.push_str(path_and_query);
	for name in vary_headers {
		key.push('\x1f');
		if let Some(v) = request_headers.get(name) {
			key.push_str(String::from_utf8_lossy(v.as_bytes()).as_ref());
		}
	}
	crate::strng::new(key)
}

pub fn is_cacheable_request(method: &Method) -> bool {
	matches!(*method, Method::GET | Method::HEAD)
}

pub fn is_cacheable_response(status: StatusCode, headers: &HeaderMap) -> bool {
	if !CACHEABLE_STATUS.contains(&status.as_u16()) {
		return false;
	}
	for value in headers.get_all(header::CACHE_CONTROL) {
		let Ok(s) = value.to_str() else {
			return false;
		};
		let s = s.to_ascii_lowercase();
		if s.contains("private") || s.contains("no-store") || s.contains("no-cache") {
			return false;
		}
	}
	true
}

struct StoreInner {
	map: HashMap<Strng, CacheEntry>,
	insertions: VecDeque<Strng>,
	bytes: usize,
}

/// Bounded in-memory store shared by every route with a cache policy.
pub struct MemoryStore {
	inner: Mutex<StoreInner>,
	max_entries: usize,
	max_bytes: usize,
}

impl MemoryStore {
	pub fn new(max_entries: usize, max_bytes: usize) -> MemoryStore {
		MemoryStore {
			inner: Mutex::new(StoreInner {
				map: HashMap::new(),
				insertions: VecDeque::new(),
				bytes: 0,
			}),
			max_entries,
			max_bytes,
		}
	}

	pub fn get(&self, key: &Strng, now: Instant) -> Option<CacheEntry> {
		let mut inner = self.inner.lock().expect("cache lock poisoned");
		match inner.map.get(key) {
			Some(entry) if entry.fresh(now) => Some(entry.clone()),
			Some(_) => {
				trace!(%key, "evicting stale entry");
				if let Some(old) = inner.map.remove(key) {
					inner.bytes = inner.bytes.saturating_sub(old.body.len());
				}
				None
			},
			None => None,
		}
	}

	pub fn insert(&self, key: Strng, entry: CacheEntry) {
		let mut inner = self.inner.lock().expect("cache lock poisoned");
		if let Some(old) = inner.map.remove(&key) {
			inner.bytes = inner.bytes.saturating_sub(old.body.len());
		}
		inner.bytes += entry.body.len();
		inner.map.insert(key.clone(), entry);
		inner.insertions.push_back(key);
		// Oldest insertions go first when over capacity.
		while inner.map.len() > self.max_entries || inner.bytes > self.max_bytes {
			let Some(old_key) = inner.insertions.pop_front() else {
				break;
			};
			if let Some(old) = inner.map.remove(&old_key) {
				inner.bytes = inner.bytes.saturating_sub(old.body.len());
			}
		}
	}

	pub fn len(&self) -> usize {
		self.inner.lock().expect("cache lock poisoned").map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
