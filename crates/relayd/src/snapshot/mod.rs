//! Immutable runtime snapshots and the atomic store.
//!
//! A snapshot is the compiled view of one configuration: route index,
//! per-route policy, TLS, and handles to the long-lived pool runtimes. Every
//! request binds to exactly one snapshot for its whole lifetime; a swap never
//! disturbs requests already running against the previous one. The snapshot
//! holds *shared* handles to pool runtimes, which are owned by the registry
//! above it and reconciled in place across swaps.

pub mod build;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;

use crate::cache::CachePolicy;
use crate::http::Method;
use crate::pool::PoolRuntime;
use crate::retry::{Budget, RetryPolicy};
use crate::{PoolKey, RouteId, Strng, strng};

#[derive(Debug, Clone)]
pub struct CompiledRoute {
	pub id: RouteId,
	/// Lowercased; empty matches any host.
	pub host: String,
	pub path_prefix: String,
	/// `None` matches all methods.
	pub methods: Option<HashSet<Method>>,
	pub pool: PoolKey,
}

/// Ordered route matcher: first route whose host, path prefix, and method
/// all match wins.
#[derive(Debug, Default)]
pub struct RouteIndex {
	routes: Vec<Arc<CompiledRoute>>,
}

impl RouteIndex {
	pub fn new(routes: Vec<Arc<CompiledRoute>>) -> RouteIndex {
		RouteIndex { routes }
	}

	pub fn matches(&self, host: &str, path: &str, method: &Method) -> Option<Arc<CompiledRoute>> {
		let host = host.to_ascii_lowercase();
		self
			.routes
			.iter()
			.find(|r| {
				(r.host.is_empty() || r.host == host)
					&& path.starts_with(&r.path_prefix)
					&& r.methods.as_ref().is_none_or(|m| m.contains(method))
			})
			.cloned()
	}

	pub fn len(&self) -> usize {
		self.routes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.routes.is_empty()
	}
}

/// Per-route policy, durations already converted.
#[derive(Debug)]
pub struct RoutePolicy {
	pub route: RouteId,
	pub pool: PoolKey,
	pub request_timeout: Option<Duration>,
	pub response_header_timeout: Option<Duration>,
	pub require_mtls: bool,
	/// Subject DN of the CA this route accepts client certificates from;
	/// `None` accepts any listener-verified client certificate.
	pub mtls_ca_subject: Option<String>,
	pub retry: Option<RetryPolicy>,
	pub budget: Arc<Budget>,
	pub client_retry_cap: Option<u32>,
	pub cache: Option<CachePolicy>,
	pub plugins: Vec<Strng>,
}

/// Listener and pressure limits. Not wired to the config schema; operators
/// tune these through defaults compiled here.
#[derive(Debug, Clone)]
pub struct Limits {
	pub max_header_bytes: usize,
	pub read_header_timeout: Duration,
	pub idle_timeout: Duration,
	pub max_body_bytes: u64,
	pub max_inflight: u64,
}

impl Default for Limits {
	fn default() -> Self {
		Limits {
			max_header_bytes: 64 * 1024,
			read_header_timeout: Duration::from_secs(10),
			idle_timeout: Duration::from_secs(60),
			max_body_bytes: 64 * 1024 * 1024,
			max_inflight: 10_000,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ShutdownRuntime {
	pub graceful_timeout: Duration,
	pub drain: Duration,
	pub force_close: Duration,
}

impl From<&crate::config::ShutdownConfig> for ShutdownRuntime {
	fn from(c: &crate::config::ShutdownConfig) -> Self {
		ShutdownRuntime {
			graceful_timeout: Duration::from_millis(c.graceful_timeout_ms),
			drain: Duration::from_millis(c.drain_ms),
			force_close: Duration::from_millis(c.force_close_ms),
		}
	}
}

pub struct Snapshot {
	/// Hex SHA-256 of the source bytes.
	pub version: Strng,
	pub created_at: SystemTime,
	pub source: Strng,
	pub listen_addr: String,
	pub tls_enabled: bool,
	pub tls: Option<Arc<rustls::ServerConfig>>,
	pub routes: RouteIndex,
	pub pools: HashMap<PoolKey, Arc<PoolRuntime>>,
	pub policies: HashMap<RouteId, Arc<RoutePolicy>>,
	pub limits: Limits,
	pub shutdown: ShutdownRuntime,
}

impl Snapshot {
	/// The pre-config snapshot: rejects everything with 404.
	pub fn empty() -> Snapshot {
		Snapshot {
			version: strng::literal!("empty"),
			created_at: SystemTime::now(),
			source: strng::literal!("init"),
			listen_addr: String::new(),
			tls_enabled: false,
			tls: None,
			routes: RouteIndex::default(),
			pools: HashMap::new(),
			policies: HashMap::new(),
			limits: Limits::default(),
			shutdown: (&crate::config::ShutdownConfig::default()).into(),
		}
	}

	pub fn policy(&self, route: &RouteId) -> Option<Arc<RoutePolicy>> {
		self.policies.get(route).cloned()
	}

	pub fn pool(&self, key: &PoolKey) -> Option<Arc<PoolRuntime>> {
		self.pools.get(key).cloned()
	}
}

impl std::fmt::Debug for Snapshot {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Snapshot")
			.field("version", &self.version)
			.field("source", &self.source)
			.field("routes", &self.routes.len())
			.field("pools", &self.pools.len())
			.finish()
	}
}

/// The single atomic reference to the current snapshot. Reads are lock-free;
/// a reader's handle stays valid for its whole request regardless of swaps.
pub struct Store {
	current: ArcSwap<Snapshot>,
}

impl Store {
	pub fn new(initial: Arc<Snapshot>) -> Store {
		Store {
			current: ArcSwap::new(initial),
		}
	}

	pub fn get(&self) -> Arc<Snapshot> {
		self.current.load_full()
	}

	/// Publishes `next` and returns the previous snapshot.
	pub fn swap(&self, next: Arc<Snapshot>) -> Arc<Snapshot> {
		self.current.swap(next)
	}
}

impl Default for Store {
	fn default() -> Self {
		Store::new(Arc::new(Snapshot::empty()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn route(id: &str, host: &str, prefix: &str, methods: Option<&[Method]>) -> Arc<CompiledRoute> {
		Arc::new(CompiledRoute {
			id: strng::new(id),
			host: host.to_string(),
			path_prefix: prefix.to_string(),
			methods: methods.map(|m| m.iter().cloned().collect()),
			pool: strng::new("p"),
		})
	}

	#[test]
	fn first_match_wins_in_declaration_order() {
		let index = RouteIndex::new(vec![
			route("api", "example.com", "/api", None),
			route("all", "example.com", "/", None),
		]);
		assert_eq!(
			index
				.matches("example.com", "/api/v1", &Method::GET)
				.unwrap()
				.id,
			strng::new("api")
		);
		assert_eq!(
			index
				.matches("example.com", "/other", &Method::GET)
				.unwrap()
				.id,
			strng::new("all")
		);
	}

	#[test]
	fn host_is_exact_and_case_insensitive() {
		let index = RouteIndex::new(vec![route("r", "example.com", "/", None)]);
		assert!(index.matches("Example.COM", "/", &Method::GET).is_some());
		assert!(index.matches("sub.example.com", "/", &Method::GET).is_none());
	}

	#[test]
	fn empty_host_matches_anything() {
		let index = RouteIndex::new(vec![route("r", "", "/", None)]);
		assert!(index.matches("whatever", "/x", &Method::GET).is_some());
	}

	#[test]
	fn methods_filter() {
		let index = RouteIndex::new(vec![route("r", "", "/", Some(&[Method::GET]))]);
		assert!(index.matches("h", "/", &Method::GET).is_some());
		assert!(index.matches("h", "/", &Method::POST).is_none());
	}

	#[test]
	fn store_swap_returns_previous() {
		let store = Store::default();
		let first = store.get();
		assert_eq!(first.version, strng::new("empty"));
		let mut next = Snapshot::empty();
		next.version = strng::new("v2");
		let prev = store.swap(Arc::new(next));
		assert_eq!(prev.version, strng::new("empty"));
		assert_eq!(store.get().version, strng::new("v2"));
		// The old handle remains readable after the swap.
		assert_eq!(first.version, strng::new("empty"));
	}
}
