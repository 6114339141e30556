//! Configuration providers and the priority-ordered merge.
//!
//! Providers are merged in ascending priority order: the lowest priority is
//! the base, an admin push is the highest. Within the same priority, provider
//! name breaks the tie, so the result never depends on iteration order.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::Strng;
use crate::config::{Config, Pool, Route};

pub trait Provider: Send + Sync {
	fn name(&self) -> Strng;
	fn priority(&self) -> u32;
	fn load(&self) -> anyhow::Result<Config>;
}

/// Reads a JSON config from disk on every load.
pub struct FileProvider {
	pub name: Strng,
	pub priority: u32,
	pub path: PathBuf,
}

impl Provider for FileProvider {
	fn name(&self) -> Strng {
		self.name.clone()
	}
	fn priority(&self) -> u32 {
		self.priority
	}
	fn load(&self) -> anyhow::Result<Config> {
		let bytes = std::fs::read(&self.path)?;
		Config::parse(&bytes)
	}
}

/// Holds an already-parsed config; used for admin pushes and tests.
pub struct StaticProvider {
	pub name: Strng,
	pub priority: u32,
	pub config: Config,
}

impl Provider for StaticProvider {
	fn name(&self) -> Strng {
		self.name.clone()
	}
	fn priority(&self) -> u32 {
		self.priority
	}
	fn load(&self) -> anyhow::Result<Config> {
		Ok(self.config.clone())
	}
}

/// A provider's loaded output, tagged for conflict reporting.
pub struct Loaded {
	pub name: Strng,
	pub priority: u32,
	pub config: Config,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error(
	"conflicting {object_type} {object_id:?}: field {field:?} differs between providers {existing_provider:?} and {incoming_provider:?}"
)]
pub struct ConflictError {
	pub object_type: &'static str,
	pub object_id: Strng,
	pub field: String,
	pub existing_provider: Strng,
	pub incoming_provider: Strng,
}

pub fn load_all(providers: &[std::sync::Arc<dyn Provider>]) -> anyhow::Result<Vec<Loaded>> {
	providers
		.iter()
		.map(|p| {
			Ok(Loaded {
				name: p.name(),
				priority: p.priority(),
				config: p
					.load()
					.map_err(|e| anyhow::anyhow!("provider {}: {e}", p.name()))?,
			})
		})
		.collect()
}

/// Merges provider outputs into one [Config].
///
/// * `listen_addr`, `tls`, `shutdown`: first non-empty wins; a later,
///   different, non-empty value is a conflict.
/// * routes (by id) and pools (by name): first writer wins; a later entry is
///   accepted iff deep-equal, or marked `overlay` and differing only in the
///   overlayable fields (traffic weights for routes, endpoints for pools).
pub fn merge(mut loaded: Vec<Loaded>) -> Result<Config, ConflictError> {
	loaded.sort_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));

	let mut out = Config::default();
	let mut listen_owner: Option<Strng> = None;
	let mut tls_owner: Option<Strng> = None;
	let mut shutdown_owner: Option<Strng> = None;
	let mut route_owner: HashMap<Strng, (usize, Strng)> = HashMap::new();
	let mut pool_owner: HashMap<Strng, Strng> = HashMap::new();

	for source in loaded {
		let provider = source.name;
		let cfg = source.config;

		if !cfg.listen_addr.is_empty() {
			match &listen_owner {
				None => {
					out.listen_addr = cfg.listen_addr;
					listen_owner = Some(provider.clone());
				},
				Some(owner) if out.listen_addr != cfg.listen_addr => {
					return Err(ConflictError {
						object_type: "config",
						object_id: crate::strng::literal!("listen_addr"),
						field: "listen_addr".to_string(),
						existing_provider: owner.clone(),
						incoming_provider: provider,
					});
				},
				Some(_) => {},
			}
		}
		if let Some(tls) = cfg.tls {
			match &tls_owner {
				None => {
					out.tls = Some(tls);
					tls_owner = Some(provider.clone());
				},
				Some(owner) if out.tls.as_ref() != Some(&tls) => {
					return Err(ConflictError {
						object_type: "config",
						object_id: crate::strng::literal!("tls"),
						field: "tls".to_string(),
						existing_provider: owner.clone(),
						incoming_provider: provider,
					});
				},
				Some(_) => {},
			}
		}
		if let Some(shutdown) = cfg.shutdown {
			match &shutdown_owner {
				None => {
					out.shutdown = Some(shutdown);
					shutdown_owner = Some(provider.clone());
				},
				Some(owner) if out.shutdown.as_ref() != Some(&shutdown) => {
					return Err(ConflictError {
						object_type: "config",
						object_id: crate::strng::literal!("shutdown"),
						field: "shutdown".to_string(),
						existing_provider: owner.clone(),
						incoming_provider: provider,
					});
				},
				Some(_) => {},
			}
		}

		for route in cfg.routes {
			match route_owner.get(&route.id) {
				None => {
					route_owner.insert(route.id.clone(), (out.routes.len(), provider.clone()));
					out.routes.push(route);
				},
				Some((idx, owner)) => {
					let base = &mut out.routes[*idx];
					match route_first_diff(base, &route, route.overlay) {
						None => {
							if route.overlay
								&& let (Some(bt), Some(it)) = (&mut base.policy.traffic, &route.policy.traffic)
							{
								bt.stable_weight = it.stable_weight;
								bt.canary_weight = it.canary_weight;
							}
						},
						Some(field) => {
							return Err(ConflictError {
								object_type: "route",
								object_id: route.id.clone(),
								field,
								existing_provider: owner.clone(),
								incoming_provider: provider,
							});
						},
					}
				},
			}
		}

		for (key, pool) in cfg.pools {
			match pool_owner.get(&key) {
				None => {
					pool_owner.insert(key.clone(), provider.clone());
					out.pools.insert(key, pool);
				},
				Some(owner) => {
					let base = out.pools.get_mut(&key).expect("owner implies presence");
					match pool_first_diff(base, &pool, pool.overlay) {
						None => {
							if pool.overlay {
								base.endpoints = pool.endpoints;
							}
						},
						Some(field) => {
							return Err(ConflictError {
								object_type: "pool",
								object_id: key,
								field,
								existing_provider: owner.clone(),
								incoming_provider: provider,
							});
						},
					}
				},
			}
		}
	}

	Ok(out)
}

fn json_eq<T: Serialize>(a: &T, b: &T) -> bool {
	// Compare via the serialized form so f64 fields (budget ratios,
	// latency multipliers) compare the way operators wrote them.
	serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

/// Reports the first differing field between two routes, in the deterministic
/// tie-break order: host, path_prefix, methods, pool, then policy fields in
/// declaration order. With `allow_traffic_weights`, weight-only differences
/// inside `policy.traffic` are permitted.
fn route_first_diff(base: &Route, incoming: &Route, allow_traffic_weights: bool) -> Option<String> {
	if base.host != incoming.host {
		return Some("host".to_string());
	}
	if base.path_prefix != incoming.path_prefix {
		return Some("path_prefix".to_string());
	}
	if base.methods != incoming.methods {
		return Some("methods".to_string());
	}
	if base.pool != incoming.pool {
		return Some("pool".to_string());
	}
	let b = &base.policy;
	let i = &incoming.policy;
	if b.request_timeout_ms != i.request_timeout_ms {
		return Some("policy.request_timeout_ms".to_string());
	}
	if b.dial_timeout_ms != i.dial_timeout_ms {
		return Some("policy.dial_timeout_ms".to_string());
	}
	if b.response_header_timeout_ms != i.response_header_timeout_ms {
		return Some("policy.response_header_timeout_ms".to_string());
	}
	if b.require_mtls != i.require_mtls {
		return Some("policy.require_mtls".to_string());
	}
	if b.mtls_client_ca != i.mtls_client_ca {
		return Some("policy.mtls_client_ca".to_string());
	}
	if b.retry != i.retry {
		return Some("policy.retry".to_string());
	}
	if !json_eq(&b.retry_budget, &i.retry_budget) {
		return Some("policy.retry_budget".to_string());
	}
	if b.client_retry_cap != i.client_retry_cap {
		return Some("policy.client_retry_cap".to_string());
	}
	if b.cache != i.cache {
		return Some("policy.cache".to_string());
	}
	if b.plugins != i.plugins {
		return Some("policy.plugins".to_string());
	}
	match (&b.traffic, &i.traffic) {
		(None, None) => {},
		(Some(bt), Some(it)) => {
			let weights_differ = bt.stable_weight != it.stable_weight || bt.canary_weight != it.canary_weight;
			let rest_differ = bt.enabled != it.enabled
				|| bt.canary_pool != it.canary_pool
				|| bt.cohort_header != it.cohort_header
				|| bt.cohort_cookie != it.cohort_cookie;
			if rest_differ || (weights_differ && !allow_traffic_weights) {
				return Some("policy.traffic".to_string());
			}
		},
		_ => return Some("policy.traffic".to_string()),
	}
	None
}

fn pool_first_diff(base: &Pool, incoming: &Pool, allow_endpoints: bool) -> Option<String> {
	if base.endpoints != incoming.endpoints && !allow_endpoints {
		return Some("endpoints".to_string());
	}
	if base.health != incoming.health {
		return Some("health".to_string());
	}
	if base.breaker != incoming.breaker {
		return Some("breaker".to_string());
	}
	if !json_eq(&base.outlier, &incoming.outlier) {
		return Some("outlier".to_string());
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::strng;

	fn loaded(name: &str, priority: u32, json: &[u8]) -> Loaded {
		Loaded {
			name: strng::new(name),
			priority,
			config: Config::parse(json).unwrap(),
		}
	}

	#[test]
	fn first_non_empty_listen_addr_wins() {
		let merged = merge(vec![
			loaded("base", 0, br#"{"listenAddr": ":8080"}"#),
			loaded("push", 10, br#"{}"#),
		])
		.unwrap();
		assert_eq!(merged.listen_addr, ":8080");
	}

	#[test]
	fn conflicting_listen_addr_names_both_providers() {
		let err = merge(vec![
			loaded("base", 0, br#"{"listenAddr": ":8080"}"#),
			loaded("push", 10, br#"{"listenAddr": ":9090"}"#),
		])
		.unwrap_err();
		assert_eq!(err.field, "listen_addr");
		assert_eq!(err.existing_provider, strng::new("base"));
		assert_eq!(err.incoming_provider, strng::new("push"));
	}

	#[test]
	fn identical_routes_merge_cleanly() {
		let route = br#"{"routes": [{"id": "x", "host": "a", "pool": "p"}], "pools": {"p": {"endpoints": ["127.0.0.1:1"]}}}"#;
		let merged = merge(vec![loaded("a", 0, route), loaded("b", 0, route)]).unwrap();
		assert_eq!(merged.routes.len(), 1);
	}

	#[test]
	fn route_conflict_is_deterministic() {
		// Same priority: ordering falls back to provider name, so the result
		// is independent of input order.
		let a = br#"{"routes": [{"id": "x", "host": "a", "pool": "p"}]}"#;
		let b = br#"{"routes": [{"id": "x", "host": "b", "pool": "p"}]}"#;
		for inputs in [
			vec![loaded("alpha", 5, a), loaded("beta", 5, b)],
			vec![loaded("beta", 5, b), loaded("alpha", 5, a)],
		] {
			let err = merge(inputs).unwrap_err();
			assert_eq!(err.object_type, "route");
			assert_eq!(err.object_id, strng::new("x"));
			assert_eq!(err.field, "host");
			assert_eq!(err.existing_provider, strng::new("alpha"));
			assert_eq!(err.incoming_provider, strng::new("beta"));
		}
	}

	#[test]
	fn overlay_route_may_adjust_weights_only() {
		let base = br#"{"routes": [{"id": "x", "pool": "p",
			"policy": {"traffic": {"stableWeight": 100, "canaryWeight": 0, "canaryPool": "p2"}}}]}"#;
		let overlay = br#"{"routes": [{"id": "x", "pool": "p", "overlay": true,
			"policy": {"traffic": {"stableWeight": 90, "canaryWeight": 10, "canaryPool": "p2"}}}]}"#;
		let merged = merge(vec![loaded("a", 0, base), loaded("b", 10, overlay)]).unwrap();
		let traffic = merged.routes[0].policy.traffic.as_ref().unwrap();
		assert_eq!(traffic.stable_weight, 90);
		assert_eq!(traffic.canary_weight, 10);
	}

	#[test]
	fn overlay_route_rejects_other_diffs() {
		let base = br#"{"routes": [{"id": "x", "pool": "p"}]}"#;
		let overlay = br#"{"routes": [{"id": "x", "pool": "q", "overlay": true}]}"#;
		let err = merge(vec![loaded("a", 0, base), loaded("b", 10, overlay)]).unwrap_err();
		assert_eq!(err.field, "pool");
	}

	#[test]
	fn overlay_pool_may_replace_endpoints() {
		let base = br#"{"pools": {"p": {"endpoints": ["127.0.0.1:1"]}}}"#;
		let overlay =
			br#"{"pools": {"p": {"endpoints": ["127.0.0.1:1", "127.0.0.1:2"], "overlay": true}}}"#;
		let merged = merge(vec![loaded("a", 0, base), loaded("b", 10, overlay)]).unwrap();
		assert_eq!(merged.pools["p"].endpoints.len(), 2);
	}

	#[test]
	fn non_overlay_pool_endpoint_diff_conflicts() {
		let base = br#"{"pools": {"p": {"endpoints": ["127.0.0.1:1"]}}}"#;
		let other = br#"{"pools": {"p": {"endpoints": ["127.0.0.1:2"]}}}"#;
		let err = merge(vec![loaded("a", 0, base), loaded("b", 10, other)]).unwrap_err();
		assert_eq!(err.object_type, "pool");
		assert_eq!(err.field, "endpoints");
	}
}
