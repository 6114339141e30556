//! Pure, deterministic validation of a merged [Config].

use std::collections::HashSet;

use crate::Strng;
use crate::config::Config;

/// Hard floor for the retry budget ratio; anything below effectively
/// disables retries while still paying for the machinery.
pub const RETRY_BUDGET_RATIO_FLOOR: f64 = 0.01;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
	#[error("duplicate route id {0:?}")]
	DuplicateRoute(Strng),
	#[error("route {route:?} references unknown pool {pool:?}")]
	UnknownPool { route: Strng, pool: Strng },
	#[error("pool {0:?} has no endpoints")]
	EmptyPool(Strng),
	#[error("pool {pool:?} endpoint {endpoint:?} is not a valid socket address")]
	BadEndpoint { pool: Strng, endpoint: String },
	#[error("tls is enabled but no certificates are configured")]
	TlsWithoutCerts,
	#[error("route {route:?} cache ttl must be positive")]
	NonPositiveCacheTtl { route: Strng },
	#[error("route {route:?} traffic weights {stable}/{canary} must each be in [0,100] and sum to 100")]
	BadTrafficWeights {
		route: Strng,
		stable: u32,
		canary: u32,
	},
	#[error("route {route:?} retry budget ratio {ratio} is below the floor {floor}")]
	RetryBudgetBelowFloor {
		route: Strng,
		ratio: f64,
		floor: f64,
	},
	#[error("route {route:?} retry budget minPerSecond must be at least 1")]
	RetryBudgetZeroFloor { route: Strng },
	#[error("route {route:?} requires mTLS but no client CA is configured")]
	MtlsWithoutCa { route: Strng },
	#[error("route {route:?} has an invalid method {method:?}")]
	BadMethod { route: Strng, method: String },
}

/// Non-fatal findings surfaced alongside a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
	pub object: Strng,
	pub message: String,
}

/// Checks every config invariant. Pure: no I/O, no clocks, deterministic
/// output order (routes in declaration order, pools in key order).
pub fn validate(cfg: &Config) -> Result<Vec<Warning>, ValidationError> {
	let mut warnings = Vec::new();

	let mut seen = HashSet::new();
	for route in &cfg.routes {
		if !seen.insert(route.id.clone()) {
			return Err(ValidationError::DuplicateRoute(route.id.clone()));
		}
		if !cfg.pools.contains_key(&route.pool) {
			return Err(ValidationError::UnknownPool {
				route: route.id.clone(),
				pool: route.pool.clone(),
			});
		}
		if let Some(traffic) = &route.policy.traffic {
			if let Some(canary) = &traffic.canary_pool
				&& !cfg.pools.contains_key(canary)
			{
				return Err(ValidationError::UnknownPool {
					route: route.id.clone(),
					pool: canary.clone(),
				});
			}
			if traffic.stable_weight > 100
				|| traffic.canary_weight > 100
				|| traffic.stable_weight + traffic.canary_weight != 100
			{
				return Err(ValidationError::BadTrafficWeights {
					route: route.id.clone(),
					stable: traffic.stable_weight,
					canary: traffic.canary_weight,
				});
			}
			if traffic.enabled && traffic.canary_weight > 0 && traffic.canary_pool.is_none() {
				warnings.push(Warning {
					object: route.id.clone(),
					message: "canary traffic uses the stable pool with a separate label".to_string(),
				});
			}
		}
		if let Some(cache) = &route.policy.cache
			&& cache.enabled && cache.ttl_ms == 0
		{
			return Err(ValidationError::NonPositiveCacheTtl {
				route: route.id.clone(),
			});
		}
		if let Some(budget) = &route.policy.retry_budget {
			if budget.ratio < RETRY_BUDGET_RATIO_FLOOR {
				return Err(ValidationError::RetryBudgetBelowFloor {
					route: route.id.clone(),
					ratio: budget.ratio,
					floor: RETRY_BUDGET_RATIO_FLOOR,
				});
			}
			if budget.min_per_second == 0 {
				return Err(ValidationError::RetryBudgetZeroFloor {
					route: route.id.clone(),
				});
			}
		}
		if route.policy.require_mtls
			&& route.policy.mtls_client_ca.is_none()
			&& cfg
				.tls
				.as_ref()
				.and_then(|t| t.client_ca_file.as_ref())
				.is_none()
		{
			return Err(ValidationError::MtlsWithoutCa {
				route: route.id.clone(),
			});
		}
		for method in &route.methods {
			if http::Method::from_bytes(method.as_bytes()).is_err() {
				return Err(ValidationError::BadMethod {
					route: route.id.clone(),
					method: method.clone(),
				});
			}
		}
		if route.methods.is_empty() {
			warnings.push(Warning {
				object: route.id.clone(),
				message: "no methods configured, route matches all methods".to_string(),
			});
		}
	}

	for (key, pool) in &cfg.pools {
		if pool.endpoints.is_empty() {
			return Err(ValidationError::EmptyPool(key.clone()));
		}
		for endpoint in &pool.endpoints {
			if endpoint.parse::<std::net::SocketAddr>().is_err() {
				return Err(ValidationError::BadEndpoint {
					pool: key.clone(),
					endpoint: endpoint.clone(),
				});
			}
		}
	}

	if let Some(tls) = &cfg.tls
		&& tls.enabled && tls.certs.is_empty()
	{
		return Err(ValidationError::TlsWithoutCerts);
	}

	Ok(warnings)
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;
	use crate::config::{CacheConfig, Pool, Route, TrafficConfig};
	use crate::strng;

	fn base() -> Config {
		Config::parse(
			br#"{
			"routes": [{"id": "r1", "pool": "p1", "methods": ["GET"]}],
			"pools": {"p1": {"endpoints": ["127.0.0.1:9001"]}}
		}"#,
		)
		.unwrap()
	}

	#[test]
	fn accepts_valid_config() {
		assert_eq!(validate(&base()).unwrap(), vec![]);
	}

	#[test]
	fn warns_on_missing_methods() {
		let mut cfg = base();
		cfg.routes[0].methods.clear();
		let warnings = validate(&cfg).unwrap();
		assert_eq!(warnings.len(), 1);
		assert_eq!(warnings[0].object, strng::new("r1"));
	}

	#[test]
	fn rejects_duplicate_route_ids() {
		let mut cfg = base();
		let dup = cfg.routes[0].clone();
		cfg.routes.push(dup);
		assert_matches!(validate(&cfg), Err(ValidationError::DuplicateRoute(_)));
	}

	#[test]
	fn rejects_unknown_pool() {
		let mut cfg = base();
		cfg.routes.push(Route {
			id: strng::new("r2"),
			host: String::new(),
			path_prefix: "/".into(),
			methods: vec![],
			pool: strng::new("absent"),
			policy: Default::default(),
			overlay: false,
		});
		assert_matches!(validate(&cfg), Err(ValidationError::UnknownPool { .. }));
	}

	#[test]
	fn rejects_empty_pool() {
		let mut cfg = base();
		cfg.pools.insert(strng::new("p2"), Pool::default());
		assert_matches!(validate(&cfg), Err(ValidationError::EmptyPool(_)));
	}

	#[test]
	fn rejects_zero_cache_ttl() {
		let mut cfg = base();
		cfg.routes[0].policy.cache = Some(CacheConfig {
			enabled: true,
			ttl_ms: 0,
			max_object_bytes: 1024,
			vary_headers: vec![],
		});
		assert_matches!(
			validate(&cfg),
			Err(ValidationError::NonPositiveCacheTtl { .. })
		);
	}

	#[test]
	fn rejects_bad_traffic_weights() {
		let mut cfg = base();
		cfg.routes[0].policy.traffic = Some(TrafficConfig {
			enabled: true,
			stable_weight: 80,
			canary_weight: 30,
			canary_pool: None,
			cohort_header: None,
			cohort_cookie: None,
		});
		assert_matches!(
			validate(&cfg),
			Err(ValidationError::BadTrafficWeights { .. })
		);
	}
}
