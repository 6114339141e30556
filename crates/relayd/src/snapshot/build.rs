//! Snapshot compilation: config in, immutable runtime view out.
//!
//! The builder is handed the live registries; pool, breaker, outlier, and
//! budget state is reconciled in place rather than rebuilt, so endpoint
//! health and breaker windows survive the swap. Everything else (routes,
//! policies, TLS) is constructed fresh and owned by the snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use ring::digest;
use tracing::debug;

use crate::cache::CachePolicy;
use crate::client::ClientConfig;
use crate::config::Config;
use crate::pool::outlier::{self, OutlierRuntime};
use crate::pool::{self, HealthRuntime, breaker};
use crate::snapshot::{CompiledRoute, Limits, RouteIndex, RoutePolicy, Snapshot};
use crate::transport::tls;
use crate::{PoolKey, RouteId, Strng, retry, strng, traffic};

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Long-lived state shared by every snapshot built against it. The live set
/// backs the data path; validate-mode applies build against a throwaway set.
pub struct Registries {
	pub pools: Arc<pool::Registry>,
	pub outliers: Arc<outlier::Registry>,
	pub breakers: Arc<breaker::Registry>,
	pub traffic: Arc<traffic::Registry>,
	pub budgets: Arc<retry::Registry>,
}

impl Registries {
	pub fn new(
		active: bool,
		eject_observer: outlier::EjectObserver,
		breaker_observer: breaker::TransitionObserver,
	) -> Registries {
		Registries {
			pools: Arc::new(pool::Registry::new(active)),
			outliers: Arc::new(outlier::Registry::new(active, eject_observer)),
			breakers: Arc::new(breaker::Registry::new(breaker_observer)),
			traffic: Arc::new(traffic::Registry::new()),
			budgets: Arc::new(retry::Registry::new()),
		}
	}

	/// Isolated registries for validate mode: no probe or evaluator tasks,
	/// no observers, and nothing shared with the data path.
	pub fn throwaway() -> Registries {
		Registries::new(false, Arc::new(|_, _, _| {}), Arc::new(|_, _| {}))
	}

	pub fn shutdown(&self) {
		self.pools.shutdown();
		self.outliers.shutdown();
	}
}

pub fn version_of(bytes: &[u8]) -> Strng {
	strng::new(hex::encode(digest::digest(&digest::SHA256, bytes)))
}

/// Compiles `cfg` into a [Snapshot], reconciling `regs` in place.
///
/// `raw` is the source bytes the version is derived from; when absent the
/// canonical JSON form of the config is hashed instead.
pub fn build(
	cfg: &Config,
	raw: Option<&[u8]>,
	source: Strng,
	regs: &Registries,
	now: Instant,
) -> anyhow::Result<Arc<Snapshot>> {
	let version = match raw {
		Some(bytes) => version_of(bytes),
		None => version_of(&serde_json::to_vec(cfg).context("canonicalize config")?),
	};

	let shutdown: crate::snapshot::ShutdownRuntime =
		(&cfg.shutdown.clone().unwrap_or_default()).into();
	let endpoint_drain = if shutdown.drain.is_zero() {
		shutdown.graceful_timeout
	} else {
		shutdown.drain
	};

	// Per-pool dial timeout: tightest route-level dial timeout wins, since
	// the connector is shared by every route on the pool.
	let mut dial_timeouts: HashMap<&Strng, Duration> = HashMap::new();
	for route in &cfg.routes {
		if let Some(ms) = route.policy.dial_timeout_ms {
			let d = Duration::from_millis(ms);
			dial_timeouts
				.entry(&route.pool)
				.and_modify(|cur| *cur = (*cur).min(d))
				.or_insert(d);
		}
	}

	let mut routes = Vec::with_capacity(cfg.routes.len());
	let mut policies: HashMap<RouteId, Arc<RoutePolicy>> = HashMap::new();
	let mut route_ids: HashSet<RouteId> = HashSet::new();
	for route in &cfg.routes {
		let methods = if route.methods.is_empty() {
			None
		} else {
			Some(
				route
					.methods
					.iter()
					.map(|m| {
						crate::http::Method::from_bytes(m.as_bytes())
							.map_err(|e| anyhow::anyhow!("route {}: method {m}: {e}", route.id))
					})
					.collect::<Result<_, _>>()?,
			)
		};
		routes.push(Arc::new(CompiledRoute {
			id: route.id.clone(),
			host: route.host.to_ascii_lowercase(),
			path_prefix: route.path_prefix.clone(),
			methods,
			pool: route.pool.clone(),
		}));

		let budget_cfg = route
			.policy
			.retry_budget
			.as_ref()
			.map(Into::into)
			.unwrap_or_default();
		let budget = regs.budgets.reconcile(&route.id, budget_cfg, now);

		let mtls_ca_subject = route
			.policy
			.mtls_client_ca
			.as_ref()
			.map(|path| tls::ca_subject(path).with_context(|| format!("route {}", route.id)))
			.transpose()?;

		let cache = route
			.policy
			.cache
			.as_ref()
			.filter(|c| c.enabled)
			.map(CachePolicy::try_from)
			.transpose()
			.with_context(|| format!("route {}", route.id))?;

		match &route.policy.traffic {
			Some(t) => {
				let split = traffic::TrafficSplit::try_from(t)
					.with_context(|| format!("route {}", route.id))?;
				regs.traffic.set(&route.id, split);
			},
			None => regs.traffic.remove(&route.id),
		}

		policies.insert(
			route.id.clone(),
			Arc::new(RoutePolicy {
				route: route.id.clone(),
				pool: route.pool.clone(),
				request_timeout: route.policy.request_timeout_ms.map(Duration::from_millis),
				response_header_timeout: route
					.policy
					.response_header_timeout_ms
					.map(Duration::from_millis),
				require_mtls: route.policy.require_mtls,
				mtls_ca_subject,
				retry: route.policy.retry.as_ref().map(Into::into),
				budget,
				client_retry_cap: route.policy.client_retry_cap,
				cache,
				plugins: route.policy.plugins.clone(),
			}),
		);
		route_ids.insert(route.id.clone());
	}

	let mut pools: HashMap<PoolKey, Arc<pool::PoolRuntime>> = HashMap::new();
	let mut pool_keys: HashSet<PoolKey> = HashSet::new();
	for (key, pool_cfg) in &cfg.pools {
		let desired: Vec<(Strng, std::net::SocketAddr)> = pool_cfg
			.endpoints
			.iter()
			.map(|e| {
				e.parse()
					.map(|addr| (strng::new(e), addr))
					.with_context(|| format!("pool {key}: endpoint {e}"))
			})
			.collect::<Result<_, _>>()?;
		let health: HealthRuntime = (&pool_cfg.health.clone().unwrap_or_default()).into();
		let client_cfg = ClientConfig {
			dial_timeout: dial_timeouts
				.get(key)
				.copied()
				.unwrap_or(DEFAULT_DIAL_TIMEOUT),
			..ClientConfig::default()
		};
		let runtime = regs
			.pools
			.reconcile(key, &desired, health, endpoint_drain, client_cfg, now);

		let addrs: Vec<Strng> = desired.iter().map(|(a, _)| a.clone()).collect();
		let outlier_cfg: OutlierRuntime = (&pool_cfg.outlier.clone().unwrap_or_default()).into();
		regs.outliers.reconcile(key, &addrs, outlier_cfg);
		regs
			.breakers
			.reconcile(key, (&pool_cfg.breaker.clone().unwrap_or_default()).into());

		pools.insert(key.clone(), runtime);
		pool_keys.insert(key.clone());
	}

	regs.pools.retain(&pool_keys, now);
	regs.outliers.retain(&pool_keys);
	regs.breakers.retain(&pool_keys);
	regs.traffic.retain(&route_ids);
	regs.budgets.retain(&route_ids);

	let tls_enabled = cfg.tls.as_ref().map(|t| t.enabled).unwrap_or(false);
	let tls = if let Some(tls_cfg) = cfg.tls.as_ref().filter(|t| t.enabled) {
		let mut ca_files: Vec<String> = Vec::new();
		if let Some(ca) = &tls_cfg.client_ca_file {
			ca_files.push(ca.clone());
		}
		for route in &cfg.routes {
			if let Some(ca) = &route.policy.mtls_client_ca
				&& !ca_files.contains(ca)
			{
				ca_files.push(ca.clone());
			}
		}
		Some(tls::build_server_config(tls_cfg, &ca_files)?)
	} else {
		None
	};

	debug!(%version, routes = routes.len(), pools = pools.len(), "compiled snapshot");
	Ok(Arc::new(Snapshot {
		version,
		created_at: SystemTime::now(),
		source,
		listen_addr: cfg.listen_addr.clone(),
		tls_enabled,
		tls,
		routes: RouteIndex::new(routes),
		pools,
		policies,
		limits: Limits::default(),
		shutdown,
	}))
}
