//! Pool runtimes: endpoint lifecycle, round-robin selection, active probes.
//!
//! Pool runtimes live in a registry owned above the snapshot and are
//! reconciled in place during config swaps, so endpoint health, outlier
//! counters, and keepalive connections survive updates. Endpoints removed by
//! a reconfiguration transition to `Draining`: they stop accepting new picks
//! but finish in-flight requests, and are reaped once idle past their
//! deadline. The only way out of `Draining` is the reaper, or the exact same
//! address being re-added by a later reconfiguration.

pub mod breaker;
pub mod outlier;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::client::{ClientConfig, HttpClient};
use crate::config;
use crate::{EndpointAddr, PoolKey, clock};

/// Ejection counts decay after this much time without a new ejection.
const EJECT_DECAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointState {
	Healthy = 0,
	Unhealthy = 1,
	Draining = 2,
}

impl EndpointState {
	fn from_u8(v: u8) -> EndpointState {
		match v {
			1 => EndpointState::Unhealthy,
			2 => EndpointState::Draining,
			_ => EndpointState::Healthy,
		}
	}
}

/// Active + passive health settings, compiled from config once per apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthRuntime {
	pub interval: Duration,
	pub path: String,
	pub timeout: Duration,
	pub healthy_threshold: u32,
	pub unhealthy_threshold: u32,
	pub base_eject: Duration,
	pub max_eject: Duration,
	pub passive_failure_threshold: u32,
}

impl From<&config::HealthConfig> for HealthRuntime {
	fn from(c: &config::HealthConfig) -> Self {
		HealthRuntime {
			interval: Duration::from_millis(c.interval_ms),
			path: c.path.clone(),
			timeout: Duration::from_millis(c.timeout_ms),
			healthy_threshold: c.healthy_threshold,
			unhealthy_threshold: c.unhealthy_threshold,
			base_eject: Duration::from_millis(c.base_eject_ms),
			max_eject: Duration::from_millis(c.max_eject_ms),
			passive_failure_threshold: c.passive_failure_threshold,
		}
	}
}

impl Default for HealthRuntime {
	fn default() -> Self {
		(&config::HealthConfig::default()).into()
	}
}

/// Exponential ejection backoff: base doubles per consecutive ejection,
/// capped at max.
pub fn eject_backoff(base: Duration, max: Duration, eject_count: u32) -> Duration {
	let shift = eject_count.saturating_sub(1).min(32);
	let ms = (base.as_millis() as u64).saturating_mul(1u64 << shift);
	Duration::from_millis(ms).min(max)
}

#[derive(Debug)]
pub struct EndpointRuntime {
	pub addr: SocketAddr,
	pub addr_str: EndpointAddr,
	state: AtomicU8,
	eject_until_ms: AtomicU64,
	consecutive_active_fails: AtomicU32,
	consecutive_active_successes: AtomicU32,
	consecutive_passive_fails: AtomicU32,
	inflight: AtomicU64,
	eject_count: AtomicU32,
	last_eject_ms: AtomicU64,
	last_healthy_ms: AtomicU64,
	last_seen_ms: AtomicU64,
	drain_until_ms: AtomicU64,
	probe: Mutex<Option<AbortHandle>>,
}

impl EndpointRuntime {
	fn new(addr_str: EndpointAddr, addr: SocketAddr, now: Instant) -> Self {
		EndpointRuntime {
			addr,
			addr_str,
			state: AtomicU8::new(EndpointState::Healthy as u8),
			eject_until_ms: AtomicU64::new(0),
			consecutive_active_fails: AtomicU32::new(0),
			consecutive_active_successes: AtomicU32::new(0),
			consecutive_passive_fails: AtomicU32::new(0),
			inflight: AtomicU64::new(0),
			eject_count: AtomicU32::new(0),
			last_eject_ms: AtomicU64::new(0),
			last_healthy_ms: AtomicU64::new(clock::millis(now)),
			last_seen_ms: AtomicU64::new(0),
			drain_until_ms: AtomicU64::new(0),
			probe: Mutex::new(None),
		}
	}

	pub fn state(&self) -> EndpointState {
		EndpointState::from_u8(self.state.load(Ordering::Acquire))
	}

	fn set_state(&self, s: EndpointState) {
		self.state.store(s as u8, Ordering::Release);
	}

	pub fn inflight(&self) -> u64 {
		self.inflight.load(Ordering::Relaxed)
	}

	/// Tracks one in-flight request; the guard decrements on drop.
	pub fn inflight_guard(self: &Arc<Self>) -> InflightGuard {
		self.inflight.fetch_add(1, Ordering::Relaxed);
		InflightGuard(self.clone())
	}

	pub fn is_locally_ejected(&self, now_ms: u64) -> bool {
		self.eject_until_ms.load(Ordering::Relaxed) > now_ms
	}

	pub fn eject_count(&self) -> u32 {
		self.eject_count.load(Ordering::Relaxed)
	}

	pub fn eject_until_ms(&self) -> u64 {
		self.eject_until_ms.load(Ordering::Relaxed)
	}

	/// Applies the exponential ejection backoff and returns its duration.
	fn eject(&self, base: Duration, max: Duration, now: Instant) -> Duration {
		let now_ms = clock::millis(now);
		let last = self.last_eject_ms.load(Ordering::Relaxed);
		let mut count = self.eject_count.load(Ordering::Relaxed);
		if last != 0 && now_ms.saturating_sub(last) > EJECT_DECAY.as_millis() as u64 {
			count = 0;
		}
		count += 1;
		self.eject_count.store(count, Ordering::Relaxed);
		self.last_eject_ms.store(now_ms, Ordering::Relaxed);
		let backoff = eject_backoff(base, max, count);
		self
			.eject_until_ms
			.store(now_ms + backoff.as_millis() as u64, Ordering::Relaxed);
		backoff
	}

	/// Records an active probe result and drives the health state machine.
	pub fn record_active_result(&self, ok: bool, cfg: &HealthRuntime, now: Instant) {
		if self.state() == EndpointState::Draining {
			return;
		}
		if ok {
			self.consecutive_active_fails.store(0, Ordering::Relaxed);
			let successes = self
				.consecutive_active_successes
				.fetch_add(1, Ordering::Relaxed)
				+ 1;
			if self.state() == EndpointState::Unhealthy && successes >= cfg.healthy_threshold {
				info!(endpoint = %self.addr_str, "endpoint recovered");
				self.set_state(EndpointState::Healthy);
				self.eject_until_ms.store(0, Ordering::Relaxed);
			}
			if self.state() == EndpointState::Healthy {
				self
					.last_healthy_ms
					.store(clock::millis(now), Ordering::Relaxed);
			}
		} else {
			self.consecutive_active_successes.store(0, Ordering::Relaxed);
			let fails = self.consecutive_active_fails.fetch_add(1, Ordering::Relaxed) + 1;
			if self.state() == EndpointState::Healthy && fails >= cfg.unhealthy_threshold {
				let backoff = self.eject(cfg.base_eject, cfg.max_eject, now);
				warn!(endpoint = %self.addr_str, ?backoff, "endpoint unhealthy, ejecting");
				self.set_state(EndpointState::Unhealthy);
			}
		}
	}

	/// Records a data path result. Enough consecutive failures locally eject
	/// the endpoint on the same backoff schedule as active probes.
	pub fn record_passive_result(&self, ok: bool, cfg: &HealthRuntime, now: Instant) {
		if ok {
			self.consecutive_passive_fails.store(0, Ordering::Relaxed);
			if self.state() == EndpointState::Healthy {
				self
					.last_healthy_ms
					.store(clock::millis(now), Ordering::Relaxed);
			}
			return;
		}
		let fails = self
			.consecutive_passive_fails
			.fetch_add(1, Ordering::Relaxed)
			+ 1;
		if cfg.passive_failure_threshold > 0 && fails >= cfg.passive_failure_threshold {
			let backoff = self.eject(cfg.base_eject, cfg.max_eject, now);
			debug!(endpoint = %self.addr_str, ?backoff, "passive failures exceeded threshold, ejecting");
			self.consecutive_passive_fails.store(0, Ordering::Relaxed);
		}
	}

	fn start_draining(&self, drain_timeout: Duration, now: Instant) {
		self.set_state(EndpointState::Draining);
		self.drain_until_ms.store(
			clock::millis(now) + drain_timeout.as_millis() as u64,
			Ordering::Relaxed,
		);
		self.stop_probe();
	}

	/// An endpoint re-added before reaping is restored with its counters
	/// intact.
	fn restore(&self) {
		self.set_state(EndpointState::Healthy);
		self.drain_until_ms.store(0, Ordering::Relaxed);
	}

	fn reapable(&self, now_ms: u64) -> bool {
		self.state() == EndpointState::Draining
			&& self.inflight() == 0
			&& self.drain_until_ms.load(Ordering::Relaxed) < now_ms
	}

	fn set_probe(&self, handle: AbortHandle) {
		let mut slot = self.probe.lock().expect("probe lock poisoned");
		if let Some(old) = slot.replace(handle) {
			old.abort();
		}
	}

	fn stop_probe(&self) {
		if let Some(h) = self.probe.lock().expect("probe lock poisoned").take() {
			h.abort();
		}
	}
}

pub struct InflightGuard(Arc<EndpointRuntime>);

impl Drop for InflightGuard {
	fn drop(&mut self) {
		self.0.inflight.fetch_sub(1, Ordering::Relaxed);
	}
}

pub struct PickResult {
	pub endpoint: Arc<EndpointRuntime>,
	pub selected_healthy: bool,
	pub selected_fail_open: bool,
	pub outlier_ignored: bool,
	pub endpoint_ejected: bool,
}

struct EndpointSet {
	by_addr: HashMap<EndpointAddr, Arc<EndpointRuntime>>,
	order: Vec<EndpointAddr>,
}

pub struct PoolRuntime {
	pub key: PoolKey,
	endpoints: RwLock<EndpointSet>,
	rr: AtomicUsize,
	drain_timeout_ms: AtomicU64,
	health: Mutex<HealthRuntime>,
	client: ArcSwap<HttpClient>,
	condemned: AtomicBool,
}

impl PoolRuntime {
	fn new(key: PoolKey, client_cfg: ClientConfig) -> PoolRuntime {
		PoolRuntime {
			key,
			endpoints: RwLock::new(EndpointSet {
				by_addr: HashMap::new(),
				order: Vec::new(),
			}),
			rr: AtomicUsize::new(0),
			drain_timeout_ms: AtomicU64::new(30_000),
			health: Mutex::new(HealthRuntime::default()),
			client: ArcSwap::from_pointee(HttpClient::new(client_cfg)),
			condemned: AtomicBool::new(false),
		}
	}

	pub fn client(&self) -> Arc<HttpClient> {
		self.client.load_full()
	}

	pub fn health(&self) -> HealthRuntime {
		self.health.lock().expect("health lock poisoned").clone()
	}

	pub fn endpoint(&self, addr: &EndpointAddr) -> Option<Arc<EndpointRuntime>> {
		self
			.endpoints
			.read()
			.expect("endpoints lock poisoned")
			.by_addr
			.get(addr)
			.cloned()
	}

	pub fn endpoints(&self) -> Vec<Arc<EndpointRuntime>> {
		let set = self.endpoints.read().expect("endpoints lock poisoned");
		set
			.order
			.iter()
			.filter_map(|a| set.by_addr.get(a))
			.cloned()
			.collect()
	}

	pub fn endpoint_addrs(&self) -> Vec<EndpointAddr> {
		self
			.endpoints
			.read()
			.expect("endpoints lock poisoned")
			.order
			.clone()
	}

	/// Selects an endpoint.
	///
	/// Preference order: round-robin over fully eligible endpoints; failing
	/// that, fail-open over non-draining endpoints (ignoring ejections);
	/// failing that, anything at all, draining included.
	pub fn pick(
		&self,
		now: Instant,
		outlier_ejected: impl Fn(&EndpointAddr) -> bool,
	) -> Option<PickResult> {
		let now_ms = clock::millis(now);
		let all = self.endpoints();
		if all.is_empty() {
			return None;
		}

		let mut eligible = Vec::with_capacity(all.len());
		let mut non_draining = Vec::with_capacity(all.len());
		let mut outlier_suppressed = false;
		for ep in &all {
			let draining = ep.state() == EndpointState::Draining;
			if !draining {
				non_draining.push(ep.clone());
			}
			if !draining && ep.state() == EndpointState::Healthy && !ep.is_locally_ejected(now_ms) {
				if outlier_ejected(&ep.addr_str) {
					outlier_suppressed = true;
				} else {
					eligible.push(ep.clone());
				}
			}
		}

		let (set, selected_healthy, selected_fail_open, outlier_ignored) = if !eligible.is_empty() {
			(eligible, true, false, false)
		} else if !non_draining.is_empty() {
			(non_draining, false, true, outlier_suppressed)
		} else {
			(all, false, true, outlier_suppressed)
		};

		let idx = self.rr.fetch_add(1, Ordering::Relaxed) % set.len();
		let endpoint = set[idx].clone();
		endpoint.last_seen_ms.store(now_ms, Ordering::Relaxed);
		let endpoint_ejected =
			endpoint.is_locally_ejected(now_ms) || outlier_ejected(&endpoint.addr_str);
		Some(PickResult {
			endpoint,
			selected_healthy,
			selected_fail_open,
			outlier_ignored,
			endpoint_ejected,
		})
	}

	fn reap(&self, now_ms: u64) {
		let mut set = self.endpoints.write().expect("endpoints lock poisoned");
		let dead: Vec<EndpointAddr> = set
			.by_addr
			.iter()
			.filter(|(_, ep)| ep.reapable(now_ms))
			.map(|(a, _)| a.clone())
			.collect();
		for addr in dead {
			debug!(pool = %self.key, endpoint = %addr, "reaping drained endpoint");
			if let Some(ep) = set.by_addr.remove(&addr) {
				ep.stop_probe();
			}
			set.order.retain(|a| a != &addr);
		}
	}

	fn stop_all_probes(&self) {
		for ep in self.endpoints() {
			ep.stop_probe();
		}
	}
}

/// Registry of pool runtimes, shared by every snapshot.
pub struct Registry {
	pools: RwLock<HashMap<PoolKey, Arc<PoolRuntime>>>,
	/// Validate-mode registries never spawn probe tasks.
	active: bool,
}

impl Registry {
	pub fn new(active: bool) -> Registry {
		Registry {
			pools: RwLock::new(HashMap::new()),
			active,
		}
	}

	pub fn get(&self, key: &PoolKey) -> Option<Arc<PoolRuntime>> {
		self
			.pools
			.read()
			.expect("pools lock poisoned")
			.get(key)
			.cloned()
	}

	pub fn pools(&self) -> Vec<Arc<PoolRuntime>> {
		self
			.pools
			.read()
			.expect("pools lock poisoned")
			.values()
			.cloned()
			.collect()
	}

	/// Brings the pool's endpoint set in line with `desired`: inserts new
	/// endpoints (starting probes when active probing is configured), updates
	/// config on survivors, and marks removed ones draining.
	pub fn reconcile(
		&self,
		key: &PoolKey,
		desired: &[(EndpointAddr, SocketAddr)],
		health: HealthRuntime,
		drain_timeout: Duration,
		client_cfg: ClientConfig,
		now: Instant,
	) -> Arc<PoolRuntime> {
		let pool = {
			let mut pools = self.pools.write().expect("pools lock poisoned");
			pools
				.entry(key.clone())
				.or_insert_with(|| Arc::new(PoolRuntime::new(key.clone(), client_cfg.clone())))
				.clone()
		};
		pool.condemned.store(false, Ordering::Relaxed);
		pool
			.drain_timeout_ms
			.store(drain_timeout.as_millis() as u64, Ordering::Relaxed);
		if pool.client().config() != &client_cfg {
			pool.client.store(Arc::new(HttpClient::new(client_cfg)));
		}
		let health_changed = {
			let mut h = pool.health.lock().expect("health lock poisoned");
			let changed = *h != health;
			*h = health.clone();
			changed
		};

		let desired_addrs: HashSet<&EndpointAddr> = desired.iter().map(|(a, _)| a).collect();
		let mut added = Vec::new();
		{
			let mut set = pool.endpoints.write().expect("endpoints lock poisoned");
			for (addr_str, addr) in desired {
				match set.by_addr.get(addr_str) {
					Some(existing) => {
						if existing.state() == EndpointState::Draining {
							debug!(pool = %key, endpoint = %addr_str, "restoring draining endpoint");
							existing.restore();
							added.push(existing.clone());
						} else if health_changed {
							// Probe loop re-reads config each tick; restart
							// only so a disabled interval stops promptly.
							added.push(existing.clone());
						}
					},
					None => {
						let ep = Arc::new(EndpointRuntime::new(addr_str.clone(), *addr, now));
						set.by_addr.insert(addr_str.clone(), ep.clone());
						added.push(ep);
					},
				}
			}
			for (addr_str, ep) in set.by_addr.iter() {
				if !desired_addrs.contains(addr_str) && ep.state() != EndpointState::Draining {
					info!(pool = %key, endpoint = %addr_str, "endpoint removed, draining");
					ep.start_draining(drain_timeout, now);
				}
			}
			// Desired order first, then draining leftovers in their old order.
			let mut order: Vec<EndpointAddr> = desired.iter().map(|(a, _)| a.clone()).collect();
			for a in &set.order {
				if !desired_addrs.contains(a) && set.by_addr.contains_key(a) {
					order.push(a.clone());
				}
			}
			set.order = order;
		}

		if self.active && health.interval > Duration::ZERO {
			for ep in added {
				spawn_probe(&pool, ep);
			}
		} else if health.interval.is_zero() {
			for ep in pool.endpoints() {
				ep.stop_probe();
			}
		}
		pool
	}

	/// Marks pools absent from the desired set: their endpoints drain and the
	/// pool is dropped once empty.
	pub fn retain(&self, keys: &HashSet<PoolKey>, now: Instant) {
		let pools = self.pools.read().expect("pools lock poisoned");
		for (key, pool) in pools.iter() {
			if !keys.contains(key) && !pool.condemned.swap(true, Ordering::Relaxed) {
				info!(pool = %key, "pool removed, draining endpoints");
				let drain = Duration::from_millis(pool.drain_timeout_ms.load(Ordering::Relaxed));
				for ep in pool.endpoints() {
					if ep.state() != EndpointState::Draining {
						ep.start_draining(drain, now);
					}
				}
			}
		}
	}

	/// Deletes endpoints that finished draining, and condemned pools that
	/// have no endpoints left.
	pub fn reap(&self, now: Instant) {
		let now_ms = clock::millis(now);
		let pools = self.pools();
		for pool in &pools {
			pool.reap(now_ms);
		}
		let mut map = self.pools.write().expect("pools lock poisoned");
		map.retain(|_, pool| {
			let empty = pool
				.endpoints
				.read()
				.expect("endpoints lock poisoned")
				.by_addr
				.is_empty();
			!(pool.condemned.load(Ordering::Relaxed) && empty)
		});
	}

	pub fn shutdown(&self) {
		for pool in self.pools() {
			pool.stop_all_probes();
		}
	}
}

fn spawn_probe(pool: &Arc<PoolRuntime>, ep: Arc<EndpointRuntime>) {
	let weak = Arc::downgrade(pool);
	let ep_clone = ep.clone();
	let handle = tokio::spawn(run_probe(weak, ep_clone));
	ep.set_probe(handle.abort_handle());
}

async fn run_probe(pool: Weak<PoolRuntime>, ep: Arc<EndpointRuntime>) {
	loop {
		let Some(pool) = pool.upgrade() else { return };
		let health = pool.health();
		let client = pool.client();
		drop(pool);
		if health.interval.is_zero() {
			return;
		}
		// Spread probes so endpoints of a pool are not hit in lockstep.
		let jitter = rand::random_range(0..=health.interval.as_millis() as u64 / 10);
		tokio::time::sleep(health.interval + Duration::from_millis(jitter)).await;
		if ep.state() == EndpointState::Draining {
			return;
		}
		let req = ::http::Request::builder()
			.method(::http::Method::GET)
			.uri(health.path.as_str())
			.body(crate::http::Body::empty())
			.expect("probe request builder cannot fail");
		let res = tokio::time::timeout(health.timeout, client.call(req, ep.addr, None)).await;
		let ok = matches!(
			&res,
			Ok(Ok(resp)) if resp.status().is_success() || resp.status().is_redirection()
		);
		ep.record_active_result(ok, &health, Instant::now());
	}
}
