//! Per-endpoint outlier detection: consecutive failures, windowed error
//! rate, and (optionally) latency P95 against the pool baseline.
//!
//! Detection state lives outside the snapshot so ejections survive config
//! swaps. Ejections are advisory: the pool runtime fails open when every
//! endpoint is suppressed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::pool::eject_backoff;
use crate::{EndpointAddr, PoolKey, clock, config};

const EJECT_DECAY: Duration = Duration::from_secs(300);
const LATENCY_RING_SIZE: usize = 128;

pub const REASON_CONSECUTIVE: &str = "consecutive_fail";
pub const REASON_ERROR_RATE: &str = "error_rate";
pub const REASON_LATENCY: &str = "latency";

/// Invoked on every ejection, with the pool, endpoint, and reason. Metrics
/// hang off this rather than a global sink.
pub type EjectObserver = Arc<dyn Fn(&PoolKey, &EndpointAddr, &'static str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct OutlierRuntime {
	pub consecutive_failures: u32,
	pub error_rate_percent: u32,
	pub error_rate_window: Duration,
	pub min_requests: u64,
	pub base_eject: Duration,
	pub max_eject: Duration,
	pub latency: Option<LatencyRuntime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatencyRuntime {
	pub multiplier: f64,
	pub min_samples: usize,
	pub eval_interval: Duration,
	pub consecutive_intervals: u32,
}

impl From<&config::OutlierConfig> for OutlierRuntime {
	fn from(c: &config::OutlierConfig) -> Self {
		OutlierRuntime {
			consecutive_failures: c.consecutive_failures,
			error_rate_percent: c.error_rate_percent,
			error_rate_window: Duration::from_millis(c.error_rate_window_ms),
			min_requests: c.min_requests,
			base_eject: Duration::from_millis(c.base_eject_ms),
			max_eject: Duration::from_millis(c.max_eject_ms),
			latency: c.latency.as_ref().map(|l| LatencyRuntime {
				multiplier: l.multiplier,
				min_samples: l.min_samples,
				eval_interval: Duration::from_millis(l.eval_interval_ms),
				consecutive_intervals: l.consecutive_intervals,
			}),
		}
	}
}

impl Default for OutlierRuntime {
	fn default() -> Self {
		(&config::OutlierConfig::default()).into()
	}
}

#[derive(Debug, Default)]
struct Window {
	start_ms: u64,
	requests: u64,
	failures: u64,
	consecutive_fails: u32,
}

/// Fixed-size ring of success latencies, in nanoseconds.
#[derive(Debug)]
struct LatencyRing {
	samples: Vec<u64>,
	next: usize,
	filled: bool,
}

impl LatencyRing {
	fn new() -> Self {
		LatencyRing {
			samples: vec![0; LATENCY_RING_SIZE],
			next: 0,
			filled: false,
		}
	}

	fn push(&mut self, nanos: u64) {
		self.samples[self.next] = nanos;
		self.next = (self.next + 1) % self.samples.len();
		if self.next == 0 {
			self.filled = true;
		}
	}

	fn snapshot(&self) -> Vec<u64> {
		if self.filled {
			self.samples.clone()
		} else {
			self.samples[..self.next].to_vec()
		}
	}
}

pub struct EndpointOutlier {
	pub addr: EndpointAddr,
	eject_until_ms: AtomicU64,
	eject_count: AtomicU32,
	last_eject_ms: AtomicU64,
	window: Mutex<Window>,
	latency: Mutex<LatencyRing>,
	latency_bad_intervals: AtomicU32,
}

impl EndpointOutlier {
	fn new(addr: EndpointAddr) -> Self {
		EndpointOutlier {
			addr,
			eject_until_ms: AtomicU64::new(0),
			eject_count: AtomicU32::new(0),
			last_eject_ms: AtomicU64::new(0),
			window: Mutex::new(Window::default()),
			latency: Mutex::new(LatencyRing::new()),
			latency_bad_intervals: AtomicU32::new(0),
		}
	}

	pub fn is_ejected(&self, now_ms: u64) -> bool {
		self.eject_until_ms.load(Ordering::Relaxed) > now_ms
	}

	pub fn eject_until_ms(&self) -> u64 {
		self.eject_until_ms.load(Ordering::Relaxed)
	}

	fn eject(&self, cfg: &OutlierRuntime, now: Instant) -> Duration {
		let now_ms = clock::millis(now);
		let last = self.last_eject_ms.load(Ordering::Relaxed);
		let mut count = self.eject_count.load(Ordering::Relaxed);
		if last != 0 && now_ms.saturating_sub(last) > EJECT_DECAY.as_millis() as u64 {
			count = 0;
		}
		count += 1;
		self.eject_count.store(count, Ordering::Relaxed);
		self.last_eject_ms.store(now_ms, Ordering::Relaxed);
		let backoff = eject_backoff(cfg.base_eject, cfg.max_eject, count);
		self
			.eject_until_ms
			.store(now_ms + backoff.as_millis() as u64, Ordering::Relaxed);
		backoff
	}

	/// Returns the ejection reason when this result tripped a detector.
	fn record(&self, cfg: &OutlierRuntime, success: bool, now: Instant) -> Option<&'static str> {
		let now_ms = clock::millis(now);
		let mut w = self.window.lock().expect("window lock poisoned");
		if w.start_ms == 0 || now_ms.saturating_sub(w.start_ms) > cfg.error_rate_window.as_millis() as u64
		{
			w.start_ms = now_ms;
			w.requests = 0;
			w.failures = 0;
		}
		w.requests += 1;
		if success {
			w.consecutive_fails = 0;
			return None;
		}
		w.failures += 1;
		w.consecutive_fails += 1;

		if cfg.consecutive_failures > 0 && w.consecutive_fails >= cfg.consecutive_failures {
			w.consecutive_fails = 0;
			drop(w);
			self.eject(cfg, now);
			return Some(REASON_CONSECUTIVE);
		}
		if w.requests >= cfg.min_requests && w.failures * 100 / w.requests >= cfg.error_rate_percent as u64
		{
			w.requests = 0;
			w.failures = 0;
			w.consecutive_fails = 0;
			drop(w);
			self.eject(cfg, now);
			return Some(REASON_ERROR_RATE);
		}
		None
	}

	fn push_latency(&self, latency: Duration) {
		self
			.latency
			.lock()
			.expect("latency lock poisoned")
			.push(latency.as_nanos() as u64);
	}
}

struct PoolOutliers {
	key: PoolKey,
	config: ArcSwap<OutlierRuntime>,
	endpoints: RwLock<HashMap<EndpointAddr, Arc<EndpointOutlier>>>,
	evaluator: Mutex<Option<AbortHandle>>,
}

impl PoolOutliers {
	fn stop_evaluator(&self) {
		if let Some(h) = self.evaluator.lock().expect("evaluator lock poisoned").take() {
			h.abort();
		}
	}
}

pub struct Registry {
	pools: RwLock<HashMap<PoolKey, Arc<PoolOutliers>>>,
	observer: EjectObserver,
	/// Validate-mode registries never spawn evaluator tasks.
	active: bool,
}

impl Registry {
	pub fn new(active: bool, observer: EjectObserver) -> Registry {
		Registry {
			pools: RwLock::new(HashMap::new()),
			observer,
			active,
		}
	}

	fn pool(&self, key: &PoolKey) -> Option<Arc<PoolOutliers>> {
		self
			.pools
			.read()
			.expect("pools lock poisoned")
			.get(key)
			.cloned()
	}

	/// Applies the desired endpoint set and config for a pool.
	pub fn reconcile(&self, key: &PoolKey, endpoints: &[EndpointAddr], cfg: OutlierRuntime) {
		let pool = {
			let mut pools = self.pools.write().expect("pools lock poisoned");
			pools
				.entry(key.clone())
				.or_insert_with(|| {
					Arc::new(PoolOutliers {
						key: key.clone(),
						config: ArcSwap::from_pointee(cfg.clone()),
						endpoints: RwLock::new(HashMap::new()),
						evaluator: Mutex::new(None),
					})
				})
				.clone()
		};
		pool.config.store(Arc::new(cfg.clone()));
		{
			let mut eps = pool.endpoints.write().expect("endpoints lock poisoned");
			let desired: std::collections::HashSet<&EndpointAddr> = endpoints.iter().collect();
			eps.retain(|addr, _| desired.contains(addr));
			for addr in endpoints {
				eps
					.entry(addr.clone())
					.or_insert_with(|| Arc::new(EndpointOutlier::new(addr.clone())));
			}
		}
		match (&cfg.latency, self.active) {
			(Some(lat), true) => {
				let weak = Arc::downgrade(&pool);
				let observer = self.observer.clone();
				let interval = lat.eval_interval;
				let handle = tokio::spawn(run_latency_evaluator(weak, observer, interval));
				let mut slot = pool.evaluator.lock().expect("evaluator lock poisoned");
				if let Some(old) = slot.replace(handle.abort_handle()) {
					old.abort();
				}
			},
			_ => pool.stop_evaluator(),
		}
	}

	/// Drops detection state for pools not in the desired set.
	pub fn retain(&self, keys: &std::collections::HashSet<PoolKey>) {
		let mut pools = self.pools.write().expect("pools lock poisoned");
		pools.retain(|key, pool| {
			let keep = keys.contains(key);
			if !keep {
				pool.stop_evaluator();
			}
			keep
		});
	}

	pub fn record_result(
		&self,
		key: &PoolKey,
		addr: &EndpointAddr,
		success: bool,
		latency: Option<Duration>,
		now: Instant,
	) {
		let Some(pool) = self.pool(key) else { return };
		let Some(ep) = pool
			.endpoints
			.read()
			.expect("endpoints lock poisoned")
			.get(addr)
			.cloned()
		else {
			return;
		};
		let cfg = pool.config.load_full();
		if success && let Some(latency) = latency {
			ep.push_latency(latency);
		}
		if let Some(reason) = ep.record(&cfg, success, now) {
			info!(pool = %key, endpoint = %addr, reason, "ejecting outlier endpoint");
			(self.observer)(key, addr, reason);
		}
	}

	pub fn is_ejected(&self, key: &PoolKey, addr: &EndpointAddr, now: Instant) -> bool {
		let now_ms = clock::millis(now);
		let Some(pool) = self.pool(key) else {
			return false;
		};
		let eps = pool.endpoints.read().expect("endpoints lock poisoned");
		eps.get(addr).map(|e| e.is_ejected(now_ms)).unwrap_or(false)
	}

	/// Runs one latency evaluation pass for a pool. Exposed for tests; the
	/// background evaluator calls this on its interval.
	pub fn evaluate_latency(&self, key: &PoolKey, now: Instant) {
		let Some(pool) = self.pool(key) else { return };
		evaluate_latency_pass(&pool, &self.observer, now);
	}

	pub fn shutdown(&self) {
		for pool in self.pools.read().expect("pools lock poisoned").values() {
			pool.stop_evaluator();
		}
	}
}

async fn run_latency_evaluator(
	pool: Weak<PoolOutliers>,
	observer: EjectObserver,
	interval: Duration,
) {
	loop {
		tokio::time::sleep(interval).await;
		let Some(pool) = pool.upgrade() else { return };
		evaluate_latency_pass(&pool, &observer, Instant::now());
	}
}

/// Compares each endpoint's P95 against the pool-wide median. An endpoint
/// must look slow for `consecutive_intervals` passes before it is ejected.
fn evaluate_latency_pass(pool: &Arc<PoolOutliers>, observer: &EjectObserver, now: Instant) {
	let cfg = pool.config.load_full();
	let Some(lat) = &cfg.latency else { return };
	let endpoints: Vec<Arc<EndpointOutlier>> = pool
		.endpoints
		.read()
		.expect("endpoints lock poisoned")
		.values()
		.cloned()
		.collect();

	let mut union = Vec::new();
	let mut per_endpoint = Vec::with_capacity(endpoints.len());
	for ep in &endpoints {
		let samples = ep.latency.lock().expect("latency lock poisoned").snapshot();
		union.extend_from_slice(&samples);
		per_endpoint.push((ep.clone(), samples));
	}
	if union.len() < lat.min_samples {
		return;
	}
	union.sort_unstable();
	let baseline = percentile(&union, 50.0);
	if baseline == 0 {
		return;
	}
	let threshold = (baseline as f64 * lat.multiplier) as u64;

	for (ep, mut samples) in per_endpoint {
		if samples.is_empty() {
			continue;
		}
		samples.sort_unstable();
		let p95 = percentile(&samples, 95.0);
		if p95 > threshold {
			let bad = ep.latency_bad_intervals.fetch_add(1, Ordering::Relaxed) + 1;
			debug!(pool = %pool.key, endpoint = %ep.addr, p95, baseline, bad, "slow endpoint interval");
			if bad >= lat.consecutive_intervals {
				ep.latency_bad_intervals.store(0, Ordering::Relaxed);
				ep.eject(&cfg, now);
				info!(pool = %pool.key, endpoint = %ep.addr, "ejecting slow endpoint");
				observer(&pool.key, &ep.addr, REASON_LATENCY);
			}
		} else {
			ep.latency_bad_intervals.store(0, Ordering::Relaxed);
		}
	}
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[u64], pct: f64) -> u64 {
	if sorted.is_empty() {
		return 0;
	}
	let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
	sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}
