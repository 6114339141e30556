//! Per-pool circuit breakers.
//!
//! Closed counts requests and failures over a rotating window; crossing the
//! failure-rate threshold (once `min_requests` have been seen) opens the
//! circuit for `open_duration`. The first `allow()` after the deadline moves
//! Open to HalfOpen, which admits at most `half_open_max_probes` concurrent
//! probes: any probe failure re-opens, a full quota of successes closes.
//!
//! `allow()` is the serializing point for half-open admission; the state a
//! pick observed earlier is advisory only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::{PoolKey, clock, config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

impl CircuitState {
	pub fn as_str(&self) -> &'static str {
		match self {
			CircuitState::Closed => "closed",
			CircuitState::Open => "open",
			CircuitState::HalfOpen => "half_open",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerRuntime {
	pub min_requests: u64,
	pub failure_rate_percent: u32,
	pub evaluation_window: Duration,
	pub open_duration: Duration,
	pub half_open_max_probes: u32,
}

impl From<&config::BreakerConfig> for BreakerRuntime {
	fn from(c: &config::BreakerConfig) -> Self {
		BreakerRuntime {
			min_requests: c.min_requests,
			failure_rate_percent: c.failure_rate_percent,
			evaluation_window: Duration::from_millis(c.evaluation_window_ms),
			open_duration: Duration::from_millis(c.open_duration_ms),
			half_open_max_probes: c.half_open_max_probes.max(1),
		}
	}
}

impl Default for BreakerRuntime {
	fn default() -> Self {
		(&config::BreakerConfig::default()).into()
	}
}

#[derive(Debug)]
enum State {
	Closed {
		window_start_ms: u64,
		requests: u64,
		failures: u64,
	},
	Open {
		open_until_ms: u64,
	},
	HalfOpen {
		in_flight: u32,
		successes: u32,
	},
}

impl State {
	fn closed(now_ms: u64) -> State {
		State::Closed {
			window_start_ms: now_ms,
			requests: 0,
			failures: 0,
		}
	}

	fn kind(&self) -> CircuitState {
		match self {
			State::Closed { .. } => CircuitState::Closed,
			State::Open { .. } => CircuitState::Open,
			State::HalfOpen { .. } => CircuitState::HalfOpen,
		}
	}
}

/// Invoked on every state transition; the pipeline hangs the breaker gauge
/// off this.
pub type TransitionObserver = Arc<dyn Fn(&PoolKey, CircuitState) + Send + Sync>;

pub struct Breaker {
	pub key: PoolKey,
	config: ArcSwap<BreakerRuntime>,
	state: Mutex<State>,
	observer: TransitionObserver,
}

impl Breaker {
	fn new(key: PoolKey, cfg: BreakerRuntime, observer: TransitionObserver) -> Breaker {
		Breaker {
			key,
			config: ArcSwap::from_pointee(cfg),
			state: Mutex::new(State::closed(clock::now())),
			observer,
		}
	}

	pub fn state(&self) -> CircuitState {
		self.state.lock().expect("state lock poisoned").kind()
	}

	fn transition(&self, state: &mut State, next: State) {
		let from = state.kind();
		let to = next.kind();
		*state = next;
		if from != to {
			info!(pool = %self.key, from = from.as_str(), to = to.as_str(), "circuit transition");
			(self.observer)(&self.key, to);
		}
	}

	/// Admission check. Returns false when the circuit rejects the request.
	pub fn allow(&self, now: Instant) -> bool {
		let cfg = self.config.load_full();
		let now_ms = clock::millis(now);
		let mut state = self.state.lock().expect("state lock poisoned");
		match &mut *state {
			State::Closed { .. } => true,
			State::Open { open_until_ms } => {
				if now_ms >= *open_until_ms {
					// First request through after the deadline becomes the probe.
					self.transition(&mut state, State::HalfOpen {
						in_flight: 1,
						successes: 0,
					});
					true
				} else {
					false
				}
			},
			State::HalfOpen {
				in_flight,
				successes,
			} => {
				if *in_flight + *successes < cfg.half_open_max_probes {
					*in_flight += 1;
					true
				} else {
					false
				}
			},
		}
	}

	/// Records the outcome of an admitted request.
	pub fn record(&self, success: bool, now: Instant) {
		let cfg = self.config.load_full();
		let now_ms = clock::millis(now);
		let mut state = self.state.lock().expect("state lock poisoned");
		match &mut *state {
			State::Closed {
				window_start_ms,
				requests,
				failures,
			} => {
				if now_ms.saturating_sub(*window_start_ms) > cfg.evaluation_window.as_millis() as u64 {
					*window_start_ms = now_ms;
					*requests = 0;
					*failures = 0;
				}
				*requests += 1;
				if !success {
					*failures += 1;
				}
				if *requests >= cfg.min_requests
					&& *failures * 100 / *requests >= cfg.failure_rate_percent as u64
				{
					let open_until_ms = now_ms + cfg.open_duration.as_millis() as u64;
					self.transition(&mut state, State::Open { open_until_ms });
				}
			},
			State::Open { .. } => {
				// Late result from a request admitted before opening.
				debug!(pool = %self.key, "result recorded while open, ignoring");
			},
			State::HalfOpen {
				in_flight,
				successes,
			} => {
				*in_flight = in_flight.saturating_sub(1);
				if !success {
					let open_until_ms = now_ms + cfg.open_duration.as_millis() as u64;
					self.transition(&mut state, State::Open { open_until_ms });
				} else {
					*successes += 1;
					if *successes >= cfg.half_open_max_probes {
						self.transition(&mut state, State::closed(now_ms));
					}
				}
			},
		}
	}
}

/// Breakers keyed by pool, shared across snapshots. Config hot-swaps
/// preserve state.
pub struct Registry {
	breakers: RwLock<HashMap<PoolKey, Arc<Breaker>>>,
	observer: TransitionObserver,
}

impl Registry {
	pub fn new(observer: TransitionObserver) -> Registry {
		Registry {
			breakers: RwLock::new(HashMap::new()),
			observer,
		}
	}

	pub fn get(&self, key: &PoolKey) -> Option<Arc<Breaker>> {
		self
			.breakers
			.read()
			.expect("breakers lock poisoned")
			.get(key)
			.cloned()
	}

	pub fn reconcile(&self, key: &PoolKey, cfg: BreakerRuntime) -> Arc<Breaker> {
		let mut map = self.breakers.write().expect("breakers lock poisoned");
		match map.get(key) {
			Some(b) => {
				b.config.store(Arc::new(cfg));
				b.clone()
			},
			None => {
				let b = Arc::new(Breaker::new(key.clone(), cfg, self.observer.clone()));
				map.insert(key.clone(), b.clone());
				b
			},
		}
	}

	pub fn retain(&self, keys: &std::collections::HashSet<PoolKey>) {
		self
			.breakers
			.write()
			.expect("breakers lock poisoned")
			.retain(|key, _| keys.contains(key));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::strng;

	fn breaker(cfg: BreakerRuntime) -> Breaker {
		Breaker::new(strng::new("p"), cfg, Arc::new(|_, _| {}))
	}

	fn cfg() -> BreakerRuntime {
		BreakerRuntime {
			min_requests: 10,
			failure_rate_percent: 50,
			evaluation_window: Duration::from_secs(1),
			open_duration: Duration::from_millis(500),
			half_open_max_probes: 1,
		}
	}

	#[test]
	fn opens_at_threshold_and_rejects() {
		let b = breaker(cfg());
		let now = Instant::now();
		for i in 0..10 {
			assert!(b.allow(now));
			b.record(i % 2 == 0, now);
		}
		assert_eq!(b.state(), CircuitState::Open);
		assert!(!b.allow(now + Duration::from_millis(100)));
	}

	#[test]
	fn below_min_requests_never_opens() {
		let b = breaker(cfg());
		let now = Instant::now();
		for _ in 0..9 {
			assert!(b.allow(now));
			b.record(false, now);
		}
		assert_eq!(b.state(), CircuitState::Closed);
	}

	#[test]
	fn half_open_probe_closes_on_success() {
		let b = breaker(cfg());
		let now = Instant::now();
		for _ in 0..10 {
			b.record(false, now);
		}
		assert_eq!(b.state(), CircuitState::Open);

		let after = now + Duration::from_millis(501);
		assert!(b.allow(after));
		assert_eq!(b.state(), CircuitState::HalfOpen);
		// Quota is one probe; a second concurrent request is rejected.
		assert!(!b.allow(after));
		b.record(true, after);
		assert_eq!(b.state(), CircuitState::Closed);
	}

	#[test]
	fn half_open_probe_failure_reopens() {
		let b = breaker(cfg());
		let now = Instant::now();
		for _ in 0..10 {
			b.record(false, now);
		}
		let after = now + Duration::from_millis(501);
		assert!(b.allow(after));
		b.record(false, after);
		assert_eq!(b.state(), CircuitState::Open);
		assert!(!b.allow(after + Duration::from_millis(100)));
	}

	#[test]
	fn multiple_half_open_probes_all_must_succeed() {
		let b = breaker(BreakerRuntime {
			half_open_max_probes: 3,
			..cfg()
		});
		let now = Instant::now();
		for _ in 0..10 {
			b.record(false, now);
		}
		let after = now + Duration::from_millis(501);
		assert!(b.allow(after));
		assert!(b.allow(after));
		assert!(b.allow(after));
		assert!(!b.allow(after));
		b.record(true, after);
		b.record(true, after);
		assert_eq!(b.state(), CircuitState::HalfOpen);
		b.record(true, after);
		assert_eq!(b.state(), CircuitState::Closed);
	}

	#[test]
	fn window_rotation_resets_counts() {
		let b = breaker(cfg());
		let now = Instant::now();
		for _ in 0..5 {
			b.record(false, now);
		}
		// Next window: the five failures above are forgotten.
		let later = now + Duration::from_millis(1100);
		for _ in 0..9 {
			b.record(false, later);
		}
		assert_eq!(b.state(), CircuitState::Closed);
		b.record(false, later);
		assert_eq!(b.state(), CircuitState::Open);
	}

	#[test]
	fn config_swap_preserves_state() {
		let reg = Registry::new(Arc::new(|_, _| {}));
		let key = strng::new("p");
		let b = reg.reconcile(&key, cfg());
		let now = Instant::now();
		for _ in 0..10 {
			b.record(false, now);
		}
		assert_eq!(b.state(), CircuitState::Open);
		let b2 = reg.reconcile(&key, BreakerRuntime {
			open_duration: Duration::from_millis(100),
			..cfg()
		});
		assert!(Arc::ptr_eq(&b, &b2));
		assert_eq!(b2.state(), CircuitState::Open);
	}
}
