//! Budgeted retries with classified errors and exponential backoff.
//!
//! Every retry attempt withdraws from a per-route budget sized by the rate
//! of observed successes, so a struggling upstream is never hit with a
//! multiplied request load.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::http::{Method, StatusCode};
use crate::proxy::ProxyError;
use crate::{RouteId, config};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub per_try_timeout: Option<Duration>,
	pub backoff_base: Duration,
	pub jitter: Duration,
	pub retry_on: Vec<config::RetryOn>,
	pub non_idempotent: bool,
}

impl From<&config::RetryConfig> for RetryPolicy {
	fn from(c: &config::RetryConfig) -> Self {
		RetryPolicy {
			max_attempts: c.max_attempts.max(1),
			per_try_timeout: c.per_try_timeout_ms.map(Duration::from_millis),
			backoff_base: Duration::from_millis(c.backoff_base_ms),
			jitter: Duration::from_millis(c.jitter_ms),
			retry_on: c.retry_on.clone(),
			non_idempotent: c.non_idempotent,
		}
	}
}

impl RetryPolicy {
	/// Backoff before attempt `k` (1-based retry index):
	/// `base * 2^(k-1) + uniform(0, jitter)`.
	pub fn backoff(&self, k: u32) -> Duration {
		let shift = k.saturating_sub(1).min(16);
		let base = (self.backoff_base.as_millis() as u64).saturating_mul(1u64 << shift);
		let jitter = if self.jitter.is_zero() {
			0
		} else {
			rand::random_range(0..=self.jitter.as_millis() as u64)
		};
		Duration::from_millis(base + jitter)
	}

	pub fn method_retryable(&self, method: &Method) -> bool {
		self.non_idempotent
			|| matches!(
				*method,
				Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
			)
	}

	pub fn response_retryable(&self, status: StatusCode) -> bool {
		self.retry_on.iter().any(|on| match on {
			config::RetryOn::Http5xx => status.is_server_error(),
			config::RetryOn::GatewayError => matches!(status.as_u16(), 502 | 503 | 504),
			_ => false,
		})
	}

	pub fn error_retryable(&self, err: &ProxyError) -> bool {
		self.retry_on.iter().any(|on| match (on, err) {
			(config::RetryOn::Connect, ProxyError::UpstreamConnect(_)) => true,
			(config::RetryOn::Timeout, ProxyError::UpstreamTimeout) => true,
			_ => false,
		})
	}

	/// The total attempts for one request. A client that is itself retrying
	/// (it sent an attempt counter) is clamped by `client_retry_cap` so
	/// retries do not multiply across proxy tiers.
	pub fn effective_attempts(&self, client_retry_cap: Option<u32>, client_signaled: bool) -> u32 {
		let mut attempts = self.max_attempts;
		if client_signaled && let Some(cap) = client_retry_cap {
			attempts = attempts.min(cap.max(1));
		}
		attempts
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetConfig {
	pub ratio: f64,
	pub min_per_second: u32,
}

impl From<&config::RetryBudgetConfig> for BudgetConfig {
	fn from(c: &config::RetryBudgetConfig) -> Self {
		BudgetConfig {
			ratio: c.ratio,
			min_per_second: c.min_per_second.max(1),
		}
	}
}

impl Default for BudgetConfig {
	fn default() -> Self {
		(&config::RetryBudgetConfig::default()).into()
	}
}

#[derive(Debug)]
struct BudgetWindow {
	window_start: Instant,
	successes: u64,
	withdrawals: u64,
}

/// Per-route retry budget over a one-second window: retries allowed =
/// max(successes * ratio, min_per_second).
#[derive(Debug)]
pub struct Budget {
	state: Mutex<(BudgetConfig, BudgetWindow)>,
}

const BUDGET_WINDOW: Duration = Duration::from_secs(1);

impl Budget {
	pub fn new(cfg: BudgetConfig, now: Instant) -> Budget {
		Budget {
			state: Mutex::new((cfg, BudgetWindow {
				window_start: now,
				successes: 0,
				withdrawals: 0,
			})),
		}
	}

	fn set_config(&self, cfg: BudgetConfig) {
		self.state.lock().expect("budget lock poisoned").0 = cfg;
	}

	fn rotate(w: &mut BudgetWindow, now: Instant) {
		if now.saturating_duration_since(w.window_start) >= BUDGET_WINDOW {
			w.window_start = now;
			w.successes = 0;
			w.withdrawals = 0;
		}
	}

	pub fn record_success(&self, now: Instant) {
		let mut state = self.state.lock().expect("budget lock poisoned");
		Self::rotate(&mut state.1, now);
		state.1.successes += 1;
	}

	/// Withdraws one retry token. False means the budget is exhausted.
	pub fn try_withdraw(&self, now: Instant) -> bool {
		let mut state = self.state.lock().expect("budget lock poisoned");
		let (cfg, w) = &mut *state;
		Self::rotate(w, now);
		let allowance = (w.successes as f64 * cfg.ratio).max(cfg.min_per_second as f64);
		if (w.withdrawals as f64) + 1.0 <= allowance {
			w.withdrawals += 1;
			true
		} else {
			false
		}
	}
}

/// Budgets keyed by route, surviving snapshot swaps so a config push does
/// not refill an exhausted budget.
pub struct Registry {
	budgets: RwLock<HashMap<RouteId, Arc<Budget>>>,
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}

impl Registry {
	pub fn new() -> Registry {
		Registry {
			budgets: RwLock::new(HashMap::new()),
		}
	}

	pub fn reconcile(&self, route: &RouteId, cfg: BudgetConfig, now: Instant) -> Arc<Budget> {
		let mut map = self.budgets.write().expect("budgets lock poisoned");
		match map.get(route) {
			Some(b) => {
				b.set_config(cfg);
				b.clone()
			},
			None => {
				let b = Arc::new(Budget::new(cfg, now));
				map.insert(route.clone(), b.clone());
				b
			},
		}
	}

	pub fn get(&self, route: &RouteId) -> Option<Arc<Budget>> {
		self
			.budgets
			.read()
			.expect("budgets lock poisoned")
			.get(route)
			.cloned()
	}

	pub fn retain(&self, keys: &std::collections::HashSet<RouteId>) {
		self
			.budgets
			.write()
			.expect("budgets lock poisoned")
			.retain(|key, _| keys.contains(key));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::strng;

	fn policy(retry_on: Vec<config::RetryOn>) -> RetryPolicy {
		RetryPolicy {
			max_attempts: 3,
			per_try_timeout: None,
			backoff_base: Duration::from_millis(25),
			jitter: Duration::from_millis(25),
			retry_on,
			non_idempotent: false,
		}
	}

	#[test]
	fn budget_allows_ratio_of_successes() {
		let budget = Budget::new(
			BudgetConfig {
				ratio: 0.1,
				min_per_second: 1,
			},
			Instant::now(),
		);
		let now = Instant::now();
		for _ in 0..100 {
			budget.record_success(now);
		}
		let mut granted = 0;
		for _ in 0..20 {
			if budget.try_withdraw(now) {
				granted += 1;
			}
		}
		assert_eq!(granted, 10);
	}

	#[test]
	fn budget_floor_applies_without_successes() {
		let budget = Budget::new(
			BudgetConfig {
				ratio: 0.1,
				min_per_second: 2,
			},
			Instant::now(),
		);
		let now = Instant::now();
		assert!(budget.try_withdraw(now));
		assert!(budget.try_withdraw(now));
		assert!(!budget.try_withdraw(now));
	}

	#[test]
	fn budget_window_rotation_resets_allowance() {
		let budget = Budget::new(
			BudgetConfig {
				ratio: 0.1,
				min_per_second: 1,
			},
			Instant::now(),
		);
		let now = Instant::now();
		assert!(budget.try_withdraw(now));
		assert!(!budget.try_withdraw(now));
		let later = now + Duration::from_millis(1001);
		assert!(budget.try_withdraw(later));
	}

	#[test]
	fn backoff_grows_exponentially_with_jitter() {
		let p = policy(vec![]);
		for k in 1..=4u32 {
			let base = 25u64 * (1 << (k - 1));
			let d = p.backoff(k).as_millis() as u64;
			assert!((base..=base + 25).contains(&d), "attempt {k}: {d}");
		}
	}

	#[test]
	fn classification() {
		let p = policy(vec![config::RetryOn::Http5xx, config::RetryOn::Connect]);
		assert!(p.response_retryable(StatusCode::INTERNAL_SERVER_ERROR));
		assert!(!p.response_retryable(StatusCode::NOT_FOUND));
		assert!(p.error_retryable(&ProxyError::UpstreamConnect("x".into())));
		assert!(!p.error_retryable(&ProxyError::UpstreamTimeout));

		let p = policy(vec![config::RetryOn::GatewayError]);
		assert!(p.response_retryable(StatusCode::BAD_GATEWAY));
		assert!(!p.response_retryable(StatusCode::INTERNAL_SERVER_ERROR));
	}

	#[test]
	fn only_idempotent_methods_retry_by_default() {
		let p = policy(vec![]);
		assert!(p.method_retryable(&Method::GET));
		assert!(!p.method_retryable(&Method::POST));
		let mut p2 = p;
		p2.non_idempotent = true;
		assert!(p2.method_retryable(&Method::POST));
	}

	#[test]
	fn client_signal_clamps_attempts() {
		let p = policy(vec![]);
		assert_eq!(p.effective_attempts(Some(1), false), 3);
		assert_eq!(p.effective_attempts(Some(1), true), 1);
		assert_eq!(p.effective_attempts(None, true), 3);
	}

	#[test]
	fn registry_preserves_budget_across_reconcile() {
		let reg = Registry::new();
		let route = strng::new("r");
		let now = Instant::now();
		let b = reg.reconcile(
			&route,
			BudgetConfig {
				ratio: 0.1,
				min_per_second: 1,
			},
			now,
		);
		assert!(b.try_withdraw(now));
		assert!(!b.try_withdraw(now));
		// A config push must not refill the exhausted window.
		let b2 = reg.reconcile(
			&route,
			BudgetConfig {
				ratio: 0.1,
				min_per_second: 1,
			},
			now,
		);
		assert!(Arc::ptr_eq(&b, &b2));
		assert!(!b2.try_withdraw(now));
	}
}
