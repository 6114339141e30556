//! Rolling response-status window, read by the rollout gate.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::clock;
use crate::http::StatusCode;

struct Bucket {
	second: u64,
	total: u64,
	fivexx: u64,
}

/// Per-second buckets over a bounded horizon; reads sum the buckets inside
/// the requested window.
pub struct RollingCounter {
	buckets: Mutex<VecDeque<Bucket>>,
	horizon: Duration,
}

impl RollingCounter {
	pub fn new(horizon: Duration) -> RollingCounter {
		RollingCounter {
			buckets: Mutex::new(VecDeque::new()),
			horizon,
		}
	}

	pub fn record(&self, status: StatusCode, now: Instant) {
		let second = clock::millis(now) / 1000;
		let mut buckets = self.buckets.lock().expect("rolling lock poisoned");
		match buckets.back_mut() {
			Some(b) if b.second == second => {
				b.total += 1;
				if status.is_server_error() {
					b.fivexx += 1;
				}
			},
			_ => {
				buckets.push_back(Bucket {
					second,
					total: 1,
					fivexx: if status.is_server_error() { 1 } else { 0 },
				});
			},
		}
		let min = second.saturating_sub(self.horizon.as_secs().max(1) * 2);
		while matches!(buckets.front(), Some(b) if b.second < min) {
			buckets.pop_front();
		}
	}

	/// Totals over the trailing `window` ending at `now`.
	pub fn snapshot(&self, window: Duration, now: Instant) -> (u64, u64) {
		let second = clock::millis(now) / 1000;
		let min = second.saturating_sub(window.as_secs().max(1));
		let buckets = self.buckets.lock().expect("rolling lock poisoned");
		let mut total = 0;
		let mut fivexx = 0;
		for b in buckets.iter() {
			if b.second > min {
				total += b.total;
				fivexx += b.fivexx;
			}
		}
		(total, fivexx)
	}
}
