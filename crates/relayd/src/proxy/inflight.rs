//! Counts in-flight requests for overload checks and graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

pub struct Tracker {
	count: AtomicU64,
	idle: Notify,
}

impl Tracker {
	pub fn new() -> Arc<Tracker> {
		Arc::new(Tracker {
			count: AtomicU64::new(0),
			idle: Notify::new(),
		})
	}

	pub fn count(&self) -> u64 {
		self.count.load(Ordering::Acquire)
	}

	pub fn acquire(self: &Arc<Self>) -> Guard {
		self.count.fetch_add(1, Ordering::AcqRel);
		Guard(self.clone())
	}

	/// Waits until no requests remain, or `timeout` elapses. Returns whether
	/// the tracker actually reached zero.
	pub async fn wait_idle(&self, timeout: Duration) -> bool {
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			if self.count() == 0 {
				return true;
			}
			let notified = self.idle.notified();
			if self.count() == 0 {
				return true;
			}
			if tokio::time::timeout_at(deadline, notified).await.is_err() {
				return self.count() == 0;
			}
		}
	}
}

pub struct Guard(Arc<Tracker>);

impl Drop for Guard {
	fn drop(&mut self) {
		if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
			self.0.idle.notify_waiters();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn waits_for_active_requests() {
		let tracker = Tracker::new();
		let guard = tracker.acquire();
		assert_eq!(tracker.count(), 1);
		assert!(!tracker.wait_idle(Duration::from_millis(20)).await);

		let t2 = tracker.clone();
		let waiter = tokio::spawn(async move { t2.wait_idle(Duration::from_secs(5)).await });
		tokio::time::sleep(Duration::from_millis(20)).await;
		drop(guard);
		assert!(waiter.await.unwrap());
		assert_eq!(tracker.count(), 0);
	}

	#[tokio::test]
	async fn idle_tracker_returns_immediately() {
		let tracker = Tracker::new();
		assert!(tracker.wait_idle(Duration::from_millis(1)).await);
	}
}
