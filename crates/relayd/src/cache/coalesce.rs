//! Single-flight coalescing of identical cache misses.
//!
//! The first request for a fingerprint becomes the leader and fetches from
//! the origin; concurrent requests for the same fingerprint wait on the
//! flight's done signal and reuse the leader's buffered response. A follower
//! that waits too long breaks away and fetches on its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::debug;

use crate::Strng;
use crate::cache::CacheEntry;

pub struct Flight {
	pub started_at: Instant,
	done: watch::Receiver<bool>,
	result: OnceLock<Option<CacheEntry>>,
}

impl Flight {
	/// Waits for the leader to finish. `None` means the follower should fetch
	/// on its own: the leader failed, produced an uncacheable response, or
	/// `timeout` elapsed (a breakaway, reported separately by the caller).
	pub async fn wait(&self, timeout: Duration) -> FlightOutcome {
		let mut done = self.done.clone();
		match tokio::time::timeout(timeout, done.wait_for(|v| *v)).await {
			Ok(Ok(_)) => FlightOutcome::Finished(self.result.get().cloned().flatten()),
			// Leader dropped without finishing.
			Ok(Err(_)) => FlightOutcome::Finished(None),
			Err(_) => FlightOutcome::Breakaway,
		}
	}
}

pub enum FlightOutcome {
	Finished(Option<CacheEntry>),
	Breakaway,
}

pub enum StartResult<'a> {
	/// This request fetches from the origin and must call
	/// [LeaderGuard::finish] (dropping the guard finishes with `None`).
	Leader(LeaderGuard<'a>),
	/// Another request is already fetching this fingerprint.
	Follower(Arc<Flight>),
	/// The flight table is full; fetch directly without coalescing.
	Full,
}

struct FlightSlot {
	flight: Arc<Flight>,
	done_tx: watch::Sender<bool>,
}

pub struct Coalescer {
	flights: Mutex<HashMap<Strng, FlightSlot>>,
	max_flights: usize,
}

impl Coalescer {
	pub fn new(max_flights: usize) -> Coalescer {
		Coalescer {
			flights: Mutex::new(HashMap::new()),
			max_flights,
		}
	}

	pub fn start(&self, key: &Strng, now: Instant) -> StartResult<'_> {
		let mut flights = self.flights.lock().expect("flights lock poisoned");
		if let Some(slot) = flights.get(key) {
			return StartResult::Follower(slot.flight.clone());
		}
		if flights.len() >= self.max_flights {
			debug!(%key, "flight table full, skipping coalescing");
			return StartResult::Full;
		}
		let (done_tx, done) = watch::channel(false);
		let flight = Arc::new(Flight {
			started_at: now,
			done,
			result: OnceLock::new(),
		});
		flights.insert(key.clone(), FlightSlot {
			flight: flight.clone(),
			done_tx,
		});
		StartResult::Leader(LeaderGuard {
			coalescer: self,
			key: key.clone(),
			finished: false,
		})
	}

	fn finish(&self, key: &Strng, result: Option<CacheEntry>) {
		let slot = self
			.flights
			.lock()
			.expect("flights lock poisoned")
			.remove(key);
		if let Some(slot) = slot {
			let _ = slot.flight.result.set(result);
			let _ = slot.done_tx.send(true);
		}
	}

	pub fn inflight(&self) -> usize {
		self.flights.lock().expect("flights lock poisoned").len()
	}
}

pub struct LeaderGuard<'a> {
	coalescer: &'a Coalescer,
	key: Strng,
	finished: bool,
}

impl LeaderGuard<'_> {
	/// Publishes the leader's outcome to all waiting followers and removes
	/// the flight.
	pub fn finish(mut self, result: Option<CacheEntry>) {
		self.finished = true;
		self.coalescer.finish(&self.key, result);
	}
}

impl Drop for LeaderGuard<'_> {
	fn drop(&mut self) {
		// Leader cancelled; wake followers so they break away immediately.
		if !self.finished {
			self.coalescer.finish(&self.key, None);
		}
	}
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;

	use super::*;
	use crate::http::{HeaderMap, StatusCode};
	use crate::strng;

	fn entry(body: &str) -> CacheEntry {
		CacheEntry {
			status: StatusCode::OK,
			headers: HeaderMap::new(),
			body: Bytes::copy_from_slice(body.as_bytes()),
			stored_at: Instant::now(),
			ttl: Duration::from_secs(30),
		}
	}

	#[tokio::test]
	async fn single_leader_many_followers() {
		let coalescer = Arc::new(Coalescer::new(16));
		let key = strng::new("k");
		let StartResult::Leader(leader) = coalescer.start(&key, Instant::now()) else {
			panic!("expected leader");
		};

		let mut followers = Vec::new();
		for _ in 0..10 {
			let StartResult::Follower(flight) = coalescer.start(&key, Instant::now()) else {
				panic!("expected follower");
			};
			followers.push(tokio::spawn(async move {
				flight.wait(Duration::from_secs(1)).await
			}));
		}

		leader.finish(Some(entry("shared")));
		for f in followers {
			match f.await.unwrap() {
				FlightOutcome::Finished(Some(e)) => assert_eq!(e.body, "shared"),
				_ => panic!("follower did not receive the leader result"),
			}
		}
		assert_eq!(coalescer.inflight(), 0);
	}

	#[tokio::test]
	async fn follower_breaks_away_on_timeout() {
		let coalescer = Coalescer::new(16);
		let key = strng::new("k");
		let StartResult::Leader(_leader) = coalescer.start(&key, Instant::now()) else {
			panic!("expected leader");
		};
		let StartResult::Follower(flight) = coalescer.start(&key, Instant::now()) else {
			panic!("expected follower");
		};
		match flight.wait(Duration::from_millis(10)).await {
			FlightOutcome::Breakaway => {},
			_ => panic!("expected breakaway"),
		}
	}

	#[tokio::test]
	async fn dropped_leader_wakes_followers() {
		let coalescer = Coalescer::new(16);
		let key = strng::new("k");
		let StartResult::Leader(leader) = coalescer.start(&key, Instant::now()) else {
			panic!("expected leader");
		};
		let StartResult::Follower(flight) = coalescer.start(&key, Instant::now()) else {
			panic!("expected follower");
		};
		drop(leader);
		match flight.wait(Duration::from_secs(1)).await {
			FlightOutcome::Finished(None) => {},
			_ => panic!("expected empty result"),
		}
	}

	#[tokio::test]
	async fn full_table_bypasses_coalescing() {
		let coalescer = Coalescer::new(1);
		let _leader = coalescer.start(&strng::new("a"), Instant::now());
		match coalescer.start(&strng::new("b"), Instant::now()) {
			StartResult::Full => {},
			_ => panic!("expected full"),
		}
	}
}
