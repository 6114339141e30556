//! Top-K label canonicalisation.
//!
//! Prometheus series are permanent for the life of the process, so route and
//! pool labels coming from config (or worse, from traffic) must be bounded.
//! A space-saving sketch tracks approximate per-label counts; only the top K
//! labels keep their identity, everything else becomes `other`. A periodic
//! recompute refreshes the hot set and decays counts so yesterday's hot
//! routes age out.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::{Strng, strng};

pub const OTHER: Strng = strng::literal!("other");

struct Inner {
	counts: HashMap<Strng, u64>,
	hot: HashSet<Strng>,
}

pub struct TopK {
	capacity: usize,
	max_tracked: usize,
	inner: Mutex<Inner>,
}

impl TopK {
	pub fn new(capacity: usize) -> TopK {
		TopK {
			capacity,
			max_tracked: capacity * 4,
			inner: Mutex::new(Inner {
				counts: HashMap::new(),
				hot: HashSet::new(),
			}),
		}
	}

	/// Counts one observation of `key` and returns the label to use for it.
	pub fn observe(&self, key: &Strng) -> Strng {
		let mut inner = self.inner.lock().expect("topk lock poisoned");
		match inner.counts.get_mut(key) {
			Some(count) => *count += 1,
			None => {
				if inner.counts.len() < self.max_tracked {
					inner.counts.insert(key.clone(), 1);
				} else {
					// Space-saving: the new key takes over the smallest slot with
					// its count plus one, bounding the error by the minimum.
					let min = inner
						.counts
						.iter()
						.min_by_key(|(_, c)| **c)
						.map(|(k, c)| (k.clone(), *c));
					if let Some((min_key, min_count)) = min {
						inner.counts.remove(&min_key);
						inner.counts.insert(key.clone(), min_count + 1);
					}
				}
			},
		}
		if inner.hot.contains(key) {
			return key.clone();
		}
		// Warmup: while few labels exist, everything keeps its identity.
		if inner.counts.len() <= self.capacity {
			inner.hot.insert(key.clone());
			return key.clone();
		}
		OTHER
	}

	/// Rebuilds the hot set from the current counts and decays them. Run on
	/// a fixed interval.
	pub fn recompute(&self) {
		let mut inner = self.inner.lock().expect("topk lock poisoned");
		let mut ranked: Vec<(Strng, u64)> = inner
			.counts
			.iter()
			.map(|(k, c)| (k.clone(), *c))
			.collect();
		ranked.sort_by(|a, b| b.1.cmp(&a.1));
		inner.hot = ranked
			.iter()
			.take(self.capacity)
			.map(|(k, _)| k.clone())
			.collect();
		// Exponential decay keeps the sketch responsive to shifts.
		inner.counts.retain(|_, c| {
			*c /= 2;
			*c > 0
		});
	}

	pub fn hot_len(&self) -> usize {
		self.inner.lock().expect("topk lock poisoned").hot.len()
	}
}
