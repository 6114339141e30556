//! Stable/canary traffic splitting.
//!
//! Cohort assignment is sticky: the same cookie, header value, or client IP
//! always lands in the same bucket, so a user does not flap between variants
//! while a canary is running.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use crate::http::{HeaderMap, HeaderName, header};
use crate::{PoolKey, RouteId, config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
	Stable,
	Canary,
}

impl Variant {
	pub fn as_str(&self) -> &'static str {
		match self {
			Variant::Stable => "stable",
			Variant::Canary => "canary",
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrafficSplit {
	pub enabled: bool,
	pub stable_weight: u32,
	pub canary_weight: u32,
	pub canary_pool: Option<PoolKey>,
	pub cohort_header: Option<HeaderName>,
	pub cohort_cookie: Option<String>,
}

impl TryFrom<&config::TrafficConfig> for TrafficSplit {
	type Error = anyhow::Error;

	fn try_from(c: &config::TrafficConfig) -> anyhow::Result<TrafficSplit> {
		Ok(TrafficSplit {
			enabled: c.enabled,
			stable_weight: c.stable_weight,
			canary_weight: c.canary_weight,
			canary_pool: c.canary_pool.clone(),
			cohort_header: c
				.cohort_header
				.as_ref()
				.map(|h| {
					HeaderName::from_bytes(h.as_bytes()).map_err(|e| anyhow::anyhow!("cohort header {h}: {e}"))
				})
				.transpose()?,
			cohort_cookie: c.cohort_cookie.clone(),
		})
	}
}

impl TrafficSplit {
	/// Hashes the cohort key (cookie, else header, else client IP) into one
	/// of 100 buckets; the top `canary_weight` buckets are canary.
	pub fn select(&self, headers: &HeaderMap, client_ip: IpAddr) -> Variant {
		if !self.enabled || self.canary_weight == 0 {
			return Variant::Stable;
		}
		let key = self
			.cookie_value(headers)
			.or_else(|| self.header_value(headers))
			.unwrap_or_else(|| client_ip.to_string());
		let mut hasher = std::collections::hash_map::DefaultHasher::new();
		key.hash(&mut hasher);
		let bucket = (hasher.finish() % 100) as u32;
		if bucket < self.stable_weight {
			Variant::Stable
		} else {
			Variant::Canary
		}
	}

	fn header_value(&self, headers: &HeaderMap) -> Option<String> {
		let name = self.cohort_header.as_ref()?;
		headers
			.get(name)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string())
	}

	fn cookie_value(&self, headers: &HeaderMap) -> Option<String> {
		let name = self.cohort_cookie.as_ref()?;
		for value in headers.get_all(header::COOKIE) {
			let Ok(s) = value.to_str() else { continue };
			for pair in s.split(';') {
				let pair = pair.trim();
				if let Some((k, v)) = pair.split_once('=')
					&& k == name
				{
					return Some(v.to_string());
				}
			}
		}
		None
	}
}

/// Per-route split config, kept beside (not inside) the snapshot so the
/// rollout manager can force traffic to stable without a full rebuild.
pub struct Registry {
	splits: RwLock<HashMap<RouteId, Arc<TrafficSplit>>>,
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}

impl Registry {
	pub fn new() -> Registry {
		Registry {
			splits: RwLock::new(HashMap::new()),
		}
	}

	pub fn set(&self, route: &RouteId, split: TrafficSplit) {
		self
			.splits
			.write()
			.expect("splits lock poisoned")
			.insert(route.clone(), Arc::new(split));
	}

	pub fn get(&self, route: &RouteId) -> Option<Arc<TrafficSplit>> {
		self
			.splits
			.read()
			.expect("splits lock poisoned")
			.get(route)
			.cloned()
	}

	pub fn remove(&self, route: &RouteId) {
		self
			.splits
			.write()
			.expect("splits lock poisoned")
			.remove(route);
	}

	pub fn retain(&self, keys: &std::collections::HashSet<RouteId>) {
		self
			.splits
			.write()
			.expect("splits lock poisoned")
			.retain(|key, _| keys.contains(key));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::strng;

	fn split(stable: u32, canary: u32) -> TrafficSplit {
		TrafficSplit {
			enabled: true,
			stable_weight: stable,
			canary_weight: canary,
			canary_pool: Some(strng::new("canary")),
			cohort_header: Some(HeaderName::from_static("x-user")),
			cohort_cookie: Some("session".to_string()),
		}
	}

	#[test]
	fn assignment_is_sticky() {
		let s = split(50, 50);
		let mut headers = HeaderMap::new();
		headers.insert("x-user", "alice".parse().unwrap());
		let ip = "10.0.0.1".parse().unwrap();
		let first = s.select(&headers, ip);
		for _ in 0..50 {
			assert_eq!(s.select(&headers, ip), first);
		}
	}

	#[test]
	fn cookie_takes_precedence_over_header() {
		let s = split(50, 50);
		let mut by_cookie = HeaderMap::new();
		by_cookie.insert(header::COOKIE, "a=1; session=u1".parse().unwrap());
		by_cookie.insert("x-user", "other".parse().unwrap());
		let mut by_cookie_only = HeaderMap::new();
		by_cookie_only.insert(header::COOKIE, "session=u1".parse().unwrap());
		let ip = "10.0.0.1".parse().unwrap();
		assert_eq!(s.select(&by_cookie, ip), s.select(&by_cookie_only, ip));
	}

	#[test]
	fn weights_roughly_split_cohorts() {
		let s = split(80, 20);
		let mut canary = 0;
		for i in 0..1000 {
			let mut headers = HeaderMap::new();
			headers.insert("x-user", format!("user-{i}").parse().unwrap());
			if s.select(&headers, "10.0.0.1".parse().unwrap()) == Variant::Canary {
				canary += 1;
			}
		}
		// 20% of 1000 with generous hashing slack
		assert!((100..=320).contains(&canary), "canary share: {canary}");
	}

	#[test]
	fn zero_canary_weight_is_always_stable() {
		let s = split(100, 0);
		let headers = HeaderMap::new();
		for i in 0..100 {
			let ip: IpAddr = format!("10.0.0.{i}").parse().unwrap();
			assert_eq!(s.select(&headers, ip), Variant::Stable);
		}
	}
}
