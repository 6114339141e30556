//! Typed configuration model.
//!
//! This is the wire form: parsed from JSON, merged across providers, and
//! compiled into a [crate::snapshot::Snapshot] by the snapshot builder. All
//! durations are millisecond integers here; they are converted to
//! [std::time::Duration] exactly once, during compilation.

pub mod provider;
pub mod validate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{PoolKey, RouteId, Strng};

pub use provider::{ConflictError, Provider, merge};
pub use validate::{ValidationError, Warning, validate};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub listen_addr: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tls: Option<TlsConfig>,
	#[serde(default)]
	pub routes: Vec<Route>,
	#[serde(default)]
	pub pools: BTreeMap<PoolKey, Pool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub shutdown: Option<ShutdownConfig>,
}

impl Config {
	pub fn parse(bytes: &[u8]) -> anyhow::Result<Config> {
		Ok(serde_json::from_slice(bytes)?)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TlsConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub addr: String,
	#[serde(default)]
	pub certs: Vec<CertConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_ca_file: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub min_version: Option<String>,
	#[serde(default)]
	pub cipher_suites: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CertConfig {
	pub host: String,
	pub cert_file: String,
	pub key_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Route {
	pub id: RouteId,
	#[serde(default)]
	pub host: String,
	#[serde(default = "default_path_prefix")]
	pub path_prefix: String,
	#[serde(default)]
	pub methods: Vec<String>,
	pub pool: PoolKey,
	#[serde(default)]
	pub policy: Policy,
	/// Marks this entry as an overlay during provider merge: it may adjust
	/// traffic weights of an identical base route instead of conflicting.
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub overlay: bool,
}

fn default_path_prefix() -> String {
	"/".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Policy {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub request_timeout_ms: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dial_timeout_ms: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response_header_timeout_ms: Option<u64>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub require_mtls: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mtls_client_ca: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retry: Option<RetryConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retry_budget: Option<RetryBudgetConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_retry_cap: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cache: Option<CacheConfig>,
	#[serde(default)]
	pub plugins: Vec<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub traffic: Option<TrafficConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryConfig {
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub per_try_timeout_ms: Option<u64>,
	#[serde(default = "default_backoff_base_ms")]
	pub backoff_base_ms: u64,
	#[serde(default = "default_jitter_ms")]
	pub jitter_ms: u64,
	#[serde(default = "default_retry_on")]
	pub retry_on: Vec<RetryOn>,
	/// Permit retrying non-idempotent methods. Off unless a route opts in.
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub non_idempotent: bool,
}

fn default_max_attempts() -> u32 {
	2
}
fn default_backoff_base_ms() -> u64 {
	25
}
fn default_jitter_ms() -> u64 {
	25
}
fn default_retry_on() -> Vec<RetryOn> {
	vec![RetryOn::Connect, RetryOn::Timeout]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
	#[serde(rename = "5xx")]
	Http5xx,
	GatewayError,
	Timeout,
	Connect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryBudgetConfig {
	#[serde(default = "default_budget_ratio")]
	pub ratio: f64,
	#[serde(default = "default_budget_min_per_second")]
	pub min_per_second: u32,
}

fn default_budget_ratio() -> f64 {
	0.2
}
fn default_budget_min_per_second() -> u32 {
	10
}

impl Default for RetryBudgetConfig {
	fn default() -> Self {
		RetryBudgetConfig {
			ratio: default_budget_ratio(),
			min_per_second: default_budget_min_per_second(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	pub ttl_ms: u64,
	#[serde(default = "default_max_object_bytes")]
	pub max_object_bytes: usize,
	#[serde(default)]
	pub vary_headers: Vec<String>,
}

fn default_true() -> bool {
	true
}
fn default_max_object_bytes() -> usize {
	1024 * 1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TrafficConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_stable_weight")]
	pub stable_weight: u32,
	#[serde(default)]
	pub canary_weight: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub canary_pool: Option<PoolKey>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cohort_header: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cohort_cookie: Option<String>,
}

fn default_stable_weight() -> u32 {
	100
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Pool {
	#[serde(default)]
	pub endpoints: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub health: Option<HealthConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub breaker: Option<BreakerConfig>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub outlier: Option<OutlierConfig>,
	/// Overlay entries may change the endpoint list of an identical base pool.
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub overlay: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthConfig {
	/// 0 disables active probing.
	#[serde(default)]
	pub interval_ms: u64,
	#[serde(default = "default_health_path")]
	pub path: String,
	#[serde(default = "default_health_timeout_ms")]
	pub timeout_ms: u64,
	#[serde(default = "default_healthy_threshold")]
	pub healthy_threshold: u32,
	#[serde(default = "default_unhealthy_threshold")]
	pub unhealthy_threshold: u32,
	#[serde(default = "default_base_eject_ms")]
	pub base_eject_ms: u64,
	#[serde(default = "default_max_eject_ms")]
	pub max_eject_ms: u64,
	/// Consecutive passive (data path) failures before an endpoint is
	/// locally ejected.
	#[serde(default = "default_passive_threshold")]
	pub passive_failure_threshold: u32,
}

fn default_health_path() -> String {
	"/healthz".to_string()
}
fn default_health_timeout_ms() -> u64 {
	1000
}
fn default_healthy_threshold() -> u32 {
	2
}
fn default_unhealthy_threshold() -> u32 {
	3
}
fn default_base_eject_ms() -> u64 {
	30_000
}
fn default_max_eject_ms() -> u64 {
	300_000
}
fn default_passive_threshold() -> u32 {
	5
}

impl Default for HealthConfig {
	fn default() -> Self {
		HealthConfig {
			interval_ms: 0,
			path: default_health_path(),
			timeout_ms: default_health_timeout_ms(),
			healthy_threshold: default_healthy_threshold(),
			unhealthy_threshold: default_unhealthy_threshold(),
			base_eject_ms: default_base_eject_ms(),
			max_eject_ms: default_max_eject_ms(),
			passive_failure_threshold: default_passive_threshold(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BreakerConfig {
	#[serde(default = "default_breaker_min_requests")]
	pub min_requests: u64,
	#[serde(default = "default_breaker_threshold")]
	pub failure_rate_percent: u32,
	#[serde(default = "default_breaker_window_ms")]
	pub evaluation_window_ms: u64,
	#[serde(default = "default_breaker_open_ms")]
	pub open_duration_ms: u64,
	#[serde(default = "default_half_open_probes")]
	pub half_open_max_probes: u32,
}

fn default_breaker_min_requests() -> u64 {
	10
}
fn default_breaker_threshold() -> u32 {
	50
}
fn default_breaker_window_ms() -> u64 {
	10_000
}
fn default_breaker_open_ms() -> u64 {
	5_000
}
fn default_half_open_probes() -> u32 {
	1
}

impl Default for BreakerConfig {
	fn default() -> Self {
		BreakerConfig {
			min_requests: default_breaker_min_requests(),
			failure_rate_percent: default_breaker_threshold(),
			evaluation_window_ms: default_breaker_window_ms(),
			open_duration_ms: default_breaker_open_ms(),
			half_open_max_probes: default_half_open_probes(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OutlierConfig {
	#[serde(default = "default_consecutive_failures")]
	pub consecutive_failures: u32,
	#[serde(default = "default_error_rate_percent")]
	pub error_rate_percent: u32,
	#[serde(default = "default_error_rate_window_ms")]
	pub error_rate_window_ms: u64,
	#[serde(default = "default_outlier_min_requests")]
	pub min_requests: u64,
	#[serde(default = "default_base_eject_ms")]
	pub base_eject_ms: u64,
	#[serde(default = "default_max_eject_ms")]
	pub max_eject_ms: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub latency: Option<LatencyOutlierConfig>,
}

fn default_consecutive_failures() -> u32 {
	5
}
fn default_error_rate_percent() -> u32 {
	50
}
fn default_error_rate_window_ms() -> u64 {
	10_000
}
fn default_outlier_min_requests() -> u64 {
	20
}

impl Default for OutlierConfig {
	fn default() -> Self {
		OutlierConfig {
			consecutive_failures: default_consecutive_failures(),
			error_rate_percent: default_error_rate_percent(),
			error_rate_window_ms: default_error_rate_window_ms(),
			min_requests: default_outlier_min_requests(),
			base_eject_ms: default_base_eject_ms(),
			max_eject_ms: default_max_eject_ms(),
			latency: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LatencyOutlierConfig {
	#[serde(default = "default_latency_multiplier")]
	pub multiplier: f64,
	#[serde(default = "default_latency_min_samples")]
	pub min_samples: usize,
	#[serde(default = "default_latency_eval_interval_ms")]
	pub eval_interval_ms: u64,
	#[serde(default = "default_latency_consecutive_intervals")]
	pub consecutive_intervals: u32,
}

fn default_latency_multiplier() -> f64 {
	3.0
}
fn default_latency_min_samples() -> usize {
	50
}
fn default_latency_eval_interval_ms() -> u64 {
	10_000
}
fn default_latency_consecutive_intervals() -> u32 {
	3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ShutdownConfig {
	#[serde(default = "default_graceful_timeout_ms")]
	pub graceful_timeout_ms: u64,
	#[serde(default)]
	pub drain_ms: u64,
	#[serde(default = "default_force_close_ms")]
	pub force_close_ms: u64,
}

fn default_graceful_timeout_ms() -> u64 {
	30_000
}
fn default_force_close_ms() -> u64 {
	1_000
}

impl Default for ShutdownConfig {
	fn default() -> Self {
		ShutdownConfig {
			graceful_timeout_ms: default_graceful_timeout_ms(),
			drain_ms: 0,
			force_close_ms: default_force_close_ms(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimal_config() {
		let raw = br#"{
			"listenAddr": ":8080",
			"routes": [
				{"id": "r1", "host": "example.com", "pathPrefix": "/", "pool": "p1"}
			],
			"pools": {
				"p1": {"endpoints": ["127.0.0.1:9001", "127.0.0.1:9002"]}
			}
		}"#;
		let cfg = Config::parse(raw).unwrap();
		assert_eq!(cfg.listen_addr, ":8080");
		assert_eq!(cfg.routes.len(), 1);
		assert_eq!(cfg.routes[0].path_prefix, "/");
		assert_eq!(cfg.pools["p1"].endpoints.len(), 2);
	}

	#[test]
	fn rejects_unknown_fields() {
		let raw = br#"{"listenAddr": ":8080", "bogus": true}"#;
		assert!(Config::parse(raw).is_err());
	}

	#[test]
	fn parses_retry_on_codes() {
		let raw = br#"{
			"routes": [{
				"id": "r1", "pool": "p1",
				"policy": {"retry": {"maxAttempts": 3, "retryOn": ["5xx", "connect", "gateway_error"]}}
			}],
			"pools": {"p1": {"endpoints": ["127.0.0.1:9001"]}}
		}"#;
		let cfg = Config::parse(raw).unwrap();
		let retry = cfg.routes[0].policy.retry.as_ref().unwrap();
		assert_eq!(retry.max_attempts, 3);
		assert_eq!(
			retry.retry_on,
			vec![RetryOn::Http5xx, RetryOn::Connect, RetryOn::GatewayError]
		);
	}
}
