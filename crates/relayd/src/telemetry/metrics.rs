//! Metric families for the data path and config path.
//!
//! The metrics handle is injected explicitly wherever it is needed; there is
//! no global default registry. Route and pool label values pass through a
//! top-K canonicaliser so series cardinality stays bounded no matter what
//! config (or traffic) does.

use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use relay_core::metrics::DefaultedUnknown;
use relay_core::strng::RichStrng;

use crate::Strng;
use crate::http::StatusCode;
use crate::telemetry::topk::TopK;

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
	pub route: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteStatusLabels {
	pub route: DefaultedUnknown<RichStrng>,
	pub status_class: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct PoolLabels {
	pub pool: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct PoolCategoryLabels {
	pub pool: DefaultedUnknown<RichStrng>,
	pub category: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteCategoryLabels {
	pub route: DefaultedUnknown<RichStrng>,
	pub category: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteReasonLabels {
	pub route: DefaultedUnknown<RichStrng>,
	pub reason: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct PoolReasonLabels {
	pub pool: DefaultedUnknown<RichStrng>,
	pub reason: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
	pub route: DefaultedUnknown<RichStrng>,
	pub status: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct VariantLabels {
	pub route: DefaultedUnknown<RichStrng>,
	pub variant: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
	pub stage: DefaultedUnknown<RichStrng>,
	pub result: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
	pub result: DefaultedUnknown<RichStrng>,
}

type CounterFamily<L> = Family<L, Counter>;

pub struct Metrics {
	pub requests: CounterFamily<RouteStatusLabels>,
	pub upstream_errors: CounterFamily<PoolCategoryLabels>,
	pub proxy_errors: CounterFamily<RouteCategoryLabels>,
	pub retries: CounterFamily<RouteReasonLabels>,
	pub retry_budget_exhausted: CounterFamily<RouteLabels>,
	pub circuit_open: CounterFamily<PoolLabels>,
	pub outlier_ejections: CounterFamily<PoolReasonLabels>,
	pub outlier_fail_open: CounterFamily<PoolLabels>,
	pub cache_requests: CounterFamily<CacheLabels>,
	pub cache_coalesce_breakaway: CounterFamily<RouteLabels>,
	pub variant_requests: CounterFamily<VariantLabels>,
	pub overload_reject: CounterFamily<RouteLabels>,
	pub mtls_reject: CounterFamily<RouteLabels>,
	pub breaker_open: Family<PoolLabels, Gauge>,
	pub bundle_verify: CounterFamily<ResultLabels>,
	pub rollout_stage: CounterFamily<StageLabels>,
	pub rollback: CounterFamily<ResultLabels>,
	pub config_conflict: Counter,
	pub config_apply_duration: Histogram,
	pub request_duration: Family<RouteLabels, Histogram>,
	pub upstream_roundtrip: Family<PoolLabels, Histogram>,

	route_topk: TopK,
	pool_topk: TopK,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Arc<Metrics> {
		let registry = registry.sub_registry_with_prefix("proxy");
		fn build<
			L: Clone + std::hash::Hash + Eq + EncodeLabelSet + std::fmt::Debug + Send + Sync + 'static,
		>(
			registry: &mut Registry,
			name: &str,
			help: &str,
		) -> CounterFamily<L> {
			let m = CounterFamily::<L>::default();
			registry.register(name, help, m.clone());
			m
		}

		let breaker_open = Family::<PoolLabels, Gauge>::default();
		registry.register(
			"breaker_open",
			"Whether the pool circuit breaker is currently open",
			breaker_open.clone(),
		);
		let config_conflict = Counter::default();
		registry.register(
			"config_conflict",
			"Provider merges rejected due to conflicting objects",
			config_conflict.clone(),
		);
		let config_apply_duration = Histogram::new(exponential_buckets(0.001, 2.0, 14));
		registry.register(
			"config_apply_duration_seconds",
			"Time to validate, compile and publish a configuration",
			config_apply_duration.clone(),
		);
		let request_duration =
			Family::<RouteLabels, Histogram>::new_with_constructor(|| {
				Histogram::new(exponential_buckets(0.001, 2.0, 16))
			});
		registry.register(
			"request_duration_seconds",
			"End to end request duration",
			request_duration.clone(),
		);
		let upstream_roundtrip =
			Family::<PoolLabels, Histogram>::new_with_constructor(|| {
				Histogram::new(exponential_buckets(0.001, 2.0, 16))
			});
		registry.register(
			"upstream_roundtrip_seconds",
			"Upstream round trip duration",
			upstream_roundtrip.clone(),
		);

		Arc::new(Metrics {
			requests: build(registry, "requests", "Requests handled by the proxy"),
			upstream_errors: build(registry, "upstream_errors", "Upstream failures by category"),
			proxy_errors: build(
				registry,
				"proxy_errors",
				"Requests rejected by the proxy itself",
			),
			retries: build(registry, "retries", "Retry attempts by reason"),
			retry_budget_exhausted: build(
				registry,
				"retry_budget_exhausted",
				"Retries abandoned because the route budget was exhausted",
			),
			circuit_open: build(
				registry,
				"circuit_open",
				"Requests rejected by an open circuit",
			),
			outlier_ejections: build(registry, "outlier_ejections", "Endpoint ejections by reason"),
			outlier_fail_open: build(
				registry,
				"outlier_fail_open",
				"Picks that ignored outlier ejection because no endpoint remained",
			),
			cache_requests: build(registry, "cache_requests", "Cache lookups by outcome"),
			cache_coalesce_breakaway: build(
				registry,
				"cache_coalesce_breakaway",
				"Coalesced followers that timed out and fetched directly",
			),
			variant_requests: build(registry, "variant_requests", "Requests by traffic variant"),
			overload_reject: build(
				registry,
				"overload_reject",
				"Requests rejected due to process pressure",
			),
			mtls_reject: build(
				registry,
				"mtls_reject",
				"Requests rejected by the route mTLS gate",
			),
			bundle_verify: build(registry, "bundle_verify", "Bundle verifications by result"),
			rollout_stage: build(registry, "rollout_stage", "Rollout stages by result"),
			rollback: build(registry, "rollback", "Rollbacks by result"),
			breaker_open,
			config_conflict,
			config_apply_duration,
			request_duration,
			upstream_roundtrip,
			route_topk: TopK::new(256),
			pool_topk: TopK::new(256),
		})
	}

	/// Canonicalises a route label through the top-K sketch.
	pub fn route(&self, route: &Strng) -> Strng {
		self.route_topk.observe(route)
	}

	pub fn pool(&self, pool: &Strng) -> Strng {
		self.pool_topk.observe(pool)
	}

	/// Decay pass for the label sketches; call on a fixed interval.
	pub fn recompute_topk(&self) {
		self.route_topk.recompute();
		self.pool_topk.recompute();
	}
}

pub fn status_class(status: StatusCode) -> &'static str {
	match status.as_u16() {
		100..=199 => "1xx",
		200..=299 => "2xx",
		300..=399 => "3xx",
		400..=499 => "4xx",
		_ => "5xx",
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::strng;

	#[test]
	fn encodes_with_prefix_and_canonical_labels() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		let route = metrics.route(&strng::new("r1"));
		metrics
			.requests
			.get_or_create(&RouteStatusLabels {
				route: route.into(),
				status_class: status_class(StatusCode::OK).into(),
			})
			.inc();
		let mut out = String::new();
		prometheus_client::encoding::text::encode(&mut out, &registry).unwrap();
		assert!(out.contains("proxy_requests_total"));
		assert!(out.contains("route=\"r1\""));
		assert!(out.contains("status_class=\"2xx\""));
	}

	#[test]
	fn status_classes() {
		assert_eq!(status_class(StatusCode::OK), "2xx");
		assert_eq!(status_class(StatusCode::NOT_FOUND), "4xx");
		assert_eq!(status_class(StatusCode::BAD_GATEWAY), "5xx");
	}
}
