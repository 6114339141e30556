//! Wires the subsystems together: registries with their metric observers,
//! the snapshot store, the apply and rollout managers, and the maintenance
//! loops. Both the binary and the integration tests assemble through this.

use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus_client::registry::Registry as PromRegistry;
use relay_core::drain::DrainWatcher;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::apply;
use crate::cache::MemoryStore;
use crate::cache::coalesce::Coalescer;
use crate::config::provider::Provider;
use crate::filters;
use crate::pool::breaker::CircuitState;
use crate::proxy::httpproxy::{HttpProxy, ProxyInputs};
use crate::proxy::inflight;
use crate::rollout::{self, RolloutConfig};
use crate::snapshot::Store;
use crate::snapshot::build::Registries;
use crate::telemetry::metrics::{Metrics, PoolLabels, PoolReasonLabels};
use crate::telemetry::rolling::RollingCounter;

const CACHE_MAX_ENTRIES: usize = 8192;
const CACHE_MAX_BYTES: usize = 256 * 1024 * 1024;
const MAX_FLIGHTS: usize = 4096;
const REAP_INTERVAL: Duration = Duration::from_secs(1);
const TOPK_RECOMPUTE_INTERVAL: Duration = Duration::from_secs(60);

pub struct App {
	pub inputs: Arc<ProxyInputs>,
	pub apply: Arc<apply::Manager>,
	pub rollout: Arc<rollout::Manager>,
	pub registries: Arc<Registries>,
	pub metrics: Arc<Metrics>,
	/// Fired at shutdown; aborts rollout bakes in progress.
	pub cancel: watch::Sender<bool>,
}

pub fn build(
	providers: Vec<Arc<dyn Provider>>,
	apply_options: apply::Options,
	rollout_cfg: RolloutConfig,
	bundle_public_key: Vec<u8>,
	prom: &mut PromRegistry,
) -> App {
	crate::clock::init();
	let metrics = Metrics::new(prom);

	let eject_metrics = metrics.clone();
	let breaker_metrics = metrics.clone();
	let registries = Arc::new(Registries::new(
		true,
		Arc::new(move |pool, _addr, reason| {
			eject_metrics
				.outlier_ejections
				.get_or_create(&PoolReasonLabels {
					pool: eject_metrics.pool(pool).into(),
					reason: reason.into(),
				})
				.inc();
		}),
		Arc::new(move |pool, state| {
			breaker_metrics
				.breaker_open
				.get_or_create(&PoolLabels {
					pool: breaker_metrics.pool(pool).into(),
				})
				.set(if state == CircuitState::Open { 1 } else { 0 });
		}),
	));

	let store = Arc::new(Store::default());
	let inflight = inflight::Tracker::new();
	let rolling = Arc::new(RollingCounter::new(Duration::from_secs(120)));

	let apply = Arc::new(apply::Manager::new(
		providers,
		registries.clone(),
		store.clone(),
		metrics.clone(),
		inflight.clone(),
		apply_options,
	));

	let (cancel, cancel_rx) = watch::channel(false);
	let rollout = Arc::new(rollout::Manager::new(
		apply.clone(),
		store.clone(),
		rolling.clone(),
		metrics.clone(),
		bundle_public_key,
		rollout_cfg,
		cancel_rx,
	));

	let inputs = Arc::new(ProxyInputs {
		store,
		registries: registries.clone(),
		filters: Arc::new(filters::Registry::new()),
		metrics: metrics.clone(),
		cache: Arc::new(MemoryStore::new(CACHE_MAX_ENTRIES, CACHE_MAX_BYTES)),
		coalescer: Arc::new(Coalescer::new(MAX_FLIGHTS)),
		inflight,
		rolling,
	});

	App {
		inputs,
		apply,
		rollout,
		registries,
		metrics,
		cancel,
	}
}

impl App {
	pub fn proxy(&self) -> HttpProxy {
		HttpProxy::new(self.inputs.clone())
	}

	/// Periodic upkeep: endpoint reaping and top-K label decay. Exits when
	/// drain is signalled.
	pub async fn run_maintenance(&self, drain: DrainWatcher) {
		let registries = self.registries.clone();
		let metrics = self.metrics.clone();
		let mut reap = tokio::time::interval(REAP_INTERVAL);
		let mut recompute = tokio::time::interval(TOPK_RECOMPUTE_INTERVAL);
		let mut drained = std::pin::pin!(drain.wait_for_drain());
		loop {
			tokio::select! {
				_ = reap.tick() => registries.pools.reap(Instant::now()),
				_ = recompute.tick() => metrics.recompute_topk(),
				_ = &mut drained => return,
			}
		}
	}

	/// Periodic provider re-pull. Exits when drain is signalled.
	pub async fn run_pull_loop(&self, interval: Duration, jitter: Duration, drain: DrainWatcher) {
		let mut drained = std::pin::pin!(drain.wait_for_drain());
		loop {
			let jitter = if jitter.is_zero() {
				Duration::ZERO
			} else {
				Duration::from_millis(rand::random_range(0..=jitter.as_millis() as u64))
			};
			tokio::select! {
				_ = tokio::time::sleep(interval + jitter) => {},
				_ = &mut drained => return,
			}
			match self.apply.apply_providers(apply::Mode::Apply).await {
				Ok(out) => info!(version = %out.snapshot.version, "pulled configuration"),
				Err(e) => warn!(err = %e, "provider pull failed"),
			}
		}
	}

	/// Ordered shutdown: cancel rollouts, stop background subsystems, honor
	/// the optional drain delay, and wait for in-flight requests.
	pub async fn shutdown(&self) {
		let _ = self.cancel.send(true);
		self.registries.shutdown();
		let shutdown = self.inputs.store.get().shutdown.clone();
		if !shutdown.drain.is_zero() {
			tokio::time::sleep(shutdown.drain).await;
		}
		if !self
			.inputs
			.inflight
			.wait_idle(shutdown.graceful_timeout)
			.await
		{
			warn!(
				remaining = self.inputs.inflight.count(),
				"graceful timeout expired with requests in flight, force closing"
			);
			tokio::time::sleep(shutdown.force_close).await;
		}
	}
}
