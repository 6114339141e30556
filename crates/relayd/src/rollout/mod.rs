//! Staged configuration rollout: validate, locked, bake, gate, full.
//!
//! The locked stage runs the new config with plugins disabled and traffic
//! pinned to 100% stable, so a bad push degrades as little as possible while
//! it bakes. If the rolling 5xx rate crosses the gate during the bake, the
//! pre-apply snapshot is swapped back and the rollout reports failure.

pub mod bundle;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::apply::{self, ApplyError, Mode};
use crate::snapshot::{Snapshot, Store};
use crate::telemetry::metrics::{Metrics, ResultLabels, StageLabels};
use crate::telemetry::rolling::RollingCounter;
use crate::{Strng, strng};

pub use bundle::{Bundle, BundleMeta, VerifyError};

pub const STAGE_VALIDATE: &str = "validate";
pub const STAGE_LOCKED: &str = "locked";
pub const STAGE_GATED: &str = "gated";
pub const STAGE_FULL: &str = "full";

#[derive(Debug, Clone)]
pub struct RolloutConfig {
	pub locked_bake: Duration,
	pub error_rate_window: Duration,
	pub error_rate_percent: f64,
}

impl Default for RolloutConfig {
	fn default() -> Self {
		RolloutConfig {
			locked_bake: Duration::from_secs(60),
			error_rate_window: Duration::from_secs(10),
			error_rate_percent: 1.0,
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum RolloutError {
	#[error("bundle verification failed: {0}")]
	Verify(#[from] VerifyError),
	#[error("{stage} stage failed: {source}")]
	Stage {
		stage: &'static str,
		#[source]
		source: ApplyError,
	},
	#[error("error rate gate failed: {rate:.2}% > {threshold:.2}%")]
	GateFailed { rate: f64, threshold: f64 },
	#[error("rollout cancelled during bake")]
	Cancelled,
}

pub struct Manager {
	apply: Arc<apply::Manager>,
	store: Arc<Store>,
	rolling: Arc<RollingCounter>,
	metrics: Arc<Metrics>,
	public_key: Vec<u8>,
	cfg: RolloutConfig,
	/// Fires on shutdown so a bake in progress aborts (and rolls back).
	cancel: watch::Receiver<bool>,
}

impl Manager {
	pub fn new(
		apply: Arc<apply::Manager>,
		store: Arc<Store>,
		rolling: Arc<RollingCounter>,
		metrics: Arc<Metrics>,
		public_key: Vec<u8>,
		cfg: RolloutConfig,
		cancel: watch::Receiver<bool>,
	) -> Manager {
		Manager {
			apply,
			store,
			rolling,
			metrics,
			public_key,
			cfg,
			cancel,
		}
	}

	fn record_stage(&self, stage: &'static str, result: &'static str) {
		self
			.metrics
			.rollout_stage
			.get_or_create(&StageLabels {
				stage: stage.into(),
				result: result.into(),
			})
			.inc();
	}

	fn record_rollback(&self, result: &'static str) {
		self
			.metrics
			.rollback
			.get_or_create(&ResultLabels {
				result: result.into(),
			})
			.inc();
	}

	fn rollback(&self, pre: &Arc<Snapshot>) {
		let replaced = self.store.swap(pre.clone());
		warn!(
			restored = %pre.version,
			discarded = %replaced.version,
			"rolled back to pre-apply snapshot"
		);
		self.record_rollback("success");
	}

	async fn stage_apply(
		&self,
		stage: &'static str,
		bytes: &[u8],
		source: Strng,
		mode: Mode,
	) -> Result<Arc<Snapshot>, RolloutError> {
		match self.apply.apply_bytes(bytes, source, mode).await {
			Ok(out) => {
				self.record_stage(stage, "success");
				Ok(out.snapshot)
			},
			Err(e) => {
				self.record_stage(stage, "error");
				Err(RolloutError::Stage { stage, source: e })
			},
		}
	}

	/// Verifies and applies a signed bundle through the staged rollout.
	/// Returns the snapshot that is live when the rollout completes.
	pub async fn apply_bundle(
		&self,
		bundle: &Bundle,
		source_override: Option<Strng>,
	) -> Result<Arc<Snapshot>, RolloutError> {
		let config_bytes = match bundle::verify(bundle, &self.public_key) {
			Ok(bytes) => {
				self
					.metrics
					.bundle_verify
					.get_or_create(&ResultLabels {
						result: "ok".into(),
					})
					.inc();
				bytes
			},
			Err(e) => {
				self
					.metrics
					.bundle_verify
					.get_or_create(&ResultLabels {
						result: e.as_label().into(),
					})
					.inc();
				return Err(e.into());
			},
		};
		let source =
			source_override.unwrap_or_else(|| strng::new(format!("bundle:{}", bundle.meta.version)));
		info!(version = %bundle.meta.version, %source, "starting rollout");

		// Validate stage: throwaway registries, no live effect.
		self
			.stage_apply(STAGE_VALIDATE, &config_bytes, source.clone(), Mode::Validate)
			.await?;

		let pre = self.store.get();

		// Locked stage: plugins off, traffic pinned to stable.
		let locked_bytes = lock_config(&config_bytes)
			.map_err(|e| RolloutError::Stage {
				stage: STAGE_LOCKED,
				source: ApplyError::Parse(e),
			})?;
		self
			.stage_apply(
				STAGE_LOCKED,
				&locked_bytes,
				strng::new(format!("{source}:locked")),
				Mode::Apply,
			)
			.await?;

		// Bake, watching for cancellation. A closed cancel channel means
		// nothing can cancel us; keep baking.
		let mut cancel = self.cancel.clone();
		let cancelled = async move {
			if cancel.wait_for(|v| *v).await.is_err() {
				std::future::pending::<()>().await;
			}
		};
		tokio::select! {
			_ = tokio::time::sleep(self.cfg.locked_bake) => {},
			_ = cancelled => {
				self.rollback(&pre);
				return Err(RolloutError::Cancelled);
			},
		}

		// Gate: rolling 5xx rate over the configured window.
		let (total, fivexx) = self
			.rolling
			.snapshot(self.cfg.error_rate_window, Instant::now());
		let rate = if total == 0 {
			0.0
		} else {
			fivexx as f64 * 100.0 / total as f64
		};
		if rate > self.cfg.error_rate_percent {
			self.record_stage(STAGE_GATED, "error");
			self.rollback(&pre);
			return Err(RolloutError::GateFailed {
				rate,
				threshold: self.cfg.error_rate_percent,
			});
		}
		self.record_stage(STAGE_GATED, "success");

		// Full stage: the requested config, live.
		match self
			.stage_apply(STAGE_FULL, &config_bytes, source, Mode::Apply)
			.await
		{
			Ok(snapshot) => {
				info!(version = %snapshot.version, "rollout complete");
				Ok(snapshot)
			},
			Err(e) => {
				self.rollback(&pre);
				Err(e)
			},
		}
	}
}

/// Rewrites config bytes for the locked stage: every route loses its
/// plugins and serves 100% stable traffic.
fn lock_config(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut cfg = crate::config::Config::parse(bytes)?;
	for route in &mut cfg.routes {
		route.policy.plugins.clear();
		if let Some(traffic) = &mut route.policy.traffic {
			traffic.stable_weight = 100;
			traffic.canary_weight = 0;
		}
	}
	Ok(serde_json::to_vec(&cfg)?)
}

#[cfg(test)]
mod tests {
	use ring::signature::KeyPair;

	use super::*;
	use crate::apply::Options;
	use crate::http::StatusCode;
	use crate::proxy::inflight;
	use crate::snapshot::build::Registries;

	const CONFIG_V1: &[u8] = br#"{
		"listenAddr": ":8080",
		"routes": [{"id": "r1", "pool": "p1", "policy": {"plugins": ["authz"],
			"traffic": {"stableWeight": 80, "canaryWeight": 20, "canaryPool": "p1"}}}],
		"pools": {"p1": {"endpoints": ["127.0.0.1:9001"]}}
	}"#;

	fn setup(cfg: RolloutConfig) -> (Manager, Arc<Store>, Arc<RollingCounter>, ring::signature::Ed25519KeyPair) {
		let mut registry = prometheus_client::registry::Registry::default();
		let metrics = Metrics::new(&mut registry);
		let store = Arc::new(Store::default());
		let rolling = Arc::new(RollingCounter::new(Duration::from_secs(60)));
		let apply = Arc::new(apply::Manager::new(
			vec![],
			Arc::new(Registries::throwaway()),
			store.clone(),
			metrics.clone(),
			inflight::Tracker::new(),
			Options::default(),
		));
		let key = ring::signature::Ed25519KeyPair::from_seed_unchecked(&[7u8; 32]).unwrap();
		let (_tx, cancel) = watch::channel(false);
		let manager = Manager::new(
			apply,
			store.clone(),
			rolling.clone(),
			metrics,
			key.public_key().as_ref().to_vec(),
			cfg,
			cancel,
		);
		(manager, store, rolling, key)
	}

	fn signed(key: &ring::signature::Ed25519KeyPair, version: &str, bytes: &[u8]) -> Bundle {
		bundle::sign(
			bytes,
			BundleMeta {
				version: version.to_string(),
				created_at: "2026-01-01T00:00:00.000000000Z".to_string(),
				source: "test".to_string(),
				notes: None,
			},
			key,
		)
		.unwrap()
	}

	fn fast() -> RolloutConfig {
		RolloutConfig {
			locked_bake: Duration::from_millis(20),
			error_rate_window: Duration::from_secs(10),
			error_rate_percent: 1.0,
		}
	}

	#[tokio::test]
	async fn clean_rollout_publishes_full_config() {
		let (manager, store, _rolling, key) = setup(fast());
		let bundle = signed(&key, "v1", CONFIG_V1);
		let snapshot = manager.apply_bundle(&bundle, None).await.unwrap();
		assert_eq!(store.get().version, snapshot.version);
		// Full stage hashes the original bytes.
		assert_eq!(
			snapshot.version,
			crate::snapshot::build::version_of(CONFIG_V1)
		);
	}

	#[tokio::test]
	async fn gate_failure_rolls_back_to_pre_apply_snapshot() {
		let (manager, store, rolling, key) = setup(fast());
		let pre = store.get();
		// Elevated 5xx inside the gate window.
		let now = Instant::now();
		for _ in 0..95 {
			rolling.record(StatusCode::OK, now);
		}
		for _ in 0..5 {
			rolling.record(StatusCode::BAD_GATEWAY, now);
		}
		let bundle = signed(&key, "v2", CONFIG_V1);
		let err = manager.apply_bundle(&bundle, None).await.unwrap_err();
		assert!(matches!(err, RolloutError::GateFailed { .. }));
		assert_eq!(store.get().version, pre.version);
	}

	#[tokio::test]
	async fn tampered_bundle_is_rejected_before_any_stage() {
		let (manager, store, _rolling, key) = setup(fast());
		let mut bundle = signed(&key, "v1", CONFIG_V1);
		bundle.config_sha256 = "00".repeat(32);
		let err = manager.apply_bundle(&bundle, None).await.unwrap_err();
		assert!(matches!(err, RolloutError::Verify(VerifyError::BadHash)));
		assert_eq!(store.get().version, strng::new("empty"));
	}

	#[tokio::test]
	async fn invalid_config_fails_validate_stage_without_live_changes() {
		let (manager, store, _rolling, key) = setup(fast());
		let bundle = signed(&key, "v1", br#"{"routes": [{"id": "r", "pool": "none"}]}"#);
		let err = manager.apply_bundle(&bundle, None).await.unwrap_err();
		assert!(matches!(
			err,
			RolloutError::Stage {
				stage: STAGE_VALIDATE,
				..
			}
		));
		assert_eq!(store.get().version, strng::new("empty"));
	}

	#[test]
	fn lock_config_disables_plugins_and_pins_traffic() {
		let locked = lock_config(CONFIG_V1).unwrap();
		let cfg = crate::config::Config::parse(&locked).unwrap();
		assert!(cfg.routes[0].policy.plugins.is_empty());
		let t = cfg.routes[0].policy.traffic.as_ref().unwrap();
		assert_eq!((t.stable_weight, t.canary_weight), (100, 0));
	}
}
