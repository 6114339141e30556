//! Configuration application: the single entry point through which every
//! config change (file pull, admin push, rollout stage) flows.
//!
//! Wraps provider merge, validation, and snapshot compilation in one bounded
//! computation. Validate mode builds against throwaway registries and swaps
//! nothing; apply mode builds against the live registries and publishes the
//! snapshot atomically. Errors never leave a partially applied store.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::provider::{Loaded, Provider, StaticProvider};
use crate::config::validate::Warning;
use crate::config::{ConflictError, ValidationError, merge, validate};
use crate::proxy::inflight;
use crate::snapshot::build::{self, Registries};
use crate::snapshot::{Snapshot, Store};
use crate::telemetry::metrics::Metrics;
use crate::{Strng, strng};

pub const DEFAULT_MAX_CONFIG_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_COMPILE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Options {
	pub max_config_bytes: usize,
	pub compile_timeout: Duration,
}

impl Default for Options {
	fn default() -> Self {
		Options {
			max_config_bytes: DEFAULT_MAX_CONFIG_BYTES,
			compile_timeout: DEFAULT_COMPILE_TIMEOUT,
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
	#[error("config is {size} bytes, exceeding the {max} byte limit")]
	ConfigTooLarge { size: usize, max: usize },
	#[error("config compilation exceeded {0:?}")]
	CompileTimeout(Duration),
	#[error("rejecting config change while under pressure")]
	Pressure,
	#[error(transparent)]
	Conflict(#[from] ConflictError),
	#[error(transparent)]
	Validation(#[from] ValidationError),
	#[error("config parse failed: {0}")]
	Parse(anyhow::Error),
	#[error("config compile failed: {0}")]
	Compile(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	/// Build against throwaway registries; never touches live state.
	Validate,
	/// Build against the live registries and swap the store.
	Apply,
}

#[derive(Debug)]
pub struct Outcome {
	pub snapshot: Arc<Snapshot>,
	/// The snapshot that was current before the swap (apply mode only).
	pub previous: Option<Arc<Snapshot>>,
	pub warnings: Vec<Warning>,
}

pub struct Manager {
	providers: RwLock<Vec<Arc<dyn Provider>>>,
	live: Arc<Registries>,
	store: Arc<Store>,
	metrics: Arc<Metrics>,
	inflight: Arc<inflight::Tracker>,
	options: Options,
}

impl Manager {
	pub fn new(
		providers: Vec<Arc<dyn Provider>>,
		live: Arc<Registries>,
		store: Arc<Store>,
		metrics: Arc<Metrics>,
		inflight: Arc<inflight::Tracker>,
		options: Options,
	) -> Manager {
		Manager {
			providers: RwLock::new(providers),
			live,
			store,
			metrics,
			inflight,
			options,
		}
	}

	pub fn store(&self) -> Arc<Store> {
		self.store.clone()
	}

	/// Applies raw config bytes as the highest-priority provider, merged
	/// over the configured ones.
	pub async fn apply_bytes(
		&self,
		bytes: &[u8],
		source: Strng,
		mode: Mode,
	) -> Result<Outcome, ApplyError> {
		if bytes.len() > self.options.max_config_bytes {
			return Err(ApplyError::ConfigTooLarge {
				size: bytes.len(),
				max: self.options.max_config_bytes,
			});
		}
		let pushed = crate::config::Config::parse(bytes).map_err(ApplyError::Parse)?;
		let extra: Arc<dyn Provider> = Arc::new(StaticProvider {
			name: source.clone(),
			priority: u32::MAX,
			config: pushed,
		});
		self.apply_merged(Some(extra), Some(bytes), source, mode).await
	}

	/// Re-loads the configured providers; the pull loop entry point.
	pub async fn apply_providers(&self, mode: Mode) -> Result<Outcome, ApplyError> {
		self
			.apply_merged(None, None, strng::literal!("providers"), mode)
			.await
	}

	async fn apply_merged(
		&self,
		extra: Option<Arc<dyn Provider>>,
		raw: Option<&[u8]>,
		source: Strng,
		mode: Mode,
	) -> Result<Outcome, ApplyError> {
		let started = Instant::now();
		if self.inflight.count() > self.store.get().limits.max_inflight {
			return Err(ApplyError::Pressure);
		}

		let mut providers: Vec<Arc<dyn Provider>> =
			self.providers.read().expect("providers lock poisoned").clone();
		if let Some(extra) = extra {
			providers.push(extra);
		}
		let loaded: Vec<Loaded> =
			crate::config::provider::load_all(&providers).map_err(ApplyError::Parse)?;
		let merged = merge(loaded).inspect_err(|_| {
			self.metrics.config_conflict.inc();
		})?;

		let warnings = validate(&merged)?;
		for w in &warnings {
			warn!(object = %w.object, "config warning: {}", w.message);
		}

		let result = match mode {
			Mode::Validate => {
				let regs = Registries::throwaway();
				let out = self
					.compile(&merged, raw, source.clone(), Arc::new(regs))
					.await?;
				Outcome {
					snapshot: out,
					previous: None,
					warnings,
				}
			},
			Mode::Apply => {
				let out = self
					.compile(&merged, raw, source.clone(), self.live.clone())
					.await?;
				let previous = self.store.swap(out.clone());
				info!(version = %out.version, %source, previous = %previous.version, "published snapshot");
				Outcome {
					snapshot: out,
					previous: Some(previous),
					warnings,
				}
			},
		};
		self
			.metrics
			.config_apply_duration
			.observe(started.elapsed().as_secs_f64());
		Ok(result)
	}

	/// Runs the compiler off the async thread, bounded by the compile
	/// timeout. A timed-out build finishes in the background but its result
	/// is discarded and the store is left untouched.
	async fn compile(
		&self,
		cfg: &crate::config::Config,
		raw: Option<&[u8]>,
		source: Strng,
		regs: Arc<Registries>,
	) -> Result<Arc<Snapshot>, ApplyError> {
		let cfg = cfg.clone();
		let raw = raw.map(|b| b.to_vec());
		let handle = tokio::runtime::Handle::current();
		let task = tokio::task::spawn_blocking(move || {
			// Probe and evaluator tasks spawned during reconcile need the
			// runtime context on this thread.
			let _guard = handle.enter();
			build::build(&cfg, raw.as_deref(), source, &regs, Instant::now())
		});
		match tokio::time::timeout(self.options.compile_timeout, task).await {
			Ok(Ok(res)) => res.map_err(ApplyError::Compile),
			Ok(Err(join)) => Err(ApplyError::Compile(anyhow::anyhow!(
				"compile task failed: {join}"
			))),
			Err(_) => Err(ApplyError::CompileTimeout(self.options.compile_timeout)),
		}
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	fn manager() -> Manager {
		let mut registry = prometheus_client::registry::Registry::default();
		let metrics = Metrics::new(&mut registry);
		Manager::new(
			vec![],
			Arc::new(Registries::throwaway()),
			Arc::new(Store::default()),
			metrics,
			inflight::Tracker::new(),
			Options::default(),
		)
	}

	const CONFIG: &[u8] = br#"{
		"listenAddr": ":8080",
		"routes": [{"id": "r1", "pool": "p1"}],
		"pools": {"p1": {"endpoints": ["127.0.0.1:9001"]}}
	}"#;

	#[tokio::test]
	async fn apply_swaps_the_store() {
		let m = manager();
		let out = m
			.apply_bytes(CONFIG, strng::new("test"), Mode::Apply)
			.await
			.unwrap();
		assert_eq!(out.previous.as_ref().unwrap().version, strng::new("empty"));
		assert_eq!(m.store.get().version, out.snapshot.version);
	}

	#[tokio::test]
	async fn validate_leaves_the_store_alone() {
		let m = manager();
		let out = m
			.apply_bytes(CONFIG, strng::new("test"), Mode::Validate)
			.await
			.unwrap();
		assert!(out.previous.is_none());
		assert_eq!(m.store.get().version, strng::new("empty"));
	}

	#[tokio::test]
	async fn rejects_oversized_config() {
		let mut m = manager();
		m.options.max_config_bytes = 8;
		let err = m
			.apply_bytes(CONFIG, strng::new("test"), Mode::Apply)
			.await
			.unwrap_err();
		assert_matches!(err, ApplyError::ConfigTooLarge { .. });
	}

	#[tokio::test]
	async fn invalid_config_never_mutates_the_store() {
		let m = manager();
		let bad = br#"{"routes": [{"id": "r1", "pool": "missing"}]}"#;
		let err = m
			.apply_bytes(bad, strng::new("test"), Mode::Apply)
			.await
			.unwrap_err();
		assert_matches!(err, ApplyError::Validation(_));
		assert_eq!(m.store.get().version, strng::new("empty"));
	}
}
