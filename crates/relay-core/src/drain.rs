//! Cooperative draining.
//!
//! A [DrainTrigger] starts a drain and waits for it to complete. Every task
//! that wants to delay shutdown holds a clone of the [DrainWatcher]; the
//! trigger does not resolve until all watchers (and the shutdown releases
//! they turn into) have been dropped.

use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Constructs a new pair for draining.
/// * [DrainTrigger] starts a draining sequence and waits for it to complete.
/// * [DrainWatcher] is held by anything that participates in draining. It can
///   be cloned; the drain does not complete until all clones are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(None);
	let (holder_tx, holder_rx) = mpsc::channel::<Never>(1);
	(
		DrainTrigger {
			signal_tx,
			holder_rx,
		},
		DrainWatcher {
			signal_rx,
			holder_tx,
		},
	)
}

enum Never {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
	/// Terminate without waiting for in-flight work.
	Immediate,
	/// Wait for in-flight work to complete.
	Graceful,
}

pub struct DrainTrigger {
	signal_tx: watch::Sender<Option<DrainMode>>,
	holder_rx: mpsc::Receiver<Never>,
}

impl DrainTrigger {
	/// Signals all watchers to drain and waits until every watcher and
	/// release has been dropped.
	pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
		let _ = self.signal_tx.send(Some(mode));
		// All senders dropping is the only way this resolves; Never cannot be
		// instantiated so no value ever arrives.
		while self.holder_rx.recv().await.is_some() {}
		debug!("all drain watchers released");
	}
}

#[derive(Clone)]
pub struct DrainWatcher {
	signal_rx: watch::Receiver<Option<DrainMode>>,
	holder_tx: mpsc::Sender<Never>,
}

impl DrainWatcher {
	/// Completes when a drain has been requested. The returned
	/// [ReleaseShutdown] continues to block the trigger until dropped.
	pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
		let mode = loop {
			// If the trigger is dropped without signalling, treat it as an
			// immediate drain so holders do not wait forever.
			if self.signal_rx.changed().await.is_err() {
				break DrainMode::Immediate;
			}
			if let Some(mode) = *self.signal_rx.borrow() {
				break mode;
			}
		};
		ReleaseShutdown {
			_holder: self.holder_tx,
			mode,
		}
	}
}

/// A completed drain signal. Holding this blocks the [DrainTrigger] from
/// resolving, allowing the holder to finish cleanup first.
pub struct ReleaseShutdown {
	_holder: mpsc::Sender<Never>,
	mode: DrainMode,
}

impl ReleaseShutdown {
	pub fn mode(&self) -> DrainMode {
		self.mode
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicBool, Ordering};
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn trigger_waits_for_watchers() {
		let (trigger, watcher) = new();
		let done = Arc::new(AtomicBool::new(false));
		let done2 = done.clone();
		let task = tokio::spawn(async move {
			let release = watcher.wait_for_drain().await;
			assert_eq!(release.mode(), DrainMode::Graceful);
			tokio::time::sleep(Duration::from_millis(20)).await;
			done2.store(true, Ordering::SeqCst);
			drop(release);
		});
		trigger.start_drain_and_wait(DrainMode::Graceful).await;
		assert!(done.load(Ordering::SeqCst));
		task.await.unwrap();
	}

	#[tokio::test]
	async fn dropped_trigger_releases_watchers() {
		let (trigger, watcher) = new();
		drop(trigger);
		let release = watcher.wait_for_drain().await;
		assert_eq!(release.mode(), DrainMode::Immediate);
	}
}
