pub mod app;
pub mod apply;
pub mod cache;
pub mod client;
pub mod config;
pub mod filters;
pub mod http;
pub mod pool;
pub mod proxy;
pub mod retry;
pub mod rollout;
pub mod snapshot;
pub mod telemetry;
pub mod traffic;
pub mod transport;

pub use relay_core::strng;
pub use relay_core::strng::Strng;

/// Route identifiers, pool names, and endpoint addresses are interned
/// strings: cloned onto every request without reallocating.
pub type RouteId = Strng;
pub type PoolKey = Strng;
pub type EndpointAddr = Strng;

/// Coarse monotonic clock. State machines store instants as millisecond
/// offsets from the process epoch so they fit in atomics; 0 means unset.
pub(crate) mod clock {
	use std::sync::OnceLock;
	use std::time::Instant;

	static EPOCH: OnceLock<Instant> = OnceLock::new();

	fn epoch() -> Instant {
		*EPOCH.get_or_init(Instant::now)
	}

	/// Initialize the epoch. Called once at startup so offsets stay small.
	pub fn init() {
		let _ = epoch();
	}

	pub fn millis(at: Instant) -> u64 {
		// offset by one so 0 remains the "unset" sentinel
		at.saturating_duration_since(epoch()).as_millis() as u64 + 1
	}

	pub fn now() -> u64 {
		millis(Instant::now())
	}
}
