use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Initializes the global tracing subscriber. `RUST_LOG` controls the filter;
/// the default keeps the data path quiet.
pub fn setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer())
		.init();
}

/// Like [setup_logging], but safe to call repeatedly (tests).
pub fn testing_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let _ = tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer().with_test_writer())
		.try_init();
}
