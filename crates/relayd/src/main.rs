use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relay_core::drain::{self, DrainMode};
use relayd::apply;
use relayd::config::provider::{FileProvider, Provider};
use relayd::proxy::httpproxy;
use relayd::rollout::RolloutConfig;
use relayd::strng;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "relayd", about = "Reverse HTTP proxy with staged config rollout")]
struct Args {
	/// Plain HTTP listener address.
	#[arg(long, default_value = ":8080")]
	http_addr: String,
	/// TLS listener address; empty disables the TLS listener.
	#[arg(long, default_value = "")]
	tls_addr: String,
	/// Path to the JSON configuration file.
	#[arg(long)]
	config: Option<PathBuf>,
	/// Interval between provider re-pulls.
	#[arg(long, default_value = "5s", value_parser = parse_duration)]
	pull_interval: Duration,
	/// Random jitter added to each pull.
	#[arg(long, default_value = "500ms", value_parser = parse_duration)]
	pull_jitter: Duration,
	/// How long the locked rollout stage bakes before the gate check.
	#[arg(long, default_value = "1m", value_parser = parse_duration)]
	rollout_locked_bake: Duration,
	/// Window the rollout gate inspects for elevated 5xx.
	#[arg(long, default_value = "10s", value_parser = parse_duration)]
	rollout_error_window: Duration,
	/// 5xx percentage above which a rollout is gated and rolled back.
	#[arg(long, default_value_t = 1.0)]
	rollout_error_percent: f64,
	/// Ed25519 public key (raw or base64 file) for bundle verification.
	#[arg(long)]
	bundle_public_key: Option<PathBuf>,
	/// How long shutdown waits for in-flight requests.
	#[arg(long, default_value = "30s", value_parser = parse_duration)]
	graceful_timeout: Duration,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
	let s = s.trim();
	let (value, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
	let value: u64 = value.parse().map_err(|_| format!("invalid duration {s:?}"))?;
	match unit {
		"ms" => Ok(Duration::from_millis(value)),
		"s" | "" => Ok(Duration::from_secs(value)),
		"m" => Ok(Duration::from_secs(value * 60)),
		"h" => Ok(Duration::from_secs(value * 3600)),
		_ => Err(format!("invalid duration unit {unit:?}")),
	}
}

// Signal handling derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)
#[cfg(unix)]
async fn wait_for_shutdown() {
	use tokio::signal::unix::{SignalKind, signal};
	let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register signal handler");
	let mut terminate = signal(SignalKind::terminate()).expect("failed to register signal handler");
	tokio::select! {
		_ = interrupt.recv() => info!("received SIGINT, starting shutdown"),
		_ = terminate.recv() => info!("received SIGTERM, starting shutdown"),
	}
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
	let _ = tokio::signal::ctrl_c().await;
	info!("received signal, starting shutdown");
}

/// ":8080" binds the wildcard address.
fn parse_addr(addr: &str) -> anyhow::Result<SocketAddr> {
	let full = if addr.starts_with(':') {
		format!("0.0.0.0{addr}")
	} else {
		addr.to_string()
	};
	full.parse().with_context(|| format!("invalid address {addr:?}"))
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	relay_core::telemetry::setup_logging();
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("build runtime")?
		.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
	let providers: Vec<Arc<dyn Provider>> = match &args.config {
		Some(path) => vec![Arc::new(FileProvider {
			name: strng::literal!("file"),
			priority: 0,
			path: path.clone(),
		})],
		None => vec![],
	};
	let public_key = match &args.bundle_public_key {
		Some(path) => {
			let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
			relayd::rollout::bundle::load_public_key(&bytes)
				.map_err(|e| anyhow::anyhow!("bundle public key: {e}"))?
		},
		None => vec![],
	};

	let mut prom = prometheus_client::registry::Registry::default();
	let app = relayd::app::build(
		providers,
		apply::Options::default(),
		RolloutConfig {
			locked_bake: args.rollout_locked_bake,
			error_rate_window: args.rollout_error_window,
			error_rate_percent: args.rollout_error_percent,
		},
		public_key,
		&mut prom,
	);

	if args.config.is_some() {
		let out = app
			.apply
			.apply_providers(apply::Mode::Apply)
			.await
			.map_err(|e| anyhow::anyhow!("initial config apply failed: {e}"))?;
		info!(version = %out.snapshot.version, "initial configuration applied");
	}

	let (drain_trigger, drain_watcher) = drain::new();
	let mut tasks = Vec::new();

	let http_listener = TcpListener::bind(parse_addr(&args.http_addr)?)
		.await
		.with_context(|| format!("bind {}", args.http_addr))?;
	info!(addr = %args.http_addr, "HTTP listener ready");
	tasks.push(tokio::spawn(httpproxy::serve(
		app.proxy(),
		http_listener,
		false,
		drain_watcher.clone(),
	)));

	if !args.tls_addr.is_empty() {
		let tls_listener = TcpListener::bind(parse_addr(&args.tls_addr)?)
			.await
			.with_context(|| format!("bind {}", args.tls_addr))?;
		info!(addr = %args.tls_addr, "TLS listener ready");
		tasks.push(tokio::spawn(httpproxy::serve(
			app.proxy(),
			tls_listener,
			true,
			drain_watcher.clone(),
		)));
	}

	{
		let app = Arc::new(app);
		let maintenance_app = app.clone();
		let maintenance_drain = drain_watcher.clone();
		tokio::spawn(async move { maintenance_app.run_maintenance(maintenance_drain).await });
		if !args.pull_interval.is_zero() {
			let pull_app = app.clone();
			let pull_drain = drain_watcher.clone();
			let (interval, jitter) = (args.pull_interval, args.pull_jitter);
			tokio::spawn(async move { pull_app.run_pull_loop(interval, jitter, pull_drain).await });
		}
		drop(drain_watcher);

		wait_for_shutdown().await;
		info!("shutting down");

		// Stop accepting and drain the listeners within the deadline.
		let drain_all = drain_trigger.start_drain_and_wait(DrainMode::Graceful);
		if tokio::time::timeout(args.graceful_timeout, drain_all)
			.await
			.is_err()
		{
			error!("listener drain exceeded graceful timeout");
		}
		app.shutdown().await;
	}

	for task in tasks {
		task.abort();
	}
	info!("goodbye");
	Ok(())
}
