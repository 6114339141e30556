//! Shared harness for integration tests: stub upstreams and an assembled
//! proxy listening on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use relay_core::drain::{self, DrainMode, DrainTrigger};
use relayd::apply;
use relayd::client::{ClientConfig, HttpClient};
use relayd::http::StatusCode;
use relayd::proxy::httpproxy;
use relayd::rollout::RolloutConfig;
use tokio::net::TcpListener;

/// A stub upstream endpoint. `fail` toggles 500 responses; `delay` applies
/// to every response; `hits` counts requests served.
pub struct Upstream {
	pub addr: SocketAddr,
	pub hits: Arc<AtomicUsize>,
	pub fail: Arc<AtomicBool>,
}

impl Upstream {
	pub fn endpoint(&self) -> String {
		self.addr.to_string()
	}

	pub fn hits(&self) -> usize {
		self.hits.load(Ordering::SeqCst)
	}
}

pub async fn upstream(body: &'static str, delay: Duration) -> Upstream {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let hits = Arc::new(AtomicUsize::new(0));
	let fail = Arc::new(AtomicBool::new(false));
	let hits2 = hits.clone();
	let fail2 = fail.clone();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			let hits = hits2.clone();
			let fail = fail2.clone();
			tokio::spawn(async move {
				let service = service_fn(move |req: ::http::Request<Incoming>| {
					let hits = hits.clone();
					let fail = fail.clone();
					async move {
						let _ = req.into_body().collect().await;
						hits.fetch_add(1, Ordering::SeqCst);
						if !delay.is_zero() {
							tokio::time::sleep(delay).await;
						}
						let status = if fail.load(Ordering::SeqCst) {
							StatusCode::INTERNAL_SERVER_ERROR
						} else {
							StatusCode::OK
						};
						Ok::<_, std::convert::Infallible>(
							::http::Response::builder()
								.status(status)
								.body(Full::new(Bytes::from_static(body.as_bytes())))
								.unwrap(),
						)
					}
				});
				let _ = hyper::server::conn::http1::Builder::new()
					.serve_connection(TokioIo::new(stream), service)
					.await;
			});
		}
	});
	Upstream { addr, hits, fail }
}

pub struct TestProxy {
	pub addr: SocketAddr,
	pub app: Arc<relayd::app::App>,
	client: HttpClient,
	drain: Option<DrainTrigger>,
}

pub async fn start_proxy(config: serde_json::Value) -> TestProxy {
	relay_core::telemetry::testing_logging();
	let mut prom = prometheus_client::registry::Registry::default();
	let app = Arc::new(relayd::app::build(
		vec![],
		apply::Options::default(),
		RolloutConfig::default(),
		vec![],
		&mut prom,
	));
	let bytes = serde_json::to_vec(&config).unwrap();
	app
		.apply
		.apply_bytes(&bytes, relayd::strng::literal!("test"), apply::Mode::Apply)
		.await
		.expect("test config applies");

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let (trigger, watcher) = drain::new();
	tokio::spawn(httpproxy::serve(app.proxy(), listener, false, watcher));

	TestProxy {
		addr,
		app,
		client: HttpClient::new(ClientConfig {
			dial_timeout: Duration::from_secs(2),
			..ClientConfig::default()
		}),
		drain: Some(trigger),
	}
}

impl TestProxy {
	pub fn client(&self) -> HttpClient {
		self.client.clone()
	}

	pub async fn get(&self, path: &str) -> (StatusCode, Bytes) {
		self.request(::http::Method::GET, path, &[]).await
	}

	pub async fn request(
		&self,
		method: ::http::Method,
		path: &str,
		headers: &[(&str, &str)],
	) -> (StatusCode, Bytes) {
		let mut builder = ::http::Request::builder().method(method).uri(path);
		for (k, v) in headers {
			builder = builder.header(*k, *v);
		}
		let req = builder.body(relayd::http::Body::empty()).unwrap();
		let resp = self
			.client
			.call(req, self.addr, Some(Duration::from_secs(5)))
			.await
			.expect("proxy reachable");
		let (parts, body) = resp.into_parts();
		let bytes = body.collect_up_to(1 << 20).await.unwrap();
		(parts.status, bytes)
	}

	pub async fn response_header(&self, path: &str, name: &str) -> Option<String> {
		let req = ::http::Request::builder()
			.method(::http::Method::GET)
			.uri(path)
			.body(relayd::http::Body::empty())
			.unwrap();
		let resp = self
			.client
			.call(req, self.addr, Some(Duration::from_secs(5)))
			.await
			.expect("proxy reachable");
		resp
			.headers()
			.get(name)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string())
	}

	/// Stops accepting and waits for connections to drain.
	pub async fn shutdown(mut self) {
		if let Some(trigger) = self.drain.take() {
			trigger.start_drain_and_wait(DrainMode::Graceful).await;
		}
		self.app.shutdown().await;
	}
}
