//! Upstream HTTP client.
//!
//! One client per pool, so keepalive connections are shared by every route
//! that targets the pool and survive snapshot swaps. The dial timeout lives
//! in the connector; the response-header timeout is enforced per call since
//! it varies by route.

use std::net::SocketAddr;
use std::time::Duration;

use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tracing::trace;

use crate::http::{self, Uri};
use crate::proxy::ProxyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
	pub dial_timeout: Duration,
	pub keepalive_idle: Duration,
	pub max_idle_per_host: usize,
}

impl Default for ClientConfig {
	fn default() -> Self {
		ClientConfig {
			dial_timeout: Duration::from_secs(5),
			keepalive_idle: Duration::from_secs(90),
			max_idle_per_host: 32,
		}
	}
}

#[derive(Clone)]
pub struct HttpClient {
	client: hyper_util::client::legacy::Client<HttpConnector, http::Body>,
	config: ClientConfig,
}

impl std::fmt::Debug for HttpClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HttpClient")
			.field("config", &self.config)
			.finish()
	}
}

impl HttpClient {
	pub fn new(config: ClientConfig) -> HttpClient {
		let mut connector = HttpConnector::new();
		connector.set_connect_timeout(Some(config.dial_timeout));
		connector.set_nodelay(true);
		let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
			.pool_idle_timeout(config.keepalive_idle)
			.pool_max_idle_per_host(config.max_idle_per_host)
			.pool_timer(TokioTimer::new())
			.timer(TokioTimer::new())
			.build(connector);
		HttpClient { client, config }
	}

	pub fn config(&self) -> &ClientConfig {
		&self.config
	}

	/// Sends `req` to `dest`, rewriting the URI to absolute form. Resolves
	/// once the response headers arrive; the body continues to stream.
	pub async fn call(
		&self,
		mut req: http::Request,
		dest: SocketAddr,
		response_header_timeout: Option<Duration>,
	) -> Result<http::Response, ProxyError> {
		set_authority(&mut req, dest).map_err(ProxyError::Processing)?;
		trace!(?dest, uri = %req.uri(), "sending upstream request");
		let fut = self.client.request(req);
		let resp = match response_header_timeout {
			Some(t) => match tokio::time::timeout(t, fut).await {
				Ok(r) => r,
				Err(_) => return Err(ProxyError::UpstreamTimeout),
			},
			None => fut.await,
		};
		let resp = resp.map_err(classify_client_error)?;
		Ok(resp.map(http::Body::new))
	}
}

fn classify_client_error(err: hyper_util::client::legacy::Error) -> ProxyError {
	if err.is_connect() {
		ProxyError::UpstreamConnect(err.into())
	} else {
		ProxyError::UpstreamRead(err.into())
	}
}

fn set_authority(req: &mut http::Request, dest: SocketAddr) -> anyhow::Result<()> {
	let mut parts = std::mem::take(req.uri_mut()).into_parts();
	parts.scheme = Some(http::uri::Scheme::HTTP);
	parts.authority = Some(dest.to_string().parse()?);
	if parts.path_and_query.is_none() {
		parts.path_and_query = Some("/".parse().expect("static path is valid"));
	}
	*req.uri_mut() = Uri::from_parts(parts)?;
	Ok(())
}
