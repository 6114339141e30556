//! The request pipeline: admit, match, filter, forward, retry, emit.
//!
//! Every request reads the snapshot exactly once and holds that handle for
//! its entire lifetime; a concurrent swap never changes what the request
//! sees. All long-lived state the pipeline touches (pools, breakers,
//! outliers, budgets) is reached through registries shared across snapshots.

use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyStream, StreamBody};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use relay_core::drain::DrainWatcher;
use tokio::net::TcpListener;
use tracing::{debug, trace, warn};

use crate::cache::coalesce::{Coalescer, FlightOutcome, StartResult};
use crate::cache::{self, CacheEntry, MemoryStore};
use crate::filters;
use crate::http::{self, Body, HeaderValue, Request, Response, header, x_headers};
use crate::proxy::{ErrorCategory, ProxyError, inflight};
use crate::snapshot::build::Registries;
use crate::snapshot::{RoutePolicy, Snapshot, Store};
use crate::telemetry::log::{DropOnLog, LogBody, RequestLog};
use crate::telemetry::metrics::{
	CacheLabels, Metrics, PoolCategoryLabels, PoolLabels, RouteCategoryLabels, RouteLabels,
	RouteReasonLabels, RouteStatusLabels, VariantLabels, status_class,
};
use crate::telemetry::rolling::RollingCounter;
use crate::traffic::Variant;
use crate::transport::TlsConnectionInfo;
use crate::{PoolKey, Strng, strng};

/// Request bodies buffered for replay across retry attempts are capped here;
/// larger bodies disable retries rather than ballooning memory.
const MAX_REPLAY_BYTES: usize = 64 * 1024;
/// Fallback wait for coalesced followers when the route has no timeout.
const DEFAULT_COALESCE_WAIT: Duration = Duration::from_secs(10);

pub struct ProxyInputs {
	pub store: Arc<Store>,
	pub registries: Arc<Registries>,
	pub filters: Arc<filters::Registry>,
	pub metrics: Arc<Metrics>,
	pub cache: Arc<MemoryStore>,
	pub coalescer: Arc<Coalescer>,
	pub inflight: Arc<inflight::Tracker>,
	pub rolling: Arc<RollingCounter>,
}

#[derive(Clone)]
pub struct HttpProxy {
	pub inputs: Arc<ProxyInputs>,
}

impl HttpProxy {
	pub fn new(inputs: Arc<ProxyInputs>) -> HttpProxy {
		HttpProxy { inputs }
	}

	/// Entry point for one request. Never fails; errors become responses.
	pub async fn handle(
		&self,
		req: ::http::Request<Incoming>,
		remote: SocketAddr,
		tls: Option<TlsConnectionInfo>,
	) -> Response {
		let start = Instant::now();
		let snapshot = self.inputs.store.get();
		let inflight = self.inputs.inflight.acquire();

		let mut req = req.map(Body::new);
		let request_id = ensure_request_id(&mut req);

		let mut log = RequestLog {
			start: Some(start),
			request_id: Some(request_id.clone()),
			method: Some(req.method().clone()),
			host: http::get_host(&req).map(|h| h.to_string()),
			path: Some(req.uri().path().to_string()),
			snapshot_version: Some(snapshot.version.clone()),
			remote_addr: Some(remote),
			bytes_in: req
				.headers()
				.get(header::CONTENT_LENGTH)
				.and_then(|v| v.to_str().ok())
				.and_then(|v| v.parse().ok())
				.unwrap_or(0),
			user_agent: req
				.headers()
				.get(header::USER_AGENT)
				.and_then(|v| v.to_str().ok())
				.map(|s| s.to_string()),
			..Default::default()
		};

		let result = self
			.handle_internal(&snapshot, req, remote, tls.as_ref(), start, &mut log)
			.await;

		let (mut resp, error) = match result {
			Ok(resp) => (resp, None),
			Err(err) => {
				let category = err.category();
				log.error_category = Some(category);
				self.count_rejection(&log, &err);
				(err.into_response(), Some(category))
			},
		};
		if error.is_some() {
			trace!(request_id = %request_id, ?error, "request failed");
		}

		http::strip_hop_by_hop_headers(resp.headers_mut());
		if let Ok(value) = HeaderValue::try_from(request_id.as_str()) {
			resp.headers_mut().insert(x_headers::X_REQUEST_ID, value);
		}

		let status = resp.status();
		log.status = Some(status);
		let route_label = self.inputs.metrics.route(
			log
				.route_id
				.as_ref()
				.unwrap_or(&strng::literal!("unmatched")),
		);
		self
			.inputs
			.metrics
			.requests
			.get_or_create(&RouteStatusLabels {
				route: route_label.clone().into(),
				status_class: status_class(status).into(),
			})
			.inc();
		self
			.inputs
			.metrics
			.request_duration
			.get_or_create(&RouteLabels {
				route: route_label.into(),
			})
			.observe(start.elapsed().as_secs_f64());
		self.inputs.rolling.record(status, Instant::now());

		let log: DropOnLog = log.into();
		resp.map(move |b| Body::new(LogBody::new(b, log, Some(inflight))))
	}

	async fn handle_internal(
		&self,
		snapshot: &Arc<Snapshot>,
		mut req: Request,
		remote: SocketAddr,
		tls: Option<&TlsConnectionInfo>,
		start: Instant,
		log: &mut RequestLog,
	) -> Result<Response, ProxyError> {
		let host = http::get_host(&req)
			.map(|h| h.to_string())
			.ok_or(ProxyError::RouteNotFound)?;
		let route = snapshot
			.routes
			.matches(&host, req.uri().path(), req.method())
			.ok_or(ProxyError::RouteNotFound)?;
		log.route_id = Some(route.id.clone());
		debug!(route = %route.id, %host, "matched route");
		let policy = snapshot
			.policy(&route.id)
			.ok_or_else(|| ProxyError::Processing(anyhow::anyhow!("route without policy")))?;

		// mTLS gate: the listener verified the chain; the route checks
		// presence and, when pinned, the issuing CA.
		if policy.require_mtls && !peer_accepted(tls, policy.mtls_ca_subject.as_deref()) {
			return Err(ProxyError::MtlsRequired);
		}

		if self.inputs.inflight.count() > snapshot.limits.max_inflight {
			return Err(ProxyError::Overload);
		}

		if let Some(len) = req
			.headers()
			.get(header::CONTENT_LENGTH)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.parse::<u64>().ok())
			&& len > snapshot.limits.max_body_bytes
		{
			return Err(ProxyError::BodyTooLarge);
		}

		// Traffic split: canary cohorts go to the alternate pool, or to the
		// same pool under a separate label.
		let mut pool_key = route.pool.clone();
		if let Some(split) = self.inputs.registries.traffic.get(&route.id)
			&& split.enabled
		{
			let variant = split.select(req.headers(), remote.ip());
			if variant == Variant::Canary
				&& let Some(canary) = &split.canary_pool
			{
				pool_key = canary.clone();
			}
			self
				.inputs
				.metrics
				.variant_requests
				.get_or_create(&VariantLabels {
					route: self.inputs.metrics.route(&route.id).into(),
					variant: variant.as_str().into(),
				})
				.inc();
		}
		log.pool_key = Some(pool_key.clone());

		prepare_upstream_request(&mut req, remote);

		// Filter request phase.
		if !policy.plugins.is_empty() {
			let (mut parts, body) = req.into_parts();
			match self
				.inputs
				.filters
				.apply_request(&policy.plugins, &mut parts)
				.await?
			{
				filters::RequestVerdict::ShortCircuit(resp) => return Ok(*resp),
				filters::RequestVerdict::Continue => {},
			}
			req = Request::from_parts(parts, body);
		}

		let mut resp = self
			.serve_from_cache_or_upstream(snapshot, &policy, &pool_key, req, &host, start, log)
			.await?;

		// Filter response phase.
		if !policy.plugins.is_empty() {
			self
				.inputs
				.filters
				.apply_response(&policy.plugins, &mut resp)
				.await;
		}
		Ok(resp)
	}

	/// Step 9: cache lookup and single-flight coalescing around the forward.
	#[allow(clippy::too_many_arguments)]
	async fn serve_from_cache_or_upstream(
		&self,
		snapshot: &Arc<Snapshot>,
		policy: &Arc<RoutePolicy>,
		pool_key: &PoolKey,
		req: Request,
		host: &str,
		start: Instant,
		log: &mut RequestLog,
	) -> Result<Response, ProxyError> {
		let Some(cache_policy) = policy.cache.as_ref().filter(|c| c.enabled) else {
			return self.forward(snapshot, policy, pool_key, req, start, log).await;
		};
		if !cache::is_cacheable_request(req.method()) {
			self.count_cache(&policy.route, "bypass");
			return self.forward(snapshot, policy, pool_key, req, start, log).await;
		}

		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|p| p.as_str().to_string())
			.unwrap_or_else(|| req.uri().path().to_string());
		let key = cache::fingerprint(
			&policy.route,
			req.method(),
			host,
			&path_and_query,
			&cache_policy.vary_headers,
			req.headers(),
		);

		let now = Instant::now();
		if let Some(entry) = self.inputs.cache.get(&key, now) {
			self.count_cache(&policy.route, "hit");
			return Ok(entry.to_response());
		}
		self.count_cache(&policy.route, "miss");

		match self.inputs.coalescer.start(&key, now) {
			StartResult::Leader(leader) => {
				let resp = self.forward(snapshot, policy, pool_key, req, start, log).await;
				match resp {
					Ok(resp) if cache::is_cacheable_response(resp.status(), resp.headers()) => {
						let (parts, body) = resp.into_parts();
						let bytes = body
							.collect_up_to(snapshot.limits.max_body_bytes as usize)
							.await
							.map_err(ProxyError::UpstreamRead)?;
						let entry = CacheEntry {
							status: parts.status,
							headers: parts.headers,
							body: bytes,
							stored_at: Instant::now(),
							ttl: cache_policy.ttl,
						};
						if entry.body.len() <= cache_policy.max_object_bytes {
							self.inputs.cache.insert(key.clone(), entry.clone());
							self.count_cache(&policy.route, "store");
						} else {
							self.count_cache(&policy.route, "store_fail");
						}
						let resp = entry.to_response();
						leader.finish(Some(entry));
						Ok(resp)
					},
					Ok(resp) => {
						leader.finish(None);
						Ok(resp)
					},
					Err(e) => {
						// Dropping the guard wakes followers with no result.
						drop(leader);
						Err(e)
					},
				}
			},
			StartResult::Follower(flight) => {
				let wait = policy.request_timeout.unwrap_or(DEFAULT_COALESCE_WAIT);
				match flight.wait(wait).await {
					FlightOutcome::Finished(Some(entry)) => {
						self.count_cache(&policy.route, "coalesced");
						Ok(entry.to_response())
					},
					FlightOutcome::Finished(None) => {
						self.forward(snapshot, policy, pool_key, req, start, log).await
					},
					FlightOutcome::Breakaway => {
						self
							.inputs
							.metrics
							.cache_coalesce_breakaway
							.get_or_create(&RouteLabels {
								route: self.inputs.metrics.route(&policy.route).into(),
							})
							.inc();
						self.forward(snapshot, policy, pool_key, req, start, log).await
					},
				}
			},
			StartResult::Full => self.forward(snapshot, policy, pool_key, req, start, log).await,
		}
	}

	/// Steps 10-12: pick, dispatch, and retry within the route budget.
	async fn forward(
		&self,
		snapshot: &Arc<Snapshot>,
		policy: &Arc<RoutePolicy>,
		pool_key: &PoolKey,
		req: Request,
		start: Instant,
		log: &mut RequestLog,
	) -> Result<Response, ProxyError> {
		let deadline = policy.request_timeout.map(|t| start + t);
		let client_signaled = req.headers().contains_key("x-retry-attempt");

		let retry = policy
			.retry
			.as_ref()
			.filter(|r| r.method_retryable(req.method()));
		let attempts = retry
			.map(|r| r.effective_attempts(policy.client_retry_cap, client_signaled))
			.unwrap_or(1);

		let (parts, body) = req.into_parts();
		let body = if attempts > 1 {
			match buffer_body(body, MAX_REPLAY_BYTES).await {
				Ok(bytes) => Ok(bytes),
				Err(body) => {
					debug!("request body too large to replay, disabling retries");
					Err(body)
				},
			}
		} else {
			Err(body)
		};

		let replay = match body {
			Ok(bytes) => bytes,
			Err(body) => {
				// Streaming body: a single attempt, no replay possible.
				let req = Request::from_parts(parts, body);
				return self
					.attempt(snapshot, policy, pool_key, req, deadline, log)
					.await;
			},
		};

		let mut result = None;
		for n in 0..attempts {
			let last = n + 1 == attempts;
			let mut parts = parts.clone();
			if n > 0 {
				parts.headers.insert(
					http::HeaderName::from_static("x-retry-attempt"),
					HeaderValue::from(n),
				);
			}
			let req = Request::from_parts(parts, Body::from(replay.clone()));
			let res = self
				.attempt(snapshot, policy, pool_key, req, deadline, log)
				.await;

			let retry_reason = match (&res, retry) {
				(_, None) => None,
				(Ok(resp), Some(r)) => r
					.response_retryable(resp.status())
					.then(|| strng::new(status_class(resp.status()))),
				(Err(e), Some(r)) => {
					if e.is_local_rejection() {
						// Never burn budget on rejections that made no
						// upstream attempt.
						None
					} else {
						r.error_retryable(e).then(|| strng::new(e.category().as_str()))
					}
				},
			};
			let Some(reason) = retry_reason else {
				return res;
			};
			if last {
				return res;
			}
			let now = Instant::now();
			if !policy.budget.try_withdraw(now) {
				self
					.inputs
					.metrics
					.retry_budget_exhausted
					.get_or_create(&RouteLabels {
						route: self.inputs.metrics.route(&policy.route).into(),
					})
					.inc();
				debug!(route = %policy.route, "retry budget exhausted");
				return res;
			}
			let backoff = retry.expect("reason implies policy").backoff(n + 1);
			if let Some(deadline) = deadline
				&& now + backoff >= deadline
			{
				return res;
			}
			self
				.inputs
				.metrics
				.retries
				.get_or_create(&RouteReasonLabels {
					route: self.inputs.metrics.route(&policy.route).into(),
					reason: reason.into(),
				})
				.inc();
			tokio::time::sleep(backoff).await;
			result = Some(res);
		}
		result.expect("loop always returns or records a result")
	}

	/// One upstream attempt: breaker admission, endpoint pick, dispatch, and
	/// the accounting fan-out (breaker, outlier, passive health, budget).
	async fn attempt(
		&self,
		snapshot: &Arc<Snapshot>,
		policy: &Arc<RoutePolicy>,
		pool_key: &PoolKey,
		req: Request,
		deadline: Option<Instant>,
		log: &mut RequestLog,
	) -> Result<Response, ProxyError> {
		let now = Instant::now();
		let pool = snapshot
			.pool(pool_key)
			.ok_or_else(|| ProxyError::PoolNotFound(pool_key.clone()))?;
		let breaker = self.inputs.registries.breakers.get(pool_key);

		if let Some(b) = &breaker
			&& !b.allow(now)
		{
			self
				.inputs
				.metrics
				.circuit_open
				.get_or_create(&PoolLabels {
					pool: self.inputs.metrics.pool(pool_key).into(),
				})
				.inc();
			return Err(ProxyError::CircuitOpen(pool_key.clone()));
		}

		let outliers = self.inputs.registries.outliers.clone();
		let Some(pick) = pool.pick(now, |addr| outliers.is_ejected(pool_key, addr, now)) else {
			if let Some(b) = &breaker {
				b.record(false, now);
			}
			return Err(ProxyError::NoHealthyEndpoint(pool_key.clone()));
		};
		if pick.outlier_ignored {
			self
				.inputs
				.metrics
				.outlier_fail_open
				.get_or_create(&PoolLabels {
					pool: self.inputs.metrics.pool(pool_key).into(),
				})
				.inc();
		}
		let endpoint = pick.endpoint;
		let _ep_inflight = endpoint.inflight_guard();
		log.upstream_addr = Some(endpoint.addr_str.clone());
		trace!(pool = %pool_key, endpoint = %endpoint.addr_str, healthy = pick.selected_healthy, "picked endpoint");

		let per_try = policy.retry.as_ref().and_then(|r| r.per_try_timeout);
		let rt_start = Instant::now();
		let client = pool.client();
		let call = client.call(req, endpoint.addr, policy.response_header_timeout);
		let res = match (per_try, deadline) {
			(None, None) => call.await,
			_ => {
				let attempt_deadline = [
					per_try.map(|t| rt_start + t),
					deadline,
				]
				.into_iter()
				.flatten()
				.min()
				.expect("at least one deadline is set");
				match tokio::time::timeout_at(attempt_deadline.into(), call).await {
					Ok(res) => res,
					Err(_) => {
						// Distinguish the overall deadline from a per-try one.
						if deadline.is_some_and(|d| Instant::now() >= d) {
							Err(ProxyError::RequestTimeout)
						} else {
							Err(ProxyError::UpstreamTimeout)
						}
					},
				}
			},
		};
		let elapsed = rt_start.elapsed();
		self
			.inputs
			.metrics
			.upstream_roundtrip
			.get_or_create(&PoolLabels {
				pool: self.inputs.metrics.pool(pool_key).into(),
			})
			.observe(elapsed.as_secs_f64());

		let health = pool.health();
		let done = Instant::now();
		match res {
			Ok(resp) => {
				let success = !resp.status().is_server_error();
				if let Some(b) = &breaker {
					b.record(success, done);
				}
				outliers.record_result(
					pool_key,
					&endpoint.addr_str,
					success,
					success.then_some(elapsed),
					done,
				);
				endpoint.record_passive_result(success, &health, done);
				if success {
					policy.budget.record_success(done);
				} else {
					self.count_upstream_error(pool_key, ErrorCategory::Http5xx);
				}
				// Push the remaining overall deadline into the response body.
				let resp = match deadline {
					Some(d) => http::timeout::BodyTimeout::Deadline(d.into()).apply(resp),
					None => resp,
				};
				Ok(resp)
			},
			Err(e) => {
				if let Some(b) = &breaker {
					b.record(false, done);
				}
				outliers.record_result(pool_key, &endpoint.addr_str, false, None, done);
				endpoint.record_passive_result(false, &health, done);
				self.count_upstream_error(pool_key, e.category());
				Err(e)
			},
		}
	}

	fn count_cache(&self, route: &Strng, status: &'static str) {
		self
			.inputs
			.metrics
			.cache_requests
			.get_or_create(&CacheLabels {
				route: self.inputs.metrics.route(route).into(),
				status: status.into(),
			})
			.inc();
	}

	fn count_upstream_error(&self, pool: &PoolKey, category: ErrorCategory) {
		self
			.inputs
			.metrics
			.upstream_errors
			.get_or_create(&PoolCategoryLabels {
				pool: self.inputs.metrics.pool(pool).into(),
				category: category.as_str().into(),
			})
			.inc();
	}

	fn count_rejection(&self, log: &RequestLog, err: &ProxyError) {
		let metrics = &self.inputs.metrics;
		let route = metrics.route(
			log
				.route_id
				.as_ref()
				.unwrap_or(&strng::literal!("unmatched")),
		);
		match err {
			ProxyError::Overload => {
				metrics
					.overload_reject
					.get_or_create(&RouteLabels {
						route: route.clone().into(),
					})
					.inc();
			},
			ProxyError::MtlsRequired => {
				metrics
					.mtls_reject
					.get_or_create(&RouteLabels {
						route: route.clone().into(),
					})
					.inc();
			},
			_ => {},
		}
		if err.is_local_rejection() {
			metrics
				.proxy_errors
				.get_or_create(&RouteCategoryLabels {
					route: route.into(),
					category: err.category().as_str().into(),
				})
				.inc();
		}
	}
}

fn peer_accepted(tls: Option<&TlsConnectionInfo>, pinned_ca_subject: Option<&str>) -> bool {
	let Some(tls) = tls else { return false };
	let Some(certs) = &tls.peer_certificates else {
		return false;
	};
	if certs.is_empty() {
		return false;
	}
	match pinned_ca_subject {
		None => true,
		Some(subject) => tls.peer_issuer().as_deref() == Some(subject),
	}
}

fn ensure_request_id(req: &mut Request) -> Strng {
	if let Some(id) = req
		.headers()
		.get(x_headers::X_REQUEST_ID)
		.and_then(|v| v.to_str().ok())
		.filter(|v| !v.is_empty())
	{
		return strng::new(id);
	}
	let mut bytes = [0u8; 16];
	rand::fill(&mut bytes);
	let id = strng::new(hex::encode(bytes));
	if let Ok(value) = HeaderValue::try_from(id.as_str()) {
		req.headers_mut().insert(x_headers::X_REQUEST_ID, value);
	}
	id
}

/// Strips hop-by-hop headers and appends this hop to X-Forwarded-For.
fn prepare_upstream_request(req: &mut Request, remote: SocketAddr) {
	http::strip_hop_by_hop_headers(req.headers_mut());
	let prior = req
		.headers()
		.get(x_headers::X_FORWARDED_FOR)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string());
	let xff = match prior {
		Some(prior) => format!("{prior}, {}", remote.ip()),
		None => remote.ip().to_string(),
	};
	if let Ok(value) = HeaderValue::try_from(xff) {
		req.headers_mut().insert(x_headers::X_FORWARDED_FOR, value);
	}
}

/// Buffers up to `limit` bytes for retry replay. Over the limit, the already
/// read frames are stitched back in front of the remaining stream and the
/// request proceeds without retries.
async fn buffer_body(body: Body, limit: usize) -> Result<Bytes, Body> {
	let mut stream = BodyStream::new(body);
	let mut buffered: Vec<Bytes> = Vec::new();
	let mut total = 0usize;
	loop {
		match stream.next().await {
			None => {
				let mut out = Vec::with_capacity(total);
				for b in &buffered {
					out.extend_from_slice(b);
				}
				return Ok(Bytes::from(out));
			},
			Some(Ok(frame)) => {
				match frame.into_data() {
					Ok(data) => {
						total += data.len();
						buffered.push(data);
						if total > limit {
							break;
						}
					},
					// Trailers end the data stream for our purposes.
					Err(_) => continue,
				}
			},
			Some(Err(_)) => break,
		}
	}
	let replay = futures_util::stream::iter(
		buffered
			.into_iter()
			.map(|b| Ok(http_body::Frame::data(b))),
	);
	Err(Body::new(StreamBody::new(replay.chain(stream))))
}

/// Accept loop for one listener. On a TLS listener the handshake config is
/// read from the current snapshot per connection; in-flight connections keep
/// the config they started with.
pub async fn serve(
	proxy: HttpProxy,
	listener: TcpListener,
	tls_listener: bool,
	drain: DrainWatcher,
) -> anyhow::Result<()> {
	let graceful = GracefulShutdown::new();
	let mut drain_fut = pin!(drain.wait_for_drain());
	// Held until the connections drain, so the trigger does not resolve
	// while responses are still streaming.
	let release = loop {
		tokio::select! {
			res = listener.accept() => {
				let (stream, remote) = match res {
					Ok(ok) => ok,
					Err(e) => {
						warn!(err = %e, "accept failed");
						continue;
					},
				};
				spawn_connection(&proxy, &graceful, stream, remote, tls_listener);
			}
			release = &mut drain_fut => {
				break release;
			}
		}
	};
	drop(listener);
	let timeout = proxy.inputs.store.get().shutdown.graceful_timeout;
	debug!("listener closed, draining connections");
	if tokio::time::timeout(timeout, graceful.shutdown())
		.await
		.is_err()
	{
		warn!("graceful connection drain timed out, force closing");
	}
	drop(release);
	Ok(())
}

fn spawn_connection(
	proxy: &HttpProxy,
	graceful: &GracefulShutdown,
	stream: tokio::net::TcpStream,
	remote: SocketAddr,
	tls_listener: bool,
) {
	let proxy = proxy.clone();
	let snapshot = proxy.inputs.store.get();
	let tls_config = if tls_listener {
		snapshot.tls.clone().filter(|_| snapshot.tls_enabled)
	} else {
		None
	};
	let limits = snapshot.limits.clone();
	drop(snapshot);
	let watcher = graceful.watcher();
	tokio::spawn(async move {
		let _ = stream.set_nodelay(true);
		match tls_config {
			Some(cfg) => {
				let acceptor = tokio_rustls::TlsAcceptor::from(cfg);
				let tls_stream = match acceptor.accept(stream).await {
					Ok(s) => s,
					Err(e) => {
						debug!(err = %e, %remote, "TLS handshake failed");
						return;
					},
				};
				let info = {
					let (_, conn) = tls_stream.get_ref();
					TlsConnectionInfo {
						sni: conn.server_name().map(|s| s.to_string()),
						peer_certificates: conn.peer_certificates().map(|c| c.to_vec()),
					}
				};
				serve_http(proxy, watcher, tls_stream, remote, Some(info), limits).await;
			},
			None => {
				serve_http(proxy, watcher, stream, remote, None, limits).await;
			},
		}
	});
}

async fn serve_http<S>(
	proxy: HttpProxy,
	watcher: hyper_util::server::graceful::Watcher,
	stream: S,
	remote: SocketAddr,
	tls: Option<TlsConnectionInfo>,
	limits: crate::snapshot::Limits,
) where
	S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
	let service = hyper::service::service_fn(move |req: ::http::Request<Incoming>| {
		let proxy = proxy.clone();
		let tls = tls.clone();
		async move { Ok::<_, std::convert::Infallible>(proxy.handle(req, remote, tls).await) }
	});
	let mut builder = auto::Builder::new(TokioExecutor::new());
	builder
		.http1()
		.timer(TokioTimer::new())
		.header_read_timeout(limits.read_header_timeout)
		.max_buf_size(limits.max_header_bytes.max(16 * 1024));
	builder.http2().timer(TokioTimer::new());
	let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
	if let Err(e) = watcher.watch(conn.into_owned()).await {
		debug!(err = %e, %remote, "connection closed with error");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn buffer_body_small_bodies_round_trip() {
		let body = Body::from("hello");
		let bytes = buffer_body(body, 1024).await.unwrap();
		assert_eq!(bytes, "hello");
	}

	#[tokio::test]
	async fn buffer_body_large_bodies_fall_back_to_streaming() {
		let payload = vec![7u8; 2048];
		let body = Body::from(payload.clone());
		let body = match buffer_body(body, 16).await {
			Err(b) => b,
			Ok(_) => panic!("expected streaming fallback"),
		};
		// Nothing was lost in the fallback.
		let bytes = body.collect_up_to(1 << 20).await.unwrap();
		assert_eq!(bytes.as_ref(), payload.as_slice());
	}

	#[test]
	fn request_id_preserved_or_generated() {
		let mut req = ::http::Request::builder()
			.uri("/")
			.header("x-request-id", "abc123")
			.body(Body::empty())
			.unwrap();
		assert_eq!(ensure_request_id(&mut req), strng::new("abc123"));

		let mut req = ::http::Request::builder().uri("/").body(Body::empty()).unwrap();
		let id = ensure_request_id(&mut req);
		assert_eq!(id.len(), 32);
		assert_eq!(
			req.headers().get(x_headers::X_REQUEST_ID).unwrap(),
			&id.as_str()
		);
	}

	#[test]
	fn xff_appends_client_ip() {
		let mut req = ::http::Request::builder()
			.uri("/")
			.header("x-forwarded-for", "10.0.0.1")
			.header("connection", "keep-alive")
			.body(Body::empty())
			.unwrap();
		prepare_upstream_request(&mut req, "192.168.1.5:4242".parse().unwrap());
		assert_eq!(
			req.headers().get(x_headers::X_FORWARDED_FOR).unwrap(),
			"10.0.0.1, 192.168.1.5"
		);
		assert!(!req.headers().contains_key("connection"));
	}
}
