//! External filter hooks.
//!
//! A filter sees the request before forwarding and the response before it is
//! returned, and can continue, short-circuit with its own response, or fail
//! closed. The transport behind a filter (gRPC, wasm, in-process) is not this
//! module's concern; implementations register against the trait.
//!
//! Filter calls share a per-filter circuit breaker: a misbehaving filter is
//! bypassed (fail-open by default) instead of taking the data path down.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::Strng;
use crate::http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use crate::pool::breaker::{self, BreakerRuntime};
use crate::proxy::ProxyError;

/// What a filter wants done with the request.
#[derive(Debug)]
pub enum FilterAction {
	Continue,
	ShortCircuit {
		status: StatusCode,
		headers: HeaderMap,
		body: Bytes,
	},
	FailClosed,
}

/// Response-phase edits. Only headers on the allowed list and the status
/// code are honored.
#[derive(Debug, Default)]
pub struct ResponseMutation {
	pub set_headers: Vec<(HeaderName, HeaderValue)>,
	pub status: Option<StatusCode>,
}

#[async_trait]
pub trait Filter: Send + Sync {
	fn name(&self) -> Strng;

	/// When true, a breaker-open or failed filter call rejects the request
	/// instead of being bypassed.
	fn fail_closed(&self) -> bool {
		false
	}

	fn call_timeout(&self) -> Duration {
		Duration::from_secs(1)
	}

	async fn on_request(&self, head: &mut ::http::request::Parts) -> anyhow::Result<FilterAction>;

	async fn on_response(
		&self,
		head: &::http::response::Parts,
	) -> anyhow::Result<ResponseMutation> {
		let _ = head;
		Ok(ResponseMutation::default())
	}
}

/// Response headers filters may set. Anything else is dropped.
fn response_header_allowed(name: &HeaderName) -> bool {
	name.as_str().starts_with("x-")
		|| matches!(
			name.as_str(),
			"cache-control" | "content-type" | "warning" | "vary"
		)
}

pub enum RequestVerdict {
	/// All filters ran (or were bypassed); carry on.
	Continue,
	/// A filter produced the response itself.
	ShortCircuit(Box<Response>),
}

pub struct Registry {
	filters: RwLock<HashMap<Strng, Arc<dyn Filter>>>,
	breakers: breaker::Registry,
}

impl Registry {
	pub fn new() -> Registry {
		Registry {
			filters: RwLock::new(HashMap::new()),
			breakers: breaker::Registry::new(Arc::new(|_, _| {})),
		}
	}

	pub fn register(&self, filter: Arc<dyn Filter>) {
		let key = filter.name();
		self.breakers.reconcile(&key, BreakerRuntime::default());
		self
			.filters
			.write()
			.expect("filters lock poisoned")
			.insert(key, filter);
	}

	fn get(&self, name: &Strng) -> Option<Arc<dyn Filter>> {
		self
			.filters
			.read()
			.expect("filters lock poisoned")
			.get(name)
			.cloned()
	}

	/// Runs the request phase of each configured filter in order.
	pub async fn apply_request(
		&self,
		names: &[Strng],
		head: &mut ::http::request::Parts,
	) -> Result<RequestVerdict, ProxyError> {
		for name in names {
			let Some(filter) = self.get(name) else {
				warn!(filter = %name, "configured filter is not registered, bypassing");
				continue;
			};
			let breaker = match self.breakers.get(name) {
				Some(b) => b,
				None => self.breakers.reconcile(name, BreakerRuntime::default()),
			};
			let now = Instant::now();
			if !breaker.allow(now) {
				if filter.fail_closed() {
					return Err(ProxyError::FilterFailClosed(name.clone()));
				}
				warn!(filter = %name, reason = "breaker_open", "bypassing filter");
				continue;
			}
			let res = tokio::time::timeout(filter.call_timeout(), filter.on_request(head)).await;
			match res {
				Ok(Ok(FilterAction::Continue)) => {
					breaker.record(true, Instant::now());
				},
				Ok(Ok(FilterAction::ShortCircuit {
					status,
					headers,
					body,
				})) => {
					breaker.record(true, Instant::now());
					let mut builder = ::http::Response::builder().status(status);
					if let Some(h) = builder.headers_mut() {
						*h = headers;
					}
					let resp = builder
						.body(crate::http::Body::from(body))
						.map_err(|e| ProxyError::Processing(e.into()))?;
					return Ok(RequestVerdict::ShortCircuit(Box::new(resp)));
				},
				Ok(Ok(FilterAction::FailClosed)) => {
					breaker.record(true, Instant::now());
					return Err(ProxyError::FilterFailClosed(name.clone()));
				},
				Ok(Err(e)) => {
					breaker.record(false, Instant::now());
					if filter.fail_closed() {
						return Err(ProxyError::FilterFailClosed(name.clone()));
					}
					warn!(filter = %name, err = %e, reason = "error", "bypassing filter");
				},
				Err(_) => {
					breaker.record(false, Instant::now());
					if filter.fail_closed() {
						return Err(ProxyError::FilterFailClosed(name.clone()));
					}
					warn!(filter = %name, reason = "timeout", "bypassing filter");
				},
			}
		}
		Ok(RequestVerdict::Continue)
	}

	/// Runs the response phase; edits outside the allowed set are dropped.
	pub async fn apply_response(&self, names: &[Strng], resp: &mut Response) {
		for name in names {
			let Some(filter) = self.get(name) else { continue };
			let (head, body) = std::mem::take(resp).into_parts();
			let res = tokio::time::timeout(filter.call_timeout(), filter.on_response(&head)).await;
			let mut restored = Response::from_parts(head, body);
			if let Ok(Ok(mutation)) = res {
				if let Some(status) = mutation.status {
					*restored.status_mut() = status;
				}
				for (k, v) in mutation.set_headers {
					if response_header_allowed(&k) {
						restored.headers_mut().insert(k, v);
					} else {
						warn!(filter = %name, header = %k, "dropping disallowed response header edit");
					}
				}
			}
			*resp = restored;
		}
	}
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::strng;

	struct Always(FilterActionKind, bool);

	#[derive(Clone, Copy)]
	enum FilterActionKind {
		Continue,
		Short,
		Error,
	}

	#[async_trait]
	impl Filter for Always {
		fn name(&self) -> Strng {
			strng::new("test-filter")
		}
		fn fail_closed(&self) -> bool {
			self.1
		}
		async fn on_request(&self, _head: &mut ::http::request::Parts) -> anyhow::Result<FilterAction> {
			match self.0 {
				FilterActionKind::Continue => Ok(FilterAction::Continue),
				FilterActionKind::Short => Ok(FilterAction::ShortCircuit {
					status: StatusCode::FORBIDDEN,
					headers: HeaderMap::new(),
					body: Bytes::from_static(b"denied"),
				}),
				FilterActionKind::Error => anyhow::bail!("boom"),
			}
		}
	}

	fn parts() -> ::http::request::Parts {
		::http::Request::builder()
			.uri("http://example.com/")
			.body(())
			.unwrap()
			.into_parts()
			.0
	}

	#[tokio::test]
	async fn short_circuit_returns_filter_response() {
		let reg = Registry::new();
		reg.register(Arc::new(Always(FilterActionKind::Short, false)));
		let mut head = parts();
		match reg
			.apply_request(&[strng::new("test-filter")], &mut head)
			.await
			.unwrap()
		{
			RequestVerdict::ShortCircuit(resp) => assert_eq!(resp.status(), StatusCode::FORBIDDEN),
			_ => panic!("expected short circuit"),
		}
	}

	#[tokio::test]
	async fn erroring_filter_is_bypassed_fail_open() {
		let reg = Registry::new();
		reg.register(Arc::new(Always(FilterActionKind::Error, false)));
		let mut head = parts();
		assert!(matches!(
			reg
				.apply_request(&[strng::new("test-filter")], &mut head)
				.await
				.unwrap(),
			RequestVerdict::Continue
		));
	}

	#[tokio::test]
	async fn erroring_filter_fail_closed_rejects() {
		let reg = Registry::new();
		reg.register(Arc::new(Always(FilterActionKind::Error, true)));
		let mut head = parts();
		assert!(matches!(
			reg
				.apply_request(&[strng::new("test-filter")], &mut head)
				.await,
			Err(ProxyError::FilterFailClosed(_))
		));
	}

	#[tokio::test]
	async fn unregistered_filter_is_skipped() {
		let reg = Registry::new();
		let mut head = parts();
		assert!(matches!(
			reg
				.apply_request(&[strng::new("missing")], &mut head)
				.await
				.unwrap(),
			RequestVerdict::Continue
		));
	}

	struct HeaderEditor;

	#[async_trait]
	impl Filter for HeaderEditor {
		fn name(&self) -> Strng {
			strng::new("editor")
		}
		async fn on_request(&self, _head: &mut ::http::request::Parts) -> anyhow::Result<FilterAction> {
			Ok(FilterAction::Continue)
		}
		async fn on_response(
			&self,
			_head: &::http::response::Parts,
		) -> anyhow::Result<ResponseMutation> {
			Ok(ResponseMutation {
				set_headers: vec![
					(
						HeaderName::from_static("x-filtered"),
						HeaderValue::from_static("yes"),
					),
					(
						HeaderName::from_static("content-length"),
						HeaderValue::from_static("0"),
					),
				],
				status: Some(StatusCode::ACCEPTED),
			})
		}
	}

	#[tokio::test]
	async fn response_edits_respect_allowlist() {
		let reg = Registry::new();
		reg.register(Arc::new(HeaderEditor));
		let mut resp = ::http::Response::builder()
			.status(StatusCode::OK)
			.header("content-length", "11")
			.body(crate::http::Body::empty())
			.unwrap();
		reg.apply_response(&[strng::new("editor")], &mut resp).await;
		assert_eq!(resp.status(), StatusCode::ACCEPTED);
		assert_eq!(resp.headers().get("x-filtered").unwrap(), "yes");
		// Disallowed edit dropped; original value kept.
		assert_eq!(resp.headers().get("content-length").unwrap(), "11");
	}

	#[tokio::test]
	async fn breaker_opens_after_repeated_failures() {
		let calls = Arc::new(AtomicUsize::new(0));

		struct Counting(Arc<AtomicUsize>);

		#[async_trait]
		impl Filter for Counting {
			fn name(&self) -> Strng {
				strng::new("counting")
			}
			async fn on_request(
				&self,
				_head: &mut ::http::request::Parts,
			) -> anyhow::Result<FilterAction> {
				self.0.fetch_add(1, Ordering::SeqCst);
				anyhow::bail!("always fails")
			}
		}

		let reg = Registry::new();
		reg.register(Arc::new(Counting(calls.clone())));
		let names = [strng::new("counting")];
		// Default breaker: min 10 requests at 50% failure rate.
		for _ in 0..20 {
			let mut head = parts();
			let _ = reg.apply_request(&names, &mut head).await;
		}
		assert!(calls.load(Ordering::SeqCst) <= 10);
	}
}
