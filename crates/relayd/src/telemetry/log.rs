//! Access logging.
//!
//! One JSON object per request, emitted when the response body finishes (or
//! the connection goes away), so byte counts and duration cover the whole
//! exchange. The log record rides inside the response body wrapper; dropping
//! it anywhere emits the line exactly once.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use pin_project_lite::pin_project;
use serde_json::json;
use tracing::info;

use crate::Strng;
use crate::http::{Method, StatusCode};
use crate::proxy::ErrorCategory;

#[derive(Debug, Default)]
pub struct RequestLog {
	pub start: Option<Instant>,
	pub request_id: Option<Strng>,
	pub method: Option<Method>,
	pub host: Option<String>,
	pub path: Option<String>,
	pub route_id: Option<Strng>,
	pub pool_key: Option<Strng>,
	pub upstream_addr: Option<Strng>,
	pub status: Option<StatusCode>,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub error_category: Option<ErrorCategory>,
	pub snapshot_version: Option<Strng>,
	pub user_agent: Option<String>,
	pub remote_addr: Option<SocketAddr>,
}

impl RequestLog {
	fn emit(&self) {
		let duration_ms = self
			.start
			.map(|s| s.elapsed().as_millis() as u64)
			.unwrap_or(0);
		let line = json!({
			"ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
			"request_id": self.request_id.as_deref(),
			"method": self.method.as_ref().map(|m| m.as_str()),
			"host": self.host,
			"path": self.path,
			"route_id": self.route_id.as_deref(),
			"pool_key": self.pool_key.as_deref(),
			"upstream_addr": self.upstream_addr.as_deref(),
			"status": self.status.map(|s| s.as_u16()),
			"duration_ms": duration_ms,
			"bytes_in": self.bytes_in,
			"bytes_out": self.bytes_out,
			"error_category": self.error_category.map(|c| c.as_str()),
			"snapshot_version": self.snapshot_version.as_deref(),
			"user_agent": self.user_agent,
			"remote_addr": self.remote_addr.map(|a| a.to_string()),
		});
		info!(target: "access", "{line}");
	}
}

/// Emits the wrapped [RequestLog] exactly once, on drop.
#[derive(Debug, Default)]
pub struct DropOnLog(Option<RequestLog>);

impl DropOnLog {
	pub fn with(&mut self, f: impl FnOnce(&mut RequestLog)) {
		if let Some(log) = self.0.as_mut() {
			f(log);
		}
	}
}

impl From<RequestLog> for DropOnLog {
	fn from(log: RequestLog) -> Self {
		DropOnLog(Some(log))
	}
}

impl Drop for DropOnLog {
	fn drop(&mut self) {
		if let Some(log) = self.0.take() {
			log.emit();
		}
	}
}

pin_project! {
	/// Response body wrapper carrying the access log and the request's
	/// inflight guard. Counts response bytes as they stream; the log line
	/// fires and the guard releases when the body is done (or dropped).
	pub struct LogBody<B> {
		#[pin]
		body: B,
		log: DropOnLog,
		inflight: Option<crate::proxy::inflight::Guard>,
	}
}

impl<B> LogBody<B> {
	pub fn new(body: B, log: DropOnLog, inflight: Option<crate::proxy::inflight::Guard>) -> Self {
		LogBody {
			body,
			log,
			inflight,
		}
	}
}

impl<B> http_body::Body for LogBody<B>
where
	B: http_body::Body<Data = bytes::Bytes>,
{
	type Data = B::Data;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		match this.body.poll_frame(cx) {
			Poll::Ready(Some(Ok(frame))) => {
				if let Some(data) = frame.data_ref() {
					let len = data.len() as u64;
					this.log.with(|l| l.bytes_out += len);
				}
				Poll::Ready(Some(Ok(frame)))
			},
			other => other,
		}
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.body.size_hint()
	}
}
