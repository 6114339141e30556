pub mod timeout;

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};

pub mod x_headers {
	use http::HeaderName;

	pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
	pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
}

/// A type-erased body. Everything on the data path converges to this so
/// requests and responses can be passed through the pipeline uniformly.
pub struct Body(UnsyncBoxBody<Bytes, Error>);

impl Body {
	pub fn new<B>(body: B) -> Self
	where
		B: http_body::Body<Data = Bytes> + Send + 'static,
		B::Error: Into<Error>,
	{
		Body(body.map_err(Into::into).boxed_unsync())
	}

	pub fn empty() -> Self {
		Body(
			http_body_util::Empty::new()
				.map_err(|n| match n {})
				.boxed_unsync(),
		)
	}

	/// Collects up to `limit` bytes; errors if the body is larger.
	pub async fn collect_up_to(self, limit: usize) -> Result<Bytes, Error> {
		let mut buf = Vec::new();
		let mut body = self.0;
		while let Some(frame) = body.frame().await {
			let frame = frame?;
			if let Some(data) = frame.data_ref() {
				if buf.len() + data.len() > limit {
					return Err("body exceeds limit".into());
				}
				buf.extend_from_slice(data);
			}
		}
		Ok(Bytes::from(buf))
	}
}

impl Default for Body {
	fn default() -> Self {
		Body::empty()
	}
}

impl std::fmt::Debug for Body {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Body").finish_non_exhaustive()
	}
}

impl From<Bytes> for Body {
	fn from(value: Bytes) -> Self {
		Body(
			http_body_util::Full::new(value)
				.map_err(|n| match n {})
				.boxed_unsync(),
		)
	}
}

impl From<String> for Body {
	fn from(value: String) -> Self {
		Bytes::from(value).into()
	}
}

impl From<&'static str> for Body {
	fn from(value: &'static str) -> Self {
		Bytes::from_static(value.as_bytes()).into()
	}
}

impl From<Vec<u8>> for Body {
	fn from(value: Vec<u8>) -> Self {
		Bytes::from(value).into()
	}
}

impl http_body::Body for Body {
	type Data = Bytes;
	type Error = Error;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		Pin::new(&mut self.0).poll_frame(cx)
	}

	fn is_end_stream(&self) -> bool {
		self.0.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.0.size_hint()
	}
}

/// Extracts the request host, from the URI authority when present (HTTP/2,
/// absolute form) or the Host header (HTTP/1.1 origin form). Port stripped.
pub fn get_host<B>(req: &::http::Request<B>) -> Option<&str> {
	if let Some(host) = req.uri().host() {
		return Some(strip_port(host));
	}
	req
		.headers()
		.get(header::HOST)
		.and_then(|h| h.to_str().ok())
		.map(strip_port)
}

pub fn strip_port(auth: &str) -> &str {
	let host_port = auth
		.rsplit('@')
		.next()
		.expect("split always has at least 1 item");
	if host_port.as_bytes().first() == Some(&b'[') {
		match host_port.find(']') {
			Some(i) => &host_port[0..=i],
			None => host_port,
		}
	} else {
		host_port
			.split(':')
			.next()
			.expect("split always has at least 1 item")
	}
}

/// Hop-by-hop headers, removed before forwarding per RFC 7230.
pub static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	// non-standard but still sent by some clients
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
}
