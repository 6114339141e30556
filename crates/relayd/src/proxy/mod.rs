pub mod httpproxy;
pub mod inflight;

use crate::Strng;
use crate::http::{Body, Response, StatusCode};

/// mTLS required and the client certificate was missing or invalid.
const STATUS_MTLS_REQUIRED: u16 = 495;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("route not found")]
	RouteNotFound,
	#[error("client certificate required")]
	MtlsRequired,
	#[error("overloaded")]
	Overload,
	#[error("circuit open for pool {0}")]
	CircuitOpen(Strng),
	#[error("no healthy endpoints in pool {0}")]
	NoHealthyEndpoint(Strng),
	#[error("pool {0} not found")]
	PoolNotFound(Strng),
	#[error("request body too large")]
	BodyTooLarge,
	#[error("retry budget exhausted")]
	RetryBudgetExhausted,
	#[error("filter {0} failed closed")]
	FilterFailClosed(Strng),
	#[error("upstream connect failed: {0}")]
	UpstreamConnect(crate::http::Error),
	#[error("upstream request timed out")]
	UpstreamTimeout,
	#[error("request timed out")]
	RequestTimeout,
	#[error("upstream read failed: {0}")]
	UpstreamRead(crate::http::Error),
	#[error("processing failed: {0}")]
	Processing(anyhow::Error),
}

/// Coarse classification carried through retry decisions, breaker/outlier
/// accounting, metrics, and the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
	Connect,
	Timeout,
	Read,
	Http5xx,
	CircuitOpen,
	NoHealthyEndpoint,
	Overload,
	MtlsRequired,
	RouteNotFound,
	BodyTooLarge,
	FilterFailClosed,
	RetryBudgetExhausted,
	Internal,
}

impl ErrorCategory {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorCategory::Connect => "connect",
			ErrorCategory::Timeout => "timeout",
			ErrorCategory::Read => "read",
			ErrorCategory::Http5xx => "5xx",
			ErrorCategory::CircuitOpen => "circuit_open",
			ErrorCategory::NoHealthyEndpoint => "no_healthy_endpoint",
			ErrorCategory::Overload => "overload",
			ErrorCategory::MtlsRequired => "mtls_required",
			ErrorCategory::RouteNotFound => "route_not_found",
			ErrorCategory::BodyTooLarge => "body_too_large",
			ErrorCategory::FilterFailClosed => "filter_fail_closed",
			ErrorCategory::RetryBudgetExhausted => "retry_budget_exhausted",
			ErrorCategory::Internal => "internal",
		}
	}
}

impl std::fmt::Display for ErrorCategory {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl ProxyError {
	pub fn category(&self) -> ErrorCategory {
		match self {
			ProxyError::RouteNotFound => ErrorCategory::RouteNotFound,
			ProxyError::MtlsRequired => ErrorCategory::MtlsRequired,
			ProxyError::Overload => ErrorCategory::Overload,
			ProxyError::CircuitOpen(_) => ErrorCategory::CircuitOpen,
			ProxyError::NoHealthyEndpoint(_) | ProxyError::PoolNotFound(_) => {
				ErrorCategory::NoHealthyEndpoint
			},
			ProxyError::BodyTooLarge => ErrorCategory::BodyTooLarge,
			ProxyError::RetryBudgetExhausted => ErrorCategory::RetryBudgetExhausted,
			ProxyError::FilterFailClosed(_) => ErrorCategory::FilterFailClosed,
			ProxyError::UpstreamConnect(_) => ErrorCategory::Connect,
			ProxyError::UpstreamTimeout | ProxyError::RequestTimeout => ErrorCategory::Timeout,
			ProxyError::UpstreamRead(_) => ErrorCategory::Read,
			ProxyError::Processing(_) => ErrorCategory::Internal,
		}
	}

	/// Proxy-local rejections never reach an upstream, so they neither count
	/// against the breaker/outlier nor consume retry budget.
	pub fn is_local_rejection(&self) -> bool {
		matches!(
			self,
			ProxyError::RouteNotFound
				| ProxyError::MtlsRequired
				| ProxyError::Overload
				| ProxyError::CircuitOpen(_)
				| ProxyError::NoHealthyEndpoint(_)
				| ProxyError::PoolNotFound(_)
				| ProxyError::BodyTooLarge
				| ProxyError::RetryBudgetExhausted
				| ProxyError::FilterFailClosed(_)
		)
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::RouteNotFound => StatusCode::NOT_FOUND,
			ProxyError::MtlsRequired => {
				StatusCode::from_u16(STATUS_MTLS_REQUIRED).expect("static status is valid")
			},
			ProxyError::Overload => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::NoHealthyEndpoint(_) | ProxyError::PoolNotFound(_) => {
				StatusCode::SERVICE_UNAVAILABLE
			},
			ProxyError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::RetryBudgetExhausted => StatusCode::BAD_GATEWAY,
			ProxyError::FilterFailClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamTimeout | ProxyError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::UpstreamRead(_) => StatusCode::BAD_GATEWAY,
			ProxyError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	pub fn into_response(self) -> Response {
		let status = self.status();
		let msg = self.to_string();
		::http::Response::builder()
			.status(status)
			.header(crate::http::header::CONTENT_TYPE, "text/plain")
			.body(Body::from(msg))
			.expect("static response builder cannot fail")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_mapping() {
		assert_eq!(ProxyError::RouteNotFound.status(), StatusCode::NOT_FOUND);
		assert_eq!(ProxyError::MtlsRequired.status().as_u16(), 495);
		assert_eq!(
			ProxyError::UpstreamTimeout.status(),
			StatusCode::GATEWAY_TIMEOUT
		);
		assert_eq!(
			ProxyError::CircuitOpen(crate::strng::new("p")).status(),
			StatusCode::SERVICE_UNAVAILABLE
		);
	}

	#[test]
	fn local_rejections_do_not_touch_upstream_accounting() {
		assert!(ProxyError::RouteNotFound.is_local_rejection());
		assert!(ProxyError::CircuitOpen(crate::strng::new("p")).is_local_rejection());
		assert!(!ProxyError::UpstreamTimeout.is_local_rejection());
	}
}
