//! Response body deadline enforcement.
//!
//! The total request timeout covers the response body stream, not just the
//! header exchange, so the remaining deadline is pushed into the body.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use http_body::{Body, SizeHint};
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

pub enum BodyTimeout {
	Deadline(Instant),
	None,
}

impl BodyTimeout {
	pub fn apply(self, r: crate::http::Response) -> crate::http::Response {
		match self {
			BodyTimeout::None => r,
			BodyTimeout::Deadline(_) => r.map(|b| crate::http::Body::new(TimeoutBody::new(self, b))),
		}
	}
}

pin_project! {
	pub struct TimeoutBody<B> {
		timeout: BodyTimeout,
		#[pin]
		sleep: Option<Sleep>,
		#[pin]
		body: B,
	}
}

impl<B> TimeoutBody<B> {
	pub fn new(timeout: BodyTimeout, body: B) -> Self {
		TimeoutBody {
			timeout,
			sleep: None,
			body,
		}
	}
}

impl<B> Body for TimeoutBody<B>
where
	B: Body,
	B::Error: Into<crate::http::Error>,
{
	type Data = B::Data;
	type Error = crate::http::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let mut this = self.project();

		if let BodyTimeout::Deadline(d) = this.timeout {
			// Start the sleep lazily on first poll.
			let sleep_pinned = if let Some(some) = this.sleep.as_mut().as_pin_mut() {
				some
			} else {
				this.sleep.set(Some(sleep_until(*d)));
				this.sleep.as_mut().as_pin_mut().expect("just set")
			};

			if let Poll::Ready(()) = sleep_pinned.poll(cx) {
				return Poll::Ready(Some(Err(Box::new(TimeoutError(())))));
			}
		}

		let frame = ready!(this.body.poll_frame(cx));
		Poll::Ready(frame.transpose().map_err(Into::into).transpose())
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}

#[derive(Debug)]
pub struct TimeoutError(());

impl std::error::Error for TimeoutError {}

impl std::fmt::Display for TimeoutError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "data was not received within the designated timeout")
	}
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn body_errors_after_deadline() {
		// A body that never produces a frame.
		let pending = http_body_util::StreamBody::new(futures_util::stream::pending::<
			Result<http_body::Frame<bytes::Bytes>, crate::http::Error>,
		>());
		let deadline = Instant::now() + std::time::Duration::from_millis(50);
		let mut body = Box::pin(TimeoutBody::new(BodyTimeout::Deadline(deadline), pending));
		let frame = body.frame().await;
		assert!(frame.unwrap().is_err());
	}
}
