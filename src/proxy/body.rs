//! Response body plumbing
//!
//! A single boxed body type flows through the proxy so origin responses,
//! error responses, and tunnel acknowledgements share one signature. The
//! `CountingBody` adapter records the number of body bytes actually handed
//! to the client, on every outcome, without buffering the stream.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use pin_project_lite::pin_project;
use tracing::{info, warn};

/// Body type produced by every proxy code path
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Box a fixed payload into a `ProxyBody`
pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// An empty `ProxyBody`
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Plain-text error response with the cause embedded in the body
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(full(message.to_string()))
        .unwrap()
}

/// Byte count a response advertises up front, for records emitted before
/// the body has streamed (0 when the length is unknown or chunked)
pub fn content_length_hint<B>(response: &Response<B>) -> u64 {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// Fixed response for requests a forward proxy cannot serve
/// (origin-form URIs from clients not configured for a proxy).
pub fn non_support_response() -> Response<ProxyBody> {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "spyglass is a forward proxy; the request line must carry an absolute URI",
    )
}

pin_project! {
    /// Streams an inner body through unchanged while counting data bytes.
    ///
    /// The final count is logged with the owning session id when the stream
    /// ends, errors, or is dropped early (client disconnect). Streaming
    /// failures past this point cannot be turned into a clean HTTP error;
    /// the log line is the only record of how far the copy got.
    pub struct CountingBody {
        #[pin]
        inner: ProxyBody,
        session: u64,
        delivered: u64,
        settled: bool,
    }

    impl PinnedDrop for CountingBody {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if !*this.settled {
                info!(
                    session = *this.session,
                    bytes = *this.delivered,
                    "response body dropped before completion"
                );
            }
        }
    }
}

impl CountingBody {
    pub fn new(inner: ProxyBody, session: u64) -> Self {
        Self {
            inner,
            session,
            delivered: 0,
            settled: false,
        }
    }
}

impl Body for CountingBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    *this.delivered += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                *this.settled = true;
                warn!(
                    session = *this.session,
                    bytes = *this.delivered,
                    error = %err,
                    "response body copy failed"
                );
                Poll::Ready(Some(Err(err)))
            }
            None => {
                if !*this.settled {
                    *this.settled = true;
                    info!(
                        session = *this.session,
                        bytes = *this.delivered,
                        "delivered response body"
                    );
                }
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counting_body_passes_data_through() {
        let body = CountingBody::new(full("hello world"), 1);
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn test_error_response_embeds_message() {
        let response = error_response(StatusCode::BAD_GATEWAY, "dial tcp: connection refused");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("dial tcp: connection refused"));
    }

    #[tokio::test]
    async fn test_non_support_response_is_fixed_500() {
        let response = non_support_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(!body.is_empty());
    }

    #[test]
    fn test_content_length_hint() {
        let response = Response::builder()
            .header(CONTENT_LENGTH, "42")
            .body(())
            .unwrap();
        assert_eq!(content_length_hint(&response), 42);

        let chunked = Response::builder().body(()).unwrap();
        assert_eq!(content_length_hint(&chunked), 0);
    }

    #[tokio::test]
    async fn test_empty_body_has_no_data() {
        let collected = empty().collect().await.unwrap().to_bytes();
        assert!(collected.is_empty());
    }
}
