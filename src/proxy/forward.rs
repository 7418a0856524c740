//! Forwarding engine
//!
//! Performs exactly one round trip to the origin over a shared,
//! connection-pooling client and streams the response back byte-for-byte.
//! Invoked from the dispatcher for plain proxy requests and from inside
//! MITM tunnels for every decrypted request; safe for unbounded concurrent
//! use. Failures are never retried here — the client owns retry policy.

use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_rustls::rustls::ClientConfig;
use tracing::debug;

use crate::error::{Result, SpyglassError};
use crate::proxy::body::{CountingBody, ProxyBody};

/// Shared outbound transport.
///
/// Constructed once at startup; the inner client pools and reuses origin
/// connections internally and is never mutated per request.
#[derive(Debug)]
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
}

impl Forwarder {
    /// Build a forwarder trusting the platform's native root certificates.
    pub fn new() -> Result<Self> {
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| SpyglassError::Http(format!("failed to load native roots: {}", e)))?
            .https_or_http()
            .enable_http1()
            .build();

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(https),
        })
    }

    /// Build a forwarder with caller-supplied trust anchors (private CAs).
    pub fn with_tls_config(tls: ClientConfig) -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build();

        Self {
            client: Client::builder(TokioExecutor::new()).build(https),
        }
    }

    /// Perform one round trip for an absolute-URI request.
    ///
    /// On success the origin's status and complete header map move onto the
    /// returned response unchanged (repeated names keep every value, in
    /// order) and the body streams through a counting adapter. The timeout
    /// bounds the wait for response headers only; body streaming is not
    /// clock-bounded.
    pub async fn round_trip(
        &self,
        req: Request<Incoming>,
        session: u64,
        request_timeout: Duration,
    ) -> Result<Response<ProxyBody>> {
        let response = tokio::time::timeout(request_timeout, self.client.request(req))
            .await
            .map_err(|_| SpyglassError::Timeout)?
            .map_err(|e| {
                if e.is_connect() {
                    SpyglassError::UpstreamConnect(e.to_string())
                } else {
                    SpyglassError::UpstreamRoundTrip(e.to_string())
                }
            })?;

        debug!(session, status = %response.status(), "upstream responded");

        let (parts, body) = response.into_parts();
        let body = CountingBody::new(body.boxed(), session).boxed();
        Ok(Response::from_parts(parts, body))
    }
}
