//! Request dispatcher
//!
//! Single entry point for every inbound request. Allocates the session
//! identifier, then routes: CONNECT to the tunnel engine, absolute-URI
//! requests through the sanitizer into the forwarding engine, and
//! everything else to the fixed non-support response.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::ca::CertificateAuthority;
use crate::config::ProxyMode;
use crate::error::{Result, SpyglassError};
use crate::models::{publish, Outcome, RequestRecord};
use crate::proxy::body::{self, content_length_hint, ProxyBody};
use crate::proxy::forward::Forwarder;
use crate::proxy::headers;
use crate::proxy::tunnel::{self, MitmTunnel};
use crate::session::SessionCounter;

/// Configuration for the request handler
#[derive(Debug, Clone)]
pub struct ProxyHandlerConfig {
    /// Timeout for upstream TCP dials
    pub connect_timeout: Duration,
    /// Timeout waiting for upstream response headers
    pub request_timeout: Duration,
    /// Timeout for the client-facing TLS handshake in MITM tunnels
    pub handshake_timeout: Duration,
}

impl Default for ProxyHandlerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Proxy request dispatcher
#[derive(Debug)]
pub struct ProxyHandler {
    mode: ProxyMode,
    sessions: Arc<SessionCounter>,
    forwarder: Arc<Forwarder>,
    ca: Option<Arc<CertificateAuthority>>,
    config: ProxyHandlerConfig,
    record_sender: Option<broadcast::Sender<RequestRecord>>,
}

impl ProxyHandler {
    pub fn new(
        mode: ProxyMode,
        forwarder: Arc<Forwarder>,
        ca: Option<Arc<CertificateAuthority>>,
        config: ProxyHandlerConfig,
        record_sender: Option<broadcast::Sender<RequestRecord>>,
    ) -> Result<Self> {
        if mode == ProxyMode::Mitm && ca.is_none() {
            return Err(SpyglassError::InvalidConfig(
                "MITM mode requires a certificate authority".into(),
            ));
        }

        Ok(Self {
            mode,
            sessions: Arc::new(SessionCounter::new()),
            forwarder,
            ca,
            config,
            record_sender,
        })
    }

    /// Handle one inbound request. Never fails the transport: every error is
    /// converted into a response or, past the CONNECT acknowledgement, into
    /// tunnel teardown.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let session = self.sessions.next();

        if req.method() == Method::CONNECT {
            return self.handle_connect(req, session).await;
        }

        let uri = req.uri().clone();
        let method = req.method().to_string();
        let host = uri
            .host()
            .map(str::to_string)
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let path = uri.path().to_string();

        info!(
            session,
            method = %method,
            host = %host,
            path = %path,
            url = %uri,
            "received request"
        );

        // A request line without scheme and authority means the client is
        // talking to us as if we were the origin.
        if uri.scheme().is_none() || uri.host().is_none() {
            debug!(session, "refusing origin-form request");
            publish(
                self.record_sender.as_ref(),
                RequestRecord {
                    session,
                    method,
                    host,
                    path,
                    outcome: Outcome::Rejected,
                    bytes: 0,
                    error: None,
                    timestamp: Utc::now(),
                },
            );
            return body::non_support_response();
        }

        let mut req = req;
        headers::sanitize_request(&mut req);

        match self
            .forwarder
            .round_trip(req, session, self.config.request_timeout)
            .await
        {
            Ok(response) => {
                publish(
                    self.record_sender.as_ref(),
                    RequestRecord {
                        session,
                        method,
                        host,
                        path,
                        outcome: Outcome::Forwarded,
                        bytes: content_length_hint(&response),
                        error: None,
                        timestamp: Utc::now(),
                    },
                );
                response
            }
            Err(e) => {
                error!(session, error = %e, "forwarding failed");
                publish(
                    self.record_sender.as_ref(),
                    RequestRecord {
                        session,
                        method,
                        host,
                        path,
                        outcome: Outcome::UpstreamFailed,
                        bytes: 0,
                        error: Some(e.to_string()),
                        timestamp: Utc::now(),
                    },
                );
                body::error_response(
                    e.status_code(),
                    &format!("upstream request failed: {}", e),
                )
            }
        }
    }

    /// Handle a CONNECT request in the configured tunnel mode
    async fn handle_connect(&self, req: Request<Incoming>, session: u64) -> Response<ProxyBody> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());

        let (host, port) = match tunnel::parse_authority(&authority) {
            Ok(target) => target,
            Err(e) => {
                warn!(session, authority = %authority, error = %e, "unparseable CONNECT target");
                return body::error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid CONNECT target: {}", e),
                );
            }
        };

        info!(
            session,
            method = "CONNECT",
            host = %host,
            port,
            mode = %self.mode,
            "tunnel requested"
        );

        match self.mode {
            ProxyMode::Normal => self.connect_passthrough(req, host, port, session).await,
            ProxyMode::Mitm => self.connect_intercept(req, host, port, session).await,
        }
    }

    /// Normal mode: dial the target, acknowledge, then splice raw bytes
    async fn connect_passthrough(
        &self,
        req: Request<Incoming>,
        host: String,
        port: u16,
        session: u64,
    ) -> Response<ProxyBody> {
        let addr = format!("{}:{}", host, port);

        // The acknowledgement is only sent once the target is reachable;
        // a failed dial must produce an error response, not a dead tunnel.
        let server = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let err = SpyglassError::TunnelEstablish(format!("dial {} failed: {}", addr, e));
                warn!(session, error = %err, "tunnel dial failed");
                self.record_tunnel(&host, session, Outcome::TunnelFailed, 0, Some(err.to_string()));
                return body::error_response(err.status_code(), &err.to_string());
            }
            Err(_) => {
                let err = SpyglassError::Timeout;
                warn!(session, target = %addr, "tunnel dial timed out");
                self.record_tunnel(&host, session, Outcome::TunnelFailed, 0, Some(err.to_string()));
                return body::error_response(err.status_code(), &err.to_string());
            }
        };

        let on_upgrade = hyper::upgrade::on(req);
        let records = self.record_sender.clone();
        let record_host = host.clone();

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    let (sent, received) = tunnel::splice(client, server, session).await;
                    info!(
                        session,
                        bytes_sent = sent,
                        bytes_received = received,
                        "tunnel closed"
                    );
                    publish(
                        records.as_ref(),
                        RequestRecord {
                            session,
                            method: "CONNECT".to_string(),
                            host: record_host,
                            path: String::new(),
                            outcome: Outcome::TunnelClosed,
                            bytes: sent + received,
                            error: None,
                            timestamp: Utc::now(),
                        },
                    );
                }
                Err(e) => {
                    debug!(session, error = %e, "client never upgraded");
                }
            }
        });

        self.record_tunnel(&host, session, Outcome::TunnelEstablished, 0, None);
        connect_established()
    }

    /// MITM mode: acknowledge, then forge an identity and intercept
    async fn connect_intercept(
        &self,
        req: Request<Incoming>,
        host: String,
        port: u16,
        session: u64,
    ) -> Response<ProxyBody> {
        let Some(ca) = self.ca.clone() else {
            // Unreachable in practice: construction refuses this combination.
            error!(session, "MITM mode without certificate authority");
            return body::error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "interception unavailable",
            );
        };

        let mitm = MitmTunnel {
            ca,
            forwarder: self.forwarder.clone(),
            sessions: self.sessions.clone(),
            records: self.record_sender.clone(),
            handshake_timeout: self.config.handshake_timeout,
            request_timeout: self.config.request_timeout,
        };

        let on_upgrade = hyper::upgrade::on(req);
        let record_host = host.clone();

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    mitm.run(TokioIo::new(upgraded), host, port, session).await;
                }
                Err(e) => {
                    debug!(session, error = %e, "client never upgraded");
                }
            }
        });

        self.record_tunnel(&record_host, session, Outcome::TunnelEstablished, 0, None);
        connect_established()
    }

    fn record_tunnel(
        &self,
        host: &str,
        session: u64,
        outcome: Outcome,
        bytes: u64,
        error: Option<String>,
    ) {
        publish(
            self.record_sender.as_ref(),
            RequestRecord {
                session,
                method: "CONNECT".to_string(),
                host: host.to_string(),
                path: String::new(),
                outcome,
                bytes,
                error,
                timestamp: Utc::now(),
            },
        );
    }
}

/// The acknowledgement that flips the connection into tunnel mode
fn connect_established() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .body(body::empty())
        .unwrap()
}
