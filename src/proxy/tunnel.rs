//! CONNECT tunnel engine
//!
//! Two modes per tunnel. Passthrough relays raw bytes between client and
//! target with no protocol interpretation. Interception terminates the
//! client's TLS session with a forged certificate and serves the decrypted
//! channel as an ordinary keep-alive HTTP connection, pushing every inner
//! request back through the forwarding engine toward the real origin.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::ca::CertificateAuthority;
use crate::error::{Result, SpyglassError};
use crate::models::{publish, Outcome, RequestRecord};
use crate::proxy::body::{self, content_length_hint};
use crate::proxy::forward::Forwarder;
use crate::proxy::headers;
use crate::session::SessionCounter;

/// Parse host and port from a CONNECT authority (port defaults to 443)
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    if let Some((host, port_str)) = authority.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|_| SpyglassError::InvalidRequest(format!("invalid port: {}", port_str)))?;
        Ok((host.to_string(), port))
    } else {
        Ok((authority.to_string(), 443))
    }
}

/// Relay bytes between the hijacked client connection and the target until
/// both directions reach end-of-stream.
///
/// Each direction runs as an independent copy; whichever finishes first,
/// by EOF or error, shuts down its destination so the opposite copy
/// unblocks and the pair tears down together. Returns the byte counts
/// (client-to-target, target-to-client).
pub async fn splice<C, S>(client: C, server: S, session: u64) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let client_to_server = async {
        let result = tokio::io::copy(&mut client_read, &mut server_write).await;
        let _ = server_write.shutdown().await;
        result
    };

    let server_to_client = async {
        let result = tokio::io::copy(&mut server_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(client_to_server, server_to_client);

    let sent = sent.unwrap_or_else(|e| {
        debug!(session, error = %e, "client to target copy ended");
        0
    });
    let received = received.unwrap_or_else(|e| {
        debug!(session, error = %e, "target to client copy ended");
        0
    });

    debug!(
        session,
        bytes_sent = sent,
        bytes_received = received,
        "relay finished"
    );
    (sent, received)
}

/// One intercepting tunnel: forge an identity for the target host, complete
/// the client-facing TLS handshake, then loop over the decrypted requests.
pub struct MitmTunnel {
    pub ca: Arc<CertificateAuthority>,
    pub forwarder: Arc<Forwarder>,
    pub sessions: Arc<SessionCounter>,
    pub records: Option<broadcast::Sender<RequestRecord>>,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl MitmTunnel {
    /// Drive the tunnel over the hijacked client connection until the client
    /// closes, sends unparseable bytes, or an I/O error ends the session.
    pub async fn run<I>(self, client_io: I, host: String, port: u16, session: u64)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server_config = match self.ca.server_config(&host) {
            Ok(config) => config,
            Err(e) => {
                error!(session, host = %host, error = %e, "certificate forgery failed, dropping tunnel");
                self.record_failure(&host, session, e.to_string());
                return;
            }
        };

        let acceptor = TlsAcceptor::from(server_config);
        let tls_stream = match timeout(self.handshake_timeout, acceptor.accept(client_io)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let err = SpyglassError::TlsHandshake(e.to_string());
                warn!(session, host = %host, error = %err, "client rejected forged identity");
                self.record_failure(&host, session, err.to_string());
                return;
            }
            Err(_) => {
                warn!(session, host = %host, "client TLS handshake timed out");
                self.record_failure(&host, session, SpyglassError::Timeout.to_string());
                return;
            }
        };

        debug!(session, host = %host, "client TLS handshake complete");

        // The inner request line is origin-form; the true authority comes
        // from the CONNECT target, not from whatever Host header the client
        // chose to send.
        let authority = if port == 443 {
            host.clone()
        } else {
            format!("{}:{}", host, port)
        };

        let forwarder = self.forwarder.clone();
        let sessions = self.sessions.clone();
        let records = self.records.clone();
        let request_timeout = self.request_timeout;

        let service = service_fn(move |req: Request<Incoming>| {
            let forwarder = forwarder.clone();
            let sessions = sessions.clone();
            let records = records.clone();
            let authority = authority.clone();

            async move {
                let session = sessions.next();
                handle_decrypted_request(
                    req,
                    authority,
                    forwarder,
                    records,
                    session,
                    request_timeout,
                )
                .await
            }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(TokioIo::new(tls_stream), service)
            .await
        {
            debug!(session, host = %host, error = %e, "tunnel connection ended");
        }

        publish(
            self.records.as_ref(),
            RequestRecord {
                session,
                method: "CONNECT".to_string(),
                host: host.clone(),
                path: String::new(),
                outcome: Outcome::TunnelClosed,
                bytes: 0,
                error: None,
                timestamp: Utc::now(),
            },
        );
        debug!(session, host = %host, "intercepting tunnel closed");
    }

    fn record_failure(&self, host: &str, session: u64, error: String) {
        publish(
            self.records.as_ref(),
            RequestRecord {
                session,
                method: "CONNECT".to_string(),
                host: host.to_string(),
                path: String::new(),
                outcome: Outcome::TunnelFailed,
                bytes: 0,
                error: Some(error),
                timestamp: Utc::now(),
            },
        );
    }
}

/// One decrypted request: absolutize the URI against the tunnel target,
/// sanitize, and re-enter the forwarding engine.
async fn handle_decrypted_request(
    mut req: Request<Incoming>,
    authority: String,
    forwarder: Arc<Forwarder>,
    records: Option<broadcast::Sender<RequestRecord>>,
    session: u64,
    request_timeout: Duration,
) -> std::result::Result<hyper::Response<body::ProxyBody>, Infallible> {
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let uri: Uri = match format!("https://{}{}", authority, path).parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(session, error = %e, "unroutable request inside tunnel");
            return Ok(body::error_response(
                StatusCode::BAD_REQUEST,
                "malformed request target",
            ));
        }
    };

    info!(
        session,
        method = %method,
        host = %authority,
        path = %path,
        url = %uri,
        "decrypted request"
    );

    *req.uri_mut() = uri;
    headers::sanitize_request(&mut req);

    match forwarder.round_trip(req, session, request_timeout).await {
        Ok(response) => {
            publish(
                records.as_ref(),
                RequestRecord {
                    session,
                    method,
                    host: authority,
                    path,
                    outcome: Outcome::Forwarded,
                    bytes: content_length_hint(&response),
                    error: None,
                    timestamp: Utc::now(),
                },
            );
            Ok(response)
        }
        Err(e) => {
            error!(session, error = %e, "forwarding decrypted request failed");
            publish(
                records.as_ref(),
                RequestRecord {
                    session,
                    method,
                    host: authority,
                    path,
                    outcome: Outcome::UpstreamFailed,
                    bytes: 0,
                    error: Some(e.to_string()),
                    timestamp: Utc::now(),
                },
            );
            Ok(body::error_response(
                e.status_code(),
                &format!("upstream request failed: {}", e),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use bytes::Bytes;
    use http_body_util::Full;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("[::1]:443").unwrap(),
            ("[::1]".to_string(), 443)
        );
        assert!(parse_authority("example.com:notaport").is_err());
    }

    #[tokio::test]
    async fn test_splice_round_trip() {
        let (client, mut client_far) = tokio::io::duplex(1024);
        let (mut target_far, target) = tokio::io::duplex(1024);

        let splice_handle = tokio::spawn(async move { splice(client, target, 1).await });

        client_far.write_all(b"hello from client").await.unwrap();
        client_far.shutdown().await.unwrap();

        target_far.write_all(b"hello from target").await.unwrap();
        target_far.shutdown().await.unwrap();

        let mut buf = vec![0u8; 100];
        let n = target_far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from client");

        let mut buf = vec![0u8; 100];
        let n = client_far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from target");

        let (sent, received) = tokio::time::timeout(TEST_TIMEOUT, splice_handle)
            .await
            .expect("splice timed out")
            .unwrap();
        assert_eq!(sent, 17);
        assert_eq!(received, 17);
    }

    #[tokio::test]
    async fn test_splice_closing_one_side_closes_the_other() {
        let (client, mut client_far) = tokio::io::duplex(1024);
        let (mut target_far, target) = tokio::io::duplex(1024);

        let splice_handle = tokio::spawn(async move { splice(client, target, 2).await });

        // Client hangs up without sending anything.
        client_far.shutdown().await.unwrap();

        // The target must observe EOF promptly.
        let mut buf = vec![0u8; 16];
        let n = tokio::time::timeout(TEST_TIMEOUT, target_far.read(&mut buf))
            .await
            .expect("target never saw EOF")
            .unwrap();
        assert_eq!(n, 0);

        // Once the target hangs up too, the relay terminates.
        target_far.shutdown().await.unwrap();
        let (sent, received) = tokio::time::timeout(TEST_TIMEOUT, splice_handle)
            .await
            .expect("splice leaked after both sides closed")
            .unwrap();
        assert_eq!((sent, received), (0, 0));
    }

    fn tls_client_config(ca: &CertificateAuthority) -> ClientConfig {
        let mut roots = RootCertStore::empty();
        roots.add(ca.ca_certificate()).unwrap();
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }

    fn test_tunnel(ca: Arc<CertificateAuthority>, forwarder: Arc<Forwarder>) -> MitmTunnel {
        MitmTunnel {
            ca,
            forwarder,
            sessions: Arc::new(SessionCounter::new()),
            records: None,
            handshake_timeout: TEST_TIMEOUT,
            request_timeout: TEST_TIMEOUT,
        }
    }

    #[tokio::test]
    async fn test_mitm_handshake_with_forged_certificate() {
        let dir = TempDir::new().unwrap();
        let ca = Arc::new(
            CertificateAuthority::load_or_generate(dir.path())
                .await
                .unwrap(),
        );

        let forwarder = Arc::new(Forwarder::with_tls_config(
            ClientConfig::builder()
                .with_root_certificates(RootCertStore::empty())
                .with_no_client_auth(),
        ));

        let (client_io, proxy_io) = tokio::io::duplex(64 * 1024);
        let tunnel = test_tunnel(ca.clone(), forwarder);
        let tunnel_handle =
            tokio::spawn(async move { tunnel.run(proxy_io, "example.test".to_string(), 443, 1).await });

        // A client trusting the proxy CA completes the handshake for a host
        // the proxy has never seen before.
        let connector = TlsConnector::from(Arc::new(tls_client_config(&ca)));
        let server_name = ServerName::try_from("example.test").unwrap();
        let tls = tokio::time::timeout(TEST_TIMEOUT, connector.connect(server_name, client_io))
            .await
            .expect("handshake timed out")
            .expect("client rejected forged certificate");

        // Hanging up ends the tunnel.
        drop(tls);
        tokio::time::timeout(TEST_TIMEOUT, tunnel_handle)
            .await
            .expect("tunnel leaked after client hangup")
            .unwrap();
    }

    #[tokio::test]
    async fn test_mitm_round_trip_to_tls_origin() {
        let dir = TempDir::new().unwrap();
        let ca = Arc::new(
            CertificateAuthority::load_or_generate(dir.path())
                .await
                .unwrap(),
        );

        // Stand-in origin: a TLS server whose certificate chains to the same
        // CA the forwarder is configured to trust.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = listener.local_addr().unwrap().port();
        let origin_config = ca.server_config("localhost").unwrap();
        tokio::spawn(async move {
            let acceptor = TlsAcceptor::from(origin_config);
            let (stream, _) = listener.accept().await.unwrap();
            let tls = acceptor.accept(stream).await.unwrap();
            let service = service_fn(|_req: Request<Incoming>| async {
                Ok::<_, Infallible>(
                    hyper::Response::builder()
                        .header("x-origin", "direct")
                        .body(Full::new(Bytes::from("hello from origin")))
                        .unwrap(),
                )
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service)
                .await;
        });

        let forwarder = Arc::new(Forwarder::with_tls_config(tls_client_config(&ca)));

        let (client_io, proxy_io) = tokio::io::duplex(64 * 1024);
        let tunnel = test_tunnel(ca.clone(), forwarder);
        tokio::spawn(async move {
            tunnel
                .run(proxy_io, "localhost".to_string(), origin_port, 1)
                .await
        });

        let connector = TlsConnector::from(Arc::new(tls_client_config(&ca)));
        let server_name = ServerName::try_from("localhost").unwrap();
        let mut tls = tokio::time::timeout(TEST_TIMEOUT, connector.connect(server_name, client_io))
            .await
            .expect("handshake timed out")
            .expect("client rejected forged certificate");

        tls.write_all(b"GET /greet HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(TEST_TIMEOUT, tls.read_to_end(&mut response))
            .await
            .expect("response timed out")
            .unwrap();

        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
        assert!(response.to_lowercase().contains("x-origin: direct"));
        assert!(response.ends_with("hello from origin"));
    }
}
