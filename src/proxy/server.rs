//! Proxy server implementation using hyper
//!
//! Accepts client connections and serves each one as HTTP/1.1 with upgrade
//! support, handing every parsed request to the dispatcher.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use crate::ca::CertificateAuthority;
use crate::config::ProxyServerConfig;
use crate::error::{Result, SpyglassError};
use crate::models::RequestRecord;
use crate::proxy::forward::Forwarder;
use crate::proxy::handler::{ProxyHandler, ProxyHandlerConfig};

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(
        config: ProxyServerConfig,
        ca: Option<Arc<CertificateAuthority>>,
        record_sender: Option<broadcast::Sender<RequestRecord>>,
    ) -> Result<Self> {
        let handler_config = ProxyHandlerConfig {
            connect_timeout: Duration::from_secs(config.connect_timeout),
            request_timeout: Duration::from_secs(config.request_timeout),
            handshake_timeout: Duration::from_secs(config.handshake_timeout),
        };

        let forwarder = Arc::new(Forwarder::new()?);
        let handler = Arc::new(ProxyHandler::new(
            config.mode,
            forwarder,
            ca,
            handler_config,
            record_sender,
        )?);

        Ok(Self { config, handler })
    }

    /// Create a proxy server around a pre-built handler
    pub fn with_handler(config: ProxyServerConfig, handler: Arc<ProxyHandler>) -> Self {
        Self { config, handler }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|_| {
                SpyglassError::InvalidConfig(format!(
                    "invalid proxy bind address {}:{}",
                    self.config.host, self.config.port
                ))
            })?;

        let listener = TcpListener::bind(addr).await?;
        info!(
            "Proxy server listening on {} in {} mode",
            addr, self.config.mode
        );

        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already-bound listener until shutdown
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(stream, client_addr, handler).await
                                {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single client connection
    async fn handle_connection(
        stream: tokio::net::TcpStream,
        client_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
    ) -> Result<()> {
        debug!(client = %client_addr, "connection accepted");
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(req).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| SpyglassError::Http(e.to_string()))?;

        Ok(())
    }
}
