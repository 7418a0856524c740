//! Proxy engine
//!
//! This module provides the proxy functionality including:
//! - Request dispatch and header sanitization
//! - Plain-request forwarding over a shared pooled transport
//! - CONNECT passthrough tunnels with full-duplex byte relay
//! - TLS-intercepting (MITM) tunnels with forged per-host identities

pub mod body;
pub mod forward;
pub mod handler;
pub mod headers;
pub mod server;
pub mod tunnel;

pub use forward::Forwarder;
pub use handler::{ProxyHandler, ProxyHandlerConfig};
pub use server::ProxyServer;
