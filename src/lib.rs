//! Spyglass - TLS-intercepting forward HTTP proxy
//!
//! A forward HTTP proxy written in Rust that handles CONNECT tunnels in one
//! of two modes per process:
//!
//! - Passthrough: opaque full-duplex byte relay between client and target
//! - Interception (MITM): the proxy terminates the client's TLS session
//!   with a certificate forged for the requested host, applies its
//!   forwarding logic to the decrypted requests, and re-encrypts toward
//!   the real origin
//!
//! Plain absolute-URI requests are sanitized and forwarded over a shared
//! connection-pooling transport; every request carries a unique session
//! identifier for log correlation.

pub mod ca;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod session;

pub use config::Config;
pub use error::{Result, SpyglassError};
