//! Observability records emitted per request and per tunnel lifecycle event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Final disposition of a request or tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Response relayed from the origin
    Forwarded,
    /// Origin unreachable or errored before response headers
    UpstreamFailed,
    /// Request refused by the proxy (non-absolute URI)
    Rejected,
    /// CONNECT acknowledged and relay started
    TunnelEstablished,
    /// CONNECT dial or handshake failed before any relay
    TunnelFailed,
    /// Tunnel torn down, byte counts final
    TunnelClosed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Forwarded => "forwarded",
            Outcome::UpstreamFailed => "upstream_failed",
            Outcome::Rejected => "rejected",
            Outcome::TunnelEstablished => "tunnel_established",
            Outcome::TunnelFailed => "tunnel_failed",
            Outcome::TunnelClosed => "tunnel_closed",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured record describing one handled request or tunnel event.
///
/// Offered to external collectors over a broadcast channel; dropped when
/// nobody is subscribed. For streamed responses `bytes` carries the
/// advertised Content-Length at response time; the exact delivered count is
/// logged when the body stream settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub session: u64,
    pub method: String,
    pub host: String,
    pub path: String,
    pub outcome: Outcome,
    pub bytes: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Offer a record to whoever is listening; never blocks, drops when the
/// channel is full or unsubscribed.
pub fn publish(sender: Option<&broadcast::Sender<RequestRecord>>, record: RequestRecord) {
    if let Some(sender) = sender {
        let _ = sender.send(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_as_str() {
        assert_eq!(Outcome::Forwarded.as_str(), "forwarded");
        assert_eq!(Outcome::TunnelClosed.to_string(), "tunnel_closed");
    }

    #[test]
    fn test_request_record_construction() {
        let record = RequestRecord {
            session: 7,
            method: "GET".to_string(),
            host: "example.com".to_string(),
            path: "/".to_string(),
            outcome: Outcome::UpstreamFailed,
            bytes: 0,
            error: Some("connection refused".to_string()),
            timestamp: Utc::now(),
        };

        assert_eq!(record.outcome, Outcome::UpstreamFailed);
        assert_eq!(record.session, 7);
    }
}
