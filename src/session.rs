//! Session identifier allocation
//!
//! Every inbound request, including each decrypted request inside a MITM
//! tunnel, receives a unique identifier for correlation in logs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing session counter, shared by all request handlers.
///
/// Owned by the proxy handler rather than living in a global; safe for
/// unbounded concurrent use without external locking.
#[derive(Debug, Default)]
pub struct SessionCounter(AtomicU64);

impl SessionCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Allocate the next session identifier. Identifiers start at 1 and are
    /// strictly increasing and unique across all concurrent callers.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_session_ids_start_at_one_and_increase() {
        let counter = SessionCounter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.next(), 3);
    }

    #[tokio::test]
    async fn test_session_ids_unique_under_concurrency() {
        let counter = Arc::new(SessionCounter::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                (0..1000).map(|_| counter.next()).collect::<Vec<u64>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "duplicate session id {}", id);
            }
        }

        assert_eq!(seen.len(), 8000);
        assert_eq!(counter.next(), 8001);
    }
}
