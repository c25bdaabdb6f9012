//! Echo suppression for writes that originated on the other side.
//!
//! Before the opposite-direction sync writes a remotely originated file, it
//! marks the path here. Watch events for a marked path are dropped until the
//! mark expires, so the write is not observed and sent straight back.
//!
//! Expiry is tracked as a deadline per path and checked lazily on lookup;
//! expired marks are pruned whenever a new mark is recorded.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::normalize_relative_path;

/// Default suppression window in milliseconds.
pub const DEFAULT_ECHO_TTL_MS: u64 = 3000;

/// Set of recently synced paths whose entries expire after a fixed TTL.
#[derive(Debug)]
pub struct EchoSuppressor {
    ttl: Duration,
    expiries: HashMap<String, Instant>,
}

impl EchoSuppressor {
    /// Creates an empty suppressor with the given window.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            expiries: HashMap::new(),
        }
    }

    /// Marks `relative_path` as just written from the other side.
    ///
    /// Re-marking a path extends its window.
    pub fn mark(&mut self, relative_path: &str) {
        self.mark_at(relative_path, Instant::now());
    }

    /// Returns true if events for `relative_path` are currently suppressed.
    #[must_use]
    pub fn is_suppressed(&self, relative_path: &str) -> bool {
        self.is_suppressed_at(relative_path, Instant::now())
    }

    /// Number of marks that have not been pruned yet, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.expiries.len()
    }

    /// Returns true if no marks are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expiries.is_empty()
    }

    fn mark_at(&mut self, relative_path: &str, now: Instant) {
        self.expiries.retain(|_, expiry| *expiry > now);
        self.expiries
            .insert(normalize_relative_path(relative_path), now + self.ttl);
    }

    fn is_suppressed_at(&self, relative_path: &str, now: Instant) -> bool {
        self.expiries
            .get(&normalize_relative_path(relative_path))
            .is_some_and(|expiry| *expiry > now)
    }
}

impl Default for EchoSuppressor {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_ECHO_TTL_MS))
    }
}
