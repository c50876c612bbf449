//! Entity id generation.
//!
//! Id generation is an injectable strategy so hosts can plug in their
//! own scheme (database object ids, deterministic test counters). The
//! default produces random UUIDs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Strategy for generating entity ids.
pub trait IdProvider: Send + Sync {
    /// Produce the next unique id.
    fn next_id(&self) -> String;
}

/// UUID v4 id provider (default).
#[derive(Debug, Default)]
pub struct UuidProvider;

impl IdProvider for UuidProvider {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Monotonic counter id provider with a fixed prefix.
///
/// Deterministic, mainly for tests and reproducible fixtures.
#[derive(Debug)]
pub struct SequentialProvider {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialProvider {
    /// Create a provider producing `prefix-1`, `prefix-2`, ...
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdProvider for SequentialProvider {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

/// Shared handle to an id provider.
pub type SharedIdProvider = Arc<dyn IdProvider>;

/// Default shared provider (UUID v4).
pub fn default_provider() -> SharedIdProvider {
    Arc::new(UuidProvider)
}
