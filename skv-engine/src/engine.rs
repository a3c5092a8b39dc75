//! # Storage Engine Interface
//!
//! ## Design Principles
//!
//! 1. **Strategy Pattern**: Abstract the engine behind a trait so a shard can
//!    own any implementation without touching command evaluation.
//! 2. **Binary-Safe API**: Keys/values are byte buffers to match Redis semantics.
//! 3. **Zero-Cost Dispatch**: Shards are generic over the engine, so calls
//!    monomorphize to avoid dynamic dispatch overhead.
//! 4. **Explicit TTL**: Expose expiration via dedicated methods to keep the
//!    hot read path minimal.

use std::time::Duration;

use bytes::Bytes;
use skv_common::SkvResult;

/// TTL query result for Redis-style semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key does not exist or is already expired.
    Missing,
    /// Key exists but has no expiration set.
    NoExpiry,
    /// Key expires after the given duration.
    ExpiresIn(Duration),
}

/// Strategy pattern: defines the engine behavior surface for a shard.
pub trait KVEngine: Send + Sync {
    /// Returns the value for a key, or `None` if missing or expired.
    fn get(&self, key: &[u8]) -> SkvResult<Option<Bytes>>;

    /// Inserts or replaces a key, clearing any previous TTL unless `ttl` is given.
    fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) -> SkvResult<()>;

    /// Removes a key. Returns true if the key existed and was removed.
    fn delete(&self, key: &[u8]) -> SkvResult<bool>;

    /// Returns true if the key exists and is not expired.
    fn exists(&self, key: &[u8]) -> SkvResult<bool>;

    /// Sets an expiration on a key. Returns false if the key is missing.
    fn expire(&self, key: &[u8], ttl: Duration) -> SkvResult<bool>;

    /// Returns the TTL state for a key.
    fn ttl(&self, key: &[u8]) -> SkvResult<TtlStatus>;

    /// Drops every expired entry and returns the removed keys.
    fn purge_expired(&self) -> Vec<Bytes>;

    /// Number of live entries, expired-but-unpurged ones included.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
