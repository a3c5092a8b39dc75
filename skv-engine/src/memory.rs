//! # In-Memory Engine
//!
//! Hash map engine. Expired entries read as absent and are removed by an
//! explicit purge hook the owning shard calls on a timer.

use std::time::{Duration, Instant};

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;
use skv_common::{SkvError, SkvResult};

use crate::engine::{KVEngine, TtlStatus};

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Single-partition memory engine.
///
/// The lock is uncontended in practice because one shard task owns the
/// engine; it exists so the engine stays `Sync` behind the strategy trait.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    map: RwLock<HashMap<Bytes, Entry, RandomState>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        MemoryEngine {
            map: RwLock::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    // Expired entries read as absent; only the purge removes them, so every
    // expiry is reported exactly once.
    fn live_entry(&self, key: &[u8], now: Instant) -> Option<Entry> {
        self.map
            .read()
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }
}

fn deadline(now: Instant, ttl: Duration) -> SkvResult<Instant> {
    now.checked_add(ttl).ok_or(SkvError::InvalidExpireTime)
}

impl KVEngine for MemoryEngine {
    fn get(&self, key: &[u8]) -> SkvResult<Option<Bytes>> {
        Ok(self.live_entry(key, Instant::now()).map(|entry| entry.value))
    }

    fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) -> SkvResult<()> {
        let expires_at = ttl.map(|ttl| deadline(Instant::now(), ttl)).transpose()?;
        self.map.write().insert(key, Entry { value, expires_at });
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> SkvResult<bool> {
        let now = Instant::now();
        let mut map = self.map.write();
        if map.get(key).is_some_and(|entry| !entry.is_expired(now)) {
            map.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn exists(&self, key: &[u8]) -> SkvResult<bool> {
        Ok(self.live_entry(key, Instant::now()).is_some())
    }

    fn expire(&self, key: &[u8], ttl: Duration) -> SkvResult<bool> {
        let now = Instant::now();
        let mut map = self.map.write();
        match map.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(deadline(now, ttl)?);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn ttl(&self, key: &[u8]) -> SkvResult<TtlStatus> {
        let now = Instant::now();
        Ok(match self.live_entry(key, now) {
            None => TtlStatus::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => TtlStatus::NoExpiry,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => TtlStatus::ExpiresIn(at.saturating_duration_since(now)),
        })
    }

    fn purge_expired(&self) -> Vec<Bytes> {
        let now = Instant::now();
        let mut purged = Vec::new();
        self.map.write().retain(|key, entry| {
            if entry.is_expired(now) {
                purged.push(key.clone());
                return false;
            }
            true
        });
        purged
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }
}
