//! # Worker Registry
//!
//! Concurrency-safe map from worker identity to worker handle.
//!
//! ## Design Principles
//!
//! 1. **Identity Keyed**: The map key is the [`WorkerId`], never the handle's
//!    address, so lookups survive handle clones.
//! 2. **Reject, Don't Overwrite**: A duplicate registration fails and leaves
//!    the first handle in place.
//! 3. **Single Lock**: One mutex serializes register/unregister/lookup/iterate,
//!    so no caller observes a half-applied change.
//! 4. **Non-Owning**: The registry stores `Arc` handles for lookup only;
//!    workers own their sockets and channels.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ServerError;
use crate::id::WorkerId;

/// Anything stored in a [`Registry`].
pub trait Registered: Send + Sync {
    fn id(&self) -> &WorkerId;
}

pub struct Registry<H> {
    name: &'static str,
    entries: Mutex<HashMap<WorkerId, Arc<H>>>,
}

impl<H: Registered> Registry<H> {
    /// Creates an empty registry; `name` only labels log lines.
    pub fn new(name: &'static str) -> Self {
        Registry {
            name,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Inserts `handle`; fails with `DuplicateId` if its identity is present.
    pub fn register(&self, handle: Arc<H>) -> Result<(), ServerError> {
        let mut entries = self.entries.lock();
        match entries.entry(handle.id().clone()) {
            Entry::Occupied(occupied) => Err(ServerError::DuplicateId(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
                Ok(())
            }
        }
    }

    /// Removes and returns the handle for `id`; fails with `NotFound` if absent.
    pub fn unregister(&self, id: &WorkerId) -> Result<Arc<H>, ServerError> {
        self.entries
            .lock()
            .remove(id)
            .ok_or_else(|| ServerError::NotFound(id.clone()))
    }

    pub fn lookup(&self, id: &WorkerId) -> Option<Arc<H>> {
        self.entries.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Point-in-time copy of the registered handles.
    pub fn snapshot(&self) -> Vec<Arc<H>> {
        self.entries.lock().values().cloned().collect()
    }
}
