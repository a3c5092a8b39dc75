//! # Worker Identity
//!
//! Identities look like `{category}-{elapsed_ms}-{sequence}`. The sequence is
//! a per-category atomic counter and is the only part uniqueness relies on;
//! the elapsed milliseconds since the generator was created only make logs
//! easier to order by eye.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Opaque worker identity, cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(Arc<str>);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        WorkerId(Arc::from(value))
    }
}

/// Kind of worker an identity is issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerCategory {
    Transport,
    Command,
}

impl WorkerCategory {
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Transport => "T",
            Self::Command => "C",
        }
    }
}

/// Issues worker identities; one instance per server, shared by reference.
#[derive(Debug)]
pub struct IdGenerator {
    started: Instant,
    transport_seq: AtomicU64,
    command_seq: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        IdGenerator {
            started: Instant::now(),
            transport_seq: AtomicU64::new(0),
            command_seq: AtomicU64::new(0),
        }
    }

    /// Returns a fresh identity for `category`. Never blocks, never fails.
    pub fn next(&self, category: WorkerCategory) -> WorkerId {
        let counter = match category {
            WorkerCategory::Transport => &self.transport_seq,
            WorkerCategory::Command => &self.command_seq,
        };
        let seq = counter.fetch_add(1, Ordering::Relaxed) + 1;
        let elapsed = self.started.elapsed().as_millis();
        WorkerId(Arc::from(format!("{}-{}-{}", category.prefix(), elapsed, seq)))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;

    #[test]
    fn formats_category_timestamp_and_sequence() {
        let ids = IdGenerator::new();
        let first = ids.next(WorkerCategory::Transport);
        let parts: Vec<&str> = first.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "T");
        assert!(parts[1].parse::<u128>().is_ok());
        assert_eq!(parts[2], "1");
        assert!(ids.next(WorkerCategory::Command).as_str().starts_with("C-"));
    }

    #[test]
    fn categories_count_independently() {
        let ids = IdGenerator::new();
        ids.next(WorkerCategory::Transport);
        ids.next(WorkerCategory::Transport);
        let command = ids.next(WorkerCategory::Command);
        assert!(command.as_str().ends_with("-1"));
    }

    #[test]
    fn concurrent_callers_never_collide() {
        let ids = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || {
                    (0..1000)
                        .map(|_| ids.next(WorkerCategory::Command))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate identity issued");
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
