//! # Shard Manager
//!
//! Owns the set of shard tasks, maps keys to shards and forwards operations.

use std::time::Duration;

use ahash::RandomState;
use bytes::Bytes;
use serde::Deserialize;
use skv_common::{Command, SkvError, SkvResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::engine::KVEngine;
use crate::memory::MemoryEngine;
use crate::shard::{KeyChange, Shard, ShardId, ShardOp};

// Fixed seeds so a key maps to the same shard for the whole process.
const ROUTING_SEEDS: [u64; 4] = [
    0x9e37_79b9_7f4a_7c15,
    0xbf58_476d_1ce4_e5b9,
    0x94d0_49bb_1331_11eb,
    0x2545_f491_4f6c_dd1d,
];

/// Shard layer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    /// Number of shard tasks.
    #[serde(default = "default_shard_count")]
    pub count: usize,
    /// Capacity of each shard's operation queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Interval between expired-key sweeps, in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        ShardConfig {
            count: default_shard_count(),
            queue_capacity: default_queue_capacity(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

/// Routes operations to shard tasks.
pub struct ShardManager {
    shards: Vec<mpsc::Sender<ShardOp>>,
    router: RandomState,
    tracker: TaskTracker,
}

impl ShardManager {
    /// Starts `config.count` shards backed by [`MemoryEngine`].
    pub fn start(
        config: &ShardConfig,
        events: mpsc::UnboundedSender<KeyChange>,
        cancel: CancellationToken,
    ) -> Self {
        Self::start_with(config, MemoryEngine::new, events, cancel)
    }

    /// Starts shards with engines built by `engine_factory`.
    ///
    /// Every shard task stops when `cancel` fires.
    pub fn start_with<E, F>(
        config: &ShardConfig,
        engine_factory: F,
        events: mpsc::UnboundedSender<KeyChange>,
        cancel: CancellationToken,
    ) -> Self
    where
        E: KVEngine + 'static,
        F: Fn() -> E,
    {
        let count = config.count.max(1);
        let sweep_interval = Duration::from_millis(config.sweep_interval_ms.max(1));
        let tracker = TaskTracker::new();
        let mut shards = Vec::with_capacity(count);

        for id in 0..count {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            let shard = Shard::new(id, engine_factory(), rx, events.clone(), sweep_interval);
            tracker.spawn(shard.run(cancel.clone()));
            shards.push(tx);
        }
        tracker.close();
        info!(shards = count, "shard manager started");

        ShardManager {
            shards,
            router: RandomState::with_seeds(
                ROUTING_SEEDS[0],
                ROUTING_SEEDS[1],
                ROUTING_SEEDS[2],
                ROUTING_SEEDS[3],
            ),
            tracker,
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Returns the shard that owns `key`.
    pub fn shard_for(&self, key: &[u8]) -> ShardId {
        (self.router.hash_one(key) % self.shards.len() as u64) as ShardId
    }

    /// Queues `op` on shard `shard_id`.
    ///
    /// Waits for queue capacity; fails with `ShardUnavailable` once the shard
    /// has stopped.
    pub async fn dispatch(&self, shard_id: ShardId, op: ShardOp) -> SkvResult<()> {
        let shard = self.shards.get(shard_id).ok_or(SkvError::InternalError)?;
        shard
            .send(op)
            .await
            .map_err(|_| SkvError::ShardUnavailable)
    }

    /// Splits `command` into per-shard parts.
    ///
    /// Single-key commands go whole to the owning shard. Multi-key commands
    /// are scattered into one sub-command per shard, keeping key order within
    /// each part. Keyless commands yield no parts.
    pub fn split(&self, command: &Command) -> Vec<(ShardId, Command)> {
        let keys = command.keys();
        if keys.is_empty() {
            return Vec::new();
        }
        if !command.kind().is_multi_key() {
            return vec![(self.shard_for(&keys[0]), command.clone())];
        }

        let mut groups: Vec<(ShardId, Vec<Bytes>)> = Vec::new();
        for key in keys {
            let shard = self.shard_for(key);
            match groups.iter_mut().find(|(id, _)| *id == shard) {
                Some((_, group)) => group.push(key.clone()),
                None => groups.push((shard, vec![key.clone()])),
            }
        }
        groups
            .into_iter()
            .map(|(shard, keys)| (shard, command.with_args(keys)))
            .collect()
    }

    /// Re-applies recovered commands, in order, and waits for every reply.
    ///
    /// Returns the number of commands applied.
    pub async fn replay(&self, commands: Vec<Command>) -> SkvResult<usize> {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let mut pending = 0usize;
        let total = commands.len();

        for (index, command) in commands.into_iter().enumerate() {
            for (shard, part) in self.split(&command) {
                self.dispatch(
                    shard,
                    ShardOp {
                        request_id: index as u64,
                        command: part,
                        reply_to: reply_tx.clone(),
                    },
                )
                .await?;
                pending += 1;
            }
        }
        drop(reply_tx);

        while pending > 0 {
            if reply_rx.recv().await.is_none() {
                return Err(SkvError::ShardUnavailable);
            }
            pending -= 1;
        }
        info!(commands = total, "durability log replayed");
        Ok(total)
    }

    /// Resolves once every shard task has exited.
    pub async fn wait_stopped(&self) {
        self.tracker.wait().await;
    }
}
