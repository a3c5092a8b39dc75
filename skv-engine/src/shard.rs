//! # Shard Task
//!
//! One shard is one task that exclusively owns one engine partition and
//! applies operations serially in arrival order.
//!
//! ## Design Principles
//!
//! 1. **Shared-Nothing**: Only the shard task touches its engine.
//! 2. **Bounded Intake**: Operations arrive on a bounded queue so callers feel
//!    backpressure instead of growing memory.
//! 3. **Non-Blocking Replies**: Replies go to unbounded per-requester channels;
//!    a slow subscriber can never stall the shard.
//! 4. **Change Feed**: Every mutated key is published once per mutation, in
//!    application order.

use std::time::Duration;

use bytes::Bytes;
use skv_common::{Command, Reply};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::engine::KVEngine;
use crate::eval;

/// Index of a shard within the manager.
pub type ShardId = usize;

/// A unit of work addressed to one shard.
#[derive(Debug)]
pub struct ShardOp {
    /// Caller-chosen correlation id, echoed in the response.
    pub request_id: u64,
    pub command: Command,
    /// Where the response is delivered.
    pub reply_to: mpsc::UnboundedSender<ShardResponse>,
}

/// Reply to a [`ShardOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardResponse {
    pub request_id: u64,
    pub shard_id: ShardId,
    pub reply: Reply,
}

/// Key-change event published after a mutation is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub key: Bytes,
    pub shard_id: ShardId,
}

pub(crate) struct Shard<E> {
    id: ShardId,
    engine: E,
    ops: mpsc::Receiver<ShardOp>,
    events: mpsc::UnboundedSender<KeyChange>,
    sweep_interval: Duration,
}

impl<E: KVEngine> Shard<E> {
    pub(crate) fn new(
        id: ShardId,
        engine: E,
        ops: mpsc::Receiver<ShardOp>,
        events: mpsc::UnboundedSender<KeyChange>,
        sweep_interval: Duration,
    ) -> Self {
        Shard {
            id,
            engine,
            ops,
            events,
            sweep_interval,
        }
    }

    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                op = self.ops.recv() => match op {
                    Some(op) => self.apply(op),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
            }
        }
        debug!(shard = self.id, keys = self.engine.len(), "shard stopped");
    }

    fn apply(&self, op: ShardOp) {
        let evaluation = eval::execute(&self.engine, &op.command);
        for key in evaluation.changed {
            self.publish(key);
        }

        let response = ShardResponse {
            request_id: op.request_id,
            shard_id: self.id,
            reply: evaluation.reply,
        };
        if op.reply_to.send(response).is_err() {
            trace!(shard = self.id, request_id = op.request_id, "requester gone, reply dropped");
        }
    }

    // Expired keys disappear here, so they are published like any mutation.
    fn sweep(&self) {
        let purged = self.engine.purge_expired();
        if purged.is_empty() {
            return;
        }
        trace!(shard = self.id, purged = purged.len(), "expired keys purged");
        for key in purged {
            self.publish(key);
        }
    }

    fn publish(&self, key: Bytes) {
        // Nobody listening is not an error; watches are optional.
        let _ = self.events.send(KeyChange {
            key,
            shard_id: self.id,
        });
    }
}
