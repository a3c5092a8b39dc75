//! # ShardKV Engine
//!
//! The data-owning side of the server: storage engines, shard tasks that own
//! them, the manager that routes keys to shards, and the durability log.

pub mod engine;
pub mod eval;
pub mod manager;
pub mod memory;
pub mod shard;
pub mod wal;

pub use engine::KVEngine;
pub use engine::TtlStatus;
pub use manager::{ShardConfig, ShardManager};
pub use memory::MemoryEngine;
pub use shard::{KeyChange, ShardId, ShardOp, ShardResponse};
pub use wal::{FileWal, NullWal, Wal, WalConfig, WalError};
