// skv-common - Shared command, reply and error types for ShardKV
//
// This crate is the vocabulary shared by the server and the shard layer.

pub mod command;
pub mod error;
pub mod reply;

// Re-export for convenience
pub use command::*;
pub use error::*;
pub use reply::*;
