//! # ShardKV Server
//!
//! Connection handling for ShardKV: the listening socket, one transport
//! worker and one command worker per client, the registries that track
//! them, and the watch manager that turns key changes into pushes.

pub mod channels;
pub mod config;
pub mod error;
pub mod handler;
pub mod id;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;
pub mod watch;

pub use config::Settings;
pub use error::ServerError;
pub use server::{Server, ServerState};
