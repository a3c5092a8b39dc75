//! # Server Errors
//!
//! Server-scoped failures (bind, fatal accept, watch task) end `Server::run`;
//! connection-scoped ones end a single worker pair and are only logged.

use std::io;

use skv_common::SkvError;
use thiserror::Error;

use crate::id::WorkerId;
use crate::protocol::RespError;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Creating, configuring, binding or listening on the socket failed,
    /// including an unparsable host.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("error accepting connection: {0}")]
    Accept(#[source] io::Error),

    #[error("worker {0} is already registered")]
    DuplicateId(WorkerId),

    #[error("worker {0} is not registered")]
    NotFound(WorkerId),

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] RespError),

    #[error("shard layer error: {0}")]
    Shard(#[from] SkvError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("watch manager stopped")]
    WatchStopped,

    /// The peer half of a worker pair went away; a clean stop.
    #[error("connection closed")]
    ConnectionClosed,

    /// The governing cancellation token fired; a clean stop.
    #[error("cancelled")]
    Cancelled,
}

impl ServerError {
    /// Returns true for stops that are not failures.
    pub fn is_clean_stop(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Cancelled)
    }
}
