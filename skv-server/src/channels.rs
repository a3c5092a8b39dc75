//! The three channels that bind one transport worker to one command worker.
//!
//! - inbound: raw socket bytes, transport -> command (bounded)
//! - outbound: encoded replies, command -> transport (bounded)
//! - error: the transport's terminal I/O error, sent at most once
//!
//! Dropping either end closes the channel, which is how each worker notices
//! that its partner has stopped.

use std::io;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::config::ServerConfig;

/// Ends owned by the transport worker.
#[derive(Debug)]
pub struct TransportEnds {
    pub inbound_tx: mpsc::Sender<Bytes>,
    pub outbound_rx: mpsc::Receiver<Bytes>,
    pub error_tx: oneshot::Sender<io::Error>,
}

/// Ends owned by the command worker.
#[derive(Debug)]
pub struct CommandEnds {
    pub inbound_rx: mpsc::Receiver<Bytes>,
    pub outbound_tx: mpsc::Sender<Bytes>,
    pub error_rx: oneshot::Receiver<io::Error>,
}

/// Allocates a fresh channel set for one connection.
pub fn channel_set(config: &ServerConfig) -> (TransportEnds, CommandEnds) {
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
    let (error_tx, error_rx) = oneshot::channel();
    (
        TransportEnds {
            inbound_tx,
            outbound_rx,
            error_tx,
        },
        CommandEnds {
            inbound_rx,
            outbound_tx,
            error_rx,
        },
    )
}
