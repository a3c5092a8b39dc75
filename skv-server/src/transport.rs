//! # Transport Worker
//!
//! The only component that touches a client socket. It pumps inbound bytes
//! to the paired command worker and writes the payloads that worker sends
//! back, in order.
//!
//! ## Design Principles
//!
//! 1. **Split Halves**: Reads and writes progress independently, so a full
//!    inbound channel never stops replies from draining.
//! 2. **Half-Close Friendly**: On read EOF the worker keeps writing until the
//!    command worker closes the outbound channel.
//! 3. **Report Once**: A fatal I/O error goes out on the error channel exactly
//!    once; the oneshot sender is consumed by the report.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::channels::TransportEnds;
use crate::error::ServerError;
use crate::id::WorkerId;
use crate::registry::Registered;

/// Registry entry for a transport worker.
#[derive(Debug)]
pub struct TransportHandle {
    id: WorkerId,
    peer: SocketAddr,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl TransportHandle {
    pub fn new(id: WorkerId, peer: SocketAddr, cancel: CancellationToken) -> Self {
        TransportHandle {
            id,
            peer,
            cancel,
            running: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Registered for TransportHandle {
    fn id(&self) -> &WorkerId {
        &self.id
    }
}

pub struct TransportWorker {
    handle: Arc<TransportHandle>,
    stream: TcpStream,
    ends: TransportEnds,
    read_buffer_size: usize,
}

impl TransportWorker {
    pub fn new(
        handle: Arc<TransportHandle>,
        stream: TcpStream,
        ends: TransportEnds,
        read_buffer_size: usize,
    ) -> Self {
        TransportWorker {
            handle,
            stream,
            ends,
            read_buffer_size: read_buffer_size.max(512),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.handle.id
    }

    /// Runs until cancellation, until the command worker closes the outbound
    /// channel, or until a fatal I/O error.
    pub async fn start(self) -> Result<(), ServerError> {
        let TransportWorker {
            handle,
            stream,
            ends,
            read_buffer_size,
        } = self;
        let TransportEnds {
            inbound_tx,
            mut outbound_rx,
            error_tx,
        } = ends;

        handle.running.store(true, Ordering::Release);
        trace!(id = %handle.id, peer = %handle.peer, "transport worker started");

        let (reader, mut writer) = stream.into_split();
        let read = read_loop(reader, inbound_tx, read_buffer_size);
        let write = write_loop(&mut writer, &mut outbound_rx);
        tokio::pin!(read);
        tokio::pin!(write);

        let mut reading = true;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => break Ok(()),
                res = &mut read, if reading => match res {
                    Ok(()) => reading = false,
                    Err(err) => break Err(err),
                },
                res = &mut write => break res,
            }
        };

        handle.running.store(false, Ordering::Release);
        match outcome {
            Ok(()) => {
                trace!(id = %handle.id, "transport worker stopped");
                Ok(())
            }
            Err(err) => {
                debug!(id = %handle.id, peer = %handle.peer, error = %err, "transport failed");
                let _ = error_tx.send(io::Error::new(err.kind(), err.to_string()));
                Err(ServerError::Transport(err))
            }
        }
    }
}

/// Reads until EOF; returns early without error if the command worker is gone.
async fn read_loop(
    mut reader: OwnedReadHalf,
    inbound: mpsc::Sender<Bytes>,
    chunk_size: usize,
) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(chunk_size);
    loop {
        buf.reserve(chunk_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(_) => {
                if inbound.send(buf.split().freeze()).await.is_err() {
                    return Ok(());
                }
            }
            Err(err) if is_transient(&err) => continue,
            Err(err) => return Err(err),
        }
    }
}

async fn write_loop(
    writer: &mut OwnedWriteHalf,
    outbound: &mut mpsc::Receiver<Bytes>,
) -> io::Result<()> {
    while let Some(payload) = outbound.recv().await {
        loop {
            match writer.write_all(&payload).await {
                Ok(()) => break,
                Err(err) if is_transient(&err) => continue,
                Err(err) => return Err(err),
            }
        }
    }
    writer.shutdown().await.or_else(|err| match err.kind() {
        io::ErrorKind::NotConnected => Ok(()),
        _ => Err(err),
    })
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
