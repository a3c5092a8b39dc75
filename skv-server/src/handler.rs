//! # Command Worker
//!
//! Owns the protocol parser for one connection. Turns inbound byte chunks
//! into commands, runs each one, and hands the encoded reply to the paired
//! transport worker.
//!
//! ## Design Principles
//!
//! 1. **One At A Time**: A command's reply is enqueued before the next
//!    command is dispatched, so replies leave in request order.
//! 2. **Log Before Ack**: Mutating commands are appended to the durability
//!    log before they reach a shard.
//! 3. **Scatter/Gather**: Multi-key commands are split per shard and their
//!    integer replies summed.
//! 4. **Two Reply Paths**: Ordinary shard replies arrive on the response
//!    channel; watch results arrive on the preprocessing channel and are
//!    wrapped as push frames before they go out.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use skv_common::{Command, CommandKind, Reply, SkvError};
use skv_engine::{ShardManager, ShardOp, ShardResponse, Wal};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channels::CommandEnds;
use crate::error::ServerError;
use crate::id::WorkerId;
use crate::metrics::Metrics;
use crate::protocol::{self, RespParser};
use crate::registry::{Registered, Registry};
use crate::watch::WatchSubscription;

/// Registry entry for a command worker.
#[derive(Debug)]
pub struct CommandHandle {
    id: WorkerId,
    transport_id: WorkerId,
    peer: SocketAddr,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl CommandHandle {
    pub fn new(
        id: WorkerId,
        transport_id: WorkerId,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        CommandHandle {
            id,
            transport_id,
            peer,
            cancel,
            running: AtomicBool::new(false),
        }
    }

    /// Identity of the paired transport worker.
    pub fn transport_id(&self) -> &WorkerId {
        &self.transport_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Registered for CommandHandle {
    fn id(&self) -> &WorkerId {
        &self.id
    }
}

/// Server-wide collaborators shared by every command worker.
#[derive(Clone)]
pub struct CommandContext {
    pub shards: Arc<ShardManager>,
    pub wal: Arc<dyn Wal>,
    pub watch_tx: mpsc::Sender<WatchSubscription>,
    pub metrics: Arc<Metrics>,
    /// Live command workers; its size is the connected-clients count.
    pub clients: Arc<Registry<CommandHandle>>,
}

pub struct CommandWorker {
    handle: Arc<CommandHandle>,
    inbound_rx: mpsc::Receiver<Bytes>,
    outbound_tx: mpsc::Sender<Bytes>,
    error_rx: oneshot::Receiver<io::Error>,
    ctx: CommandContext,
    parser: RespParser,
    preprocess_tx: mpsc::UnboundedSender<ShardResponse>,
    preprocess_rx: mpsc::UnboundedReceiver<ShardResponse>,
    /// Watched commands keyed by fingerprint.
    watching: HashMap<u64, Command>,
    next_request_id: u64,
}

impl CommandWorker {
    pub fn new(handle: Arc<CommandHandle>, ends: CommandEnds, ctx: CommandContext) -> Self {
        let CommandEnds {
            inbound_rx,
            outbound_tx,
            error_rx,
        } = ends;
        let (preprocess_tx, preprocess_rx) = mpsc::unbounded_channel();
        CommandWorker {
            handle,
            inbound_rx,
            outbound_tx,
            error_rx,
            ctx,
            parser: RespParser::new(),
            preprocess_tx,
            preprocess_rx,
            watching: HashMap::new(),
            next_request_id: 0,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.handle.id
    }

    /// Runs until the connection closes, the pair is cancelled, or a
    /// transport, protocol, or shard failure.
    ///
    /// Peer closure and cancellation return `Ok`.
    pub async fn start(mut self) -> Result<(), ServerError> {
        self.handle.running.store(true, Ordering::Release);
        trace!(id = %self.handle.id, transport = %self.handle.transport_id, "command worker started");

        let result = self.serve().await;

        self.handle.running.store(false, Ordering::Release);
        if !self.watching.is_empty() {
            let request = WatchSubscription::UnsubscribeAll {
                subscriber: self.handle.id.clone(),
            };
            if self.ctx.watch_tx.try_send(request).is_err() {
                // The watch manager prunes this worker lazily instead.
                debug!(id = %self.handle.id, "unsubscribe-all not delivered");
            }
        }

        match result {
            Err(err) if err.is_clean_stop() => Ok(()),
            other => other,
        }
    }

    async fn serve(&mut self) -> Result<(), ServerError> {
        let cancel = self.handle.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ServerError::Cancelled),
                report = &mut self.error_rx => {
                    return match report {
                        Ok(err) => Err(ServerError::Transport(err)),
                        Err(_) => Err(ServerError::ConnectionClosed),
                    };
                }
                chunk = self.inbound_rx.recv() => match chunk {
                    Some(bytes) => self.handle_bytes(&bytes).await?,
                    None => return Err(ServerError::ConnectionClosed),
                },
                Some(response) = self.preprocess_rx.recv() => self.deliver_watch(response).await?,
            }
        }
    }

    async fn handle_bytes(&mut self, bytes: &[u8]) -> Result<(), ServerError> {
        let commands = match self.parser.feed(bytes) {
            Ok(commands) => commands,
            Err(err) => {
                let reply = Reply::Error(format!("{} ({})", SkvError::ProtocolViolation, err));
                self.write(&reply).await?;
                return Err(err.into());
            }
        };
        for command in commands {
            let started = Instant::now();
            self.ctx.metrics.record_command_start();
            let outcome = self.execute(command).await;
            let is_error = match &outcome {
                Ok(Some(reply)) => reply.is_error(),
                Ok(None) => false,
                Err(_) => true,
            };
            self.ctx.metrics.record_command_end(started.elapsed(), is_error);
            if let Some(reply) = outcome? {
                self.write(&reply).await?;
            }
        }
        Ok(())
    }

    /// Runs one command. `None` means the reply arrives later as a push.
    async fn execute(&mut self, command: Command) -> Result<Option<Reply>, ServerError> {
        let name = command.lower_name();
        let reply = match command.kind() {
            CommandKind::Ping => match command.args() {
                [] => Reply::Simple("PONG".to_string()),
                [message] => Reply::Bulk(message.clone()),
                _ => Reply::error(SkvError::WrongArity, &name),
            },
            CommandKind::Echo => match command.args() {
                [message] => Reply::Bulk(message.clone()),
                _ => Reply::error(SkvError::WrongArity, &name),
            },
            CommandKind::Info => Reply::Bulk(Bytes::from(self.info())),
            CommandKind::GetWatch => return self.watch(command).await,
            CommandKind::GetUnwatch => self.unwatch(&command).await?,
            CommandKind::Unknown => Reply::error(SkvError::UnknownCommand, &name),
            _ => self.dispatch(command).await?,
        };
        Ok(Some(reply))
    }

    async fn dispatch(&mut self, command: Command) -> Result<Reply, ServerError> {
        let name = command.lower_name();
        let parts = self.ctx.shards.split(&command);
        if parts.is_empty() {
            return Ok(Reply::error(SkvError::WrongArity, &name));
        }

        if command.is_mutating() {
            if let Err(err) = command.check_expiry() {
                return Ok(Reply::error(err, &name));
            }
            if let Err(err) = self.ctx.wal.append(&command) {
                warn!(id = %self.handle.id, command = %name, error = %err, "durability log append failed");
                return Ok(Reply::error(SkvError::LogFailure, &name));
            }
        }

        // A fresh reply channel per request: once every op holding a sender
        // is dropped (a shard stopped or died), `recv` returns `None`.
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let expected = parts.len();
        for (shard, part) in parts {
            let op = ShardOp {
                request_id,
                command: part,
                reply_to: reply_tx.clone(),
            };
            if let Err(err) = self.ctx.shards.dispatch(shard, op).await {
                warn!(id = %self.handle.id, shard, command = %name, "shard unavailable");
                return Ok(Reply::error(err, &name));
            }
        }
        drop(reply_tx);

        let mut replies = Vec::with_capacity(expected);
        while replies.len() < expected {
            match self.next_response(&mut reply_rx).await? {
                Some(response) => replies.push(response.reply),
                None => {
                    warn!(id = %self.handle.id, command = %name, "shard dropped the request");
                    return Ok(Reply::error(SkvError::ShardUnavailable, &name));
                }
            }
        }
        Ok(gather(replies))
    }

    async fn next_response(
        &self,
        replies: &mut mpsc::UnboundedReceiver<ShardResponse>,
    ) -> Result<Option<ShardResponse>, ServerError> {
        tokio::select! {
            biased;
            _ = self.handle.cancel.cancelled() => Err(ServerError::Cancelled),
            response = replies.recv() => Ok(response),
        }
    }

    async fn watch(&mut self, command: Command) -> Result<Option<Reply>, ServerError> {
        let name = command.lower_name();
        let watched = match command.watched_command() {
            Some(watched) if command.args().len() == 1 => watched,
            _ => return Ok(Some(Reply::error(SkvError::WrongArity, &name))),
        };
        let fingerprint = watched.fingerprint();

        self.ctx
            .watch_tx
            .send(WatchSubscription::Subscribe {
                subscriber: self.handle.id.clone(),
                fingerprint,
                command: watched.clone(),
                reply_to: self.preprocess_tx.clone(),
            })
            .await
            .map_err(|_| ServerError::WatchStopped)?;
        self.watching.insert(fingerprint, watched.clone());

        // The current value goes out as the first push.
        let shard = self.ctx.shards.shard_for(&watched.args()[0]);
        let op = ShardOp {
            request_id: fingerprint,
            command: watched,
            reply_to: self.preprocess_tx.clone(),
        };
        if let Err(err) = self.ctx.shards.dispatch(shard, op).await {
            return Ok(Some(Reply::error(err, &name)));
        }
        debug!(id = %self.handle.id, fingerprint, "watch registered");
        Ok(None)
    }

    async fn unwatch(&mut self, command: &Command) -> Result<Reply, ServerError> {
        let name = command.lower_name();
        let [raw] = command.args() else {
            return Ok(Reply::error(SkvError::WrongArity, &name));
        };
        let Some(fingerprint) = std::str::from_utf8(raw)
            .ok()
            .and_then(|text| text.parse::<u64>().ok())
        else {
            return Ok(Reply::error(SkvError::NotInteger, &name));
        };

        self.watching.remove(&fingerprint);
        self.ctx
            .watch_tx
            .send(WatchSubscription::Unsubscribe {
                subscriber: self.handle.id.clone(),
                fingerprint,
            })
            .await
            .map_err(|_| ServerError::WatchStopped)?;
        Ok(Reply::ok())
    }

    async fn deliver_watch(&mut self, response: ShardResponse) -> Result<(), ServerError> {
        // Results for a watch dropped in the meantime are discarded.
        let Some(watched) = self.watching.get(&response.request_id) else {
            return Ok(());
        };
        let push = protocol::watch_push(watched.name(), response.request_id, response.reply);
        self.write(&push).await
    }

    async fn write(&self, reply: &Reply) -> Result<(), ServerError> {
        self.outbound_tx
            .send(protocol::encode(reply))
            .await
            .map_err(|_| ServerError::ConnectionClosed)
    }

    fn info(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "# Server\r\nengine:shardkv\r\nshards:{}\r\n# Clients\r\nregistered_clients:{}\r\n# Stats\r\n",
            self.ctx.shards.num_shards(),
            self.ctx.clients.len(),
        );
        self.ctx.metrics.snapshot().render(&mut out);
        out
    }
}

/// Combines per-shard replies: the first error wins, integers are summed,
/// and a single reply passes through unchanged.
fn gather(mut replies: Vec<Reply>) -> Reply {
    if replies.len() == 1 {
        return replies.remove(0);
    }
    if let Some(index) = replies.iter().position(Reply::is_error) {
        return replies.swap_remove(index);
    }
    let mut total = 0i64;
    for reply in &replies {
        match reply.as_integer() {
            Some(value) => total += value,
            None => return Reply::error(SkvError::InternalError, ""),
        }
    }
    Reply::Integer(total)
}
