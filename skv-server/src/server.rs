//! # Listening Server
//!
//! Binds the listening socket, accepts connections, and wires one transport
//! worker plus one command worker per connection.
//!
//! ## Lifecycle
//!
//! `Unbound -> Bound -> Listening -> Accepting -> ShuttingDown -> Closed`
//!
//! Shutdown starts when the governing token is cancelled, when accept fails
//! fatally, or when the watch manager stops. Every worker pair runs under a
//! child token of the server's token and is tracked, so shutdown waits for
//! all of them to exit (and unregister) before the state becomes `Closed`.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use skv_engine::{KeyChange, ShardManager, Wal};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::channels::channel_set;
use crate::config::{ServerConfig, WatchConfig};
use crate::error::ServerError;
use crate::handler::{CommandContext, CommandHandle, CommandWorker};
use crate::id::{IdGenerator, WorkerCategory, WorkerId};
use crate::metrics::Metrics;
use crate::registry::{Registered, Registry};
use crate::transport::{TransportHandle, TransportWorker};
use crate::watch::WatchManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unbound,
    Bound,
    Listening,
    Accepting,
    ShuttingDown,
    Closed,
}

pub struct Server {
    config: ServerConfig,
    state: ServerState,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    ids: IdGenerator,
    transports: Arc<Registry<TransportHandle>>,
    commands: Arc<Registry<CommandHandle>>,
    context: CommandContext,
    watch: Option<WatchManager>,
    tracker: TaskTracker,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        watch: &WatchConfig,
        shards: Arc<ShardManager>,
        events: mpsc::UnboundedReceiver<KeyChange>,
        wal: Arc<dyn Wal>,
    ) -> Self {
        let (watch_tx, watch_rx) = mpsc::channel(watch.subscription_capacity.max(1));
        let commands = Arc::new(Registry::new("command"));
        let context = CommandContext {
            shards: Arc::clone(&shards),
            wal,
            watch_tx,
            metrics: Arc::new(Metrics::new()),
            clients: Arc::clone(&commands),
        };
        Server {
            config,
            state: ServerState::Unbound,
            listener: None,
            local_addr: None,
            ids: IdGenerator::new(),
            transports: Arc::new(Registry::new("transport")),
            commands,
            context,
            watch: Some(WatchManager::new(watch_rx, events, shards)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Address actually bound; useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn transports(&self) -> Arc<Registry<TransportHandle>> {
        Arc::clone(&self.transports)
    }

    pub fn commands(&self) -> Arc<Registry<CommandHandle>> {
        Arc::clone(&self.commands)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.context.metrics)
    }

    /// Creates the non-blocking, address-reusable listening socket.
    ///
    /// Must be called inside a Tokio runtime. On failure no socket is kept
    /// and the server stays `Unbound`.
    pub fn bind_and_listen(&mut self) -> Result<SocketAddr, ServerError> {
        if let Some(addr) = self.local_addr.filter(|_| self.listener.is_some()) {
            return Ok(addr);
        }
        let addr_text = format!("{}:{}", self.config.host, self.config.port);
        let bind_error = |source: io::Error| ServerError::Bind {
            addr: addr_text.clone(),
            source,
        };

        let ip: IpAddr = self
            .config
            .host
            .parse()
            .map_err(|err| bind_error(io::Error::new(io::ErrorKind::InvalidInput, err)))?;
        let addr = SocketAddr::new(ip, self.config.port);

        let result = self.open_listener(addr);
        match result {
            Ok((listener, local)) => {
                self.listener = Some(listener);
                self.local_addr = Some(local);
                self.state = ServerState::Listening;
                info!(addr = %local, backlog = self.config.backlog, "listening");
                Ok(local)
            }
            Err(source) => {
                self.state = ServerState::Unbound;
                error!(addr = %addr_text, error = %source, "bind failed");
                Err(bind_error(source))
            }
        }
    }

    fn open_listener(&mut self, addr: SocketAddr) -> io::Result<(TcpListener, SocketAddr)> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        self.state = ServerState::Bound;
        socket.listen(self.config.backlog)?;
        let listener = TcpListener::from_std(socket.into())?;
        let local = listener.local_addr()?;
        Ok((listener, local))
    }

    /// Serves until `cancel` fires or a server-scoped failure occurs, then
    /// shuts down. Returns `Ok` on cancellation, otherwise the failure.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ServerError> {
        if self.state == ServerState::Closed {
            return Err(ServerError::Cancelled);
        }
        if self.listener.is_none() {
            self.bind_and_listen()?;
        }
        let (Some(listener), Some(watch)) = (self.listener.take(), self.watch.take()) else {
            return Err(ServerError::WatchStopped);
        };
        let token = cancel.child_token();

        let mut watch_task = self.tracker.spawn(watch.run(token.clone()));
        self.state = ServerState::Accepting;

        let result = tokio::select! {
            _ = token.cancelled() => Ok(()),
            res = self.accept_loop(&listener, &token) => res,
            res = &mut watch_task => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(ServerError::WatchStopped),
            },
        };

        self.state = ServerState::ShuttingDown;
        match &result {
            Ok(()) => info!("shutting down"),
            Err(err) => error!(error = %err, "shutting down after failure"),
        }
        token.cancel();
        drop(listener);
        self.tracker.close();
        self.tracker.wait().await;
        self.state = ServerState::Closed;
        info!("server closed");
        result
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        token: &CancellationToken,
    ) -> Result<(), ServerError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => self.spawn_pair(stream, peer, token),
                Err(err) if is_transient_accept(&err) => {
                    debug!(error = %err, "transient accept error");
                }
                Err(err) => {
                    error!(error = %err, "accept failed");
                    return Err(ServerError::Accept(err));
                }
            }
        }
    }

    /// Wires and starts one worker pair. Both workers are registered before
    /// either starts; if either registration fails the connection is dropped.
    fn spawn_pair(&self, stream: TcpStream, peer: SocketAddr, token: &CancellationToken) {
        let pair_token = token.child_token();
        let transport_id = self.ids.next(WorkerCategory::Transport);
        let command_id = self.ids.next(WorkerCategory::Command);
        let (transport_ends, command_ends) = channel_set(&self.config);

        let transport = Arc::new(TransportHandle::new(
            transport_id.clone(),
            peer,
            pair_token.clone(),
        ));
        let command = Arc::new(CommandHandle::new(
            command_id.clone(),
            transport_id.clone(),
            peer,
            pair_token,
        ));

        if let Err(err) = self.transports.register(Arc::clone(&transport)) {
            warn!(peer = %peer, error = %err, "dropping connection");
            return;
        }
        if let Err(err) = self.commands.register(Arc::clone(&command)) {
            warn!(peer = %peer, error = %err, "dropping connection");
            unregister(&self.transports, &transport_id);
            return;
        }

        let transport_worker =
            TransportWorker::new(transport, stream, transport_ends, self.config.read_buffer_size);
        let command_worker = CommandWorker::new(command, command_ends, self.context.clone());
        let metrics = Arc::clone(&self.context.metrics);
        metrics.record_connection_open();
        debug!(peer = %peer, transport = %transport_id, command = %command_id, "worker pair started");

        self.tracker.spawn(supervise(
            transport_worker.start(),
            Arc::clone(&self.transports),
            transport_id,
        ));
        let commands = Arc::clone(&self.commands);
        self.tracker.spawn(async move {
            supervise(command_worker.start(), commands, command_id).await;
            metrics.record_connection_close();
        });
    }
}

/// Runs a worker to completion and unregisters it.
async fn supervise<H, F>(work: F, registry: Arc<Registry<H>>, id: WorkerId)
where
    H: Registered,
    F: Future<Output = Result<(), ServerError>>,
{
    match work.await {
        Ok(()) => debug!(id = %id, "worker stopped"),
        Err(err) => debug!(id = %id, error = %err, "worker stopped with error"),
    }
    unregister(&registry, &id);
}

fn unregister<H: Registered>(registry: &Registry<H>, id: &WorkerId) {
    if let Err(err) = registry.unregister(id) {
        warn!(registry = registry.name(), error = %err, "unregister failed");
    }
}

fn is_transient_accept(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use skv_engine::{NullWal, ShardConfig};

    use super::*;

    fn server(host: &str, port: u16) -> (Server, CancellationToken) {
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shards = Arc::new(ShardManager::start(
            &ShardConfig {
                count: 2,
                ..ShardConfig::default()
            },
            events_tx,
            cancel.clone(),
        ));
        let config = ServerConfig {
            host: host.to_string(),
            port,
            ..ServerConfig::default()
        };
        let server = Server::new(
            config,
            &WatchConfig::default(),
            shards,
            events_rx,
            Arc::new(NullWal),
        );
        (server, cancel)
    }

    #[tokio::test]
    async fn bind_moves_to_listening() {
        let (mut server, _cancel) = server("127.0.0.1", 0);
        assert_eq!(server.state(), ServerState::Unbound);
        let addr = server.bind_and_listen().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.state(), ServerState::Listening);
        assert_eq!(server.local_addr(), Some(addr));
    }

    #[tokio::test]
    async fn invalid_host_is_a_bind_error() {
        let (mut server, _cancel) = server("not-an-ip", 0);
        let err = server.bind_and_listen().unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert_eq!(server.state(), ServerState::Unbound);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn cancelled_run_ends_closed() {
        let (mut server, cancel) = server("127.0.0.1", 0);
        server.bind_and_listen().unwrap();
        cancel.cancel();
        server.run(cancel).await.unwrap();
        assert_eq!(server.state(), ServerState::Closed);
        assert!(server.transports().is_empty());
        assert!(server.commands().is_empty());
    }

    #[test]
    fn accept_error_classification() {
        assert!(is_transient_accept(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient_accept(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(!is_transient_accept(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }
}
