//! Shared helpers for the TCP integration tests: an in-process server on an
//! ephemeral port and a minimal RESP client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use skv_engine::{wal, ShardConfig, ShardManager, Wal, WalConfig};
use skv_server::config::{ServerConfig, WatchConfig};
use skv_server::handler::CommandHandle;
use skv_server::registry::Registry;
use skv_server::transport::TransportHandle;
use skv_server::{Server, ServerError};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub cancel: CancellationToken,
    pub transports: Arc<Registry<TransportHandle>>,
    pub commands: Arc<Registry<CommandHandle>>,
    pub shards: Arc<ShardManager>,
    pub wal: Arc<dyn Wal>,
    task: JoinHandle<(Server, Result<(), ServerError>)>,
}

impl TestServer {
    /// Cancels the server and waits for `run` to return.
    pub async fn shutdown(self) -> (Server, Result<(), ServerError>) {
        self.cancel.cancel();
        let outcome = timeout(IO_TIMEOUT, self.task)
            .await
            .expect("server did not shut down")
            .expect("server task panicked");
        self.shards.wait_stopped().await;
        self.wal.flush().expect("wal flush");
        outcome
    }

    pub async fn client(&self) -> Client {
        Client::connect(self.addr).await
    }
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with(&WalConfig::default()).await
}

pub async fn spawn_server_with(wal_config: &WalConfig) -> TestServer {
    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shards = Arc::new(ShardManager::start(
        &ShardConfig {
            count: 4,
            ..ShardConfig::default()
        },
        events_tx,
        cancel.clone(),
    ));
    if wal_config.enabled {
        let commands = wal::replay(&wal_config.path).expect("wal replay");
        shards.replay(commands).await.expect("shard replay");
    }
    let wal = wal::open(wal_config).expect("wal open");

    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    };
    let mut server = Server::new(
        config,
        &WatchConfig::default(),
        Arc::clone(&shards),
        events_rx,
        Arc::clone(&wal),
    );
    let addr = server.bind_and_listen().expect("bind");
    let transports = server.transports();
    let commands = server.commands();

    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let result = server.run(token).await;
        (server, result)
    });

    TestServer {
        addr,
        cancel,
        transports,
        commands,
        shards,
        wal,
        task,
    }
}

/// Polls `check` until it holds or a few seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// A decoded RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Value>),
}

impl Value {
    pub fn bulk(text: &str) -> Value {
        Value::Bulk(text.as_bytes().to_vec())
    }

    pub fn ok() -> Value {
        Value::Simple("OK".to_string())
    }
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Client {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Sends one command as a RESP array.
    pub async fn send(&mut self, parts: &[&str]) {
        let mut frame = format!("*{}\r\n", parts.len());
        for part in parts {
            frame.push_str(&format!("${}\r\n{}\r\n", part.len(), part));
        }
        self.writer
            .write_all(frame.as_bytes())
            .await
            .expect("write");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
    }

    /// Sends a whitespace-separated command and reads its reply.
    pub async fn fire(&mut self, line: &str) -> Value {
        let parts: Vec<&str> = line.split_whitespace().collect();
        self.send(&parts).await;
        self.read().await
    }

    pub async fn read(&mut self) -> Value {
        timeout(IO_TIMEOUT, self.read_value())
            .await
            .expect("timed out waiting for a reply")
    }

    /// True if the server closes the connection within the I/O timeout.
    pub async fn closed_by_server(&mut self) -> bool {
        let mut rest = Vec::new();
        matches!(
            timeout(IO_TIMEOUT, self.reader.read_to_end(&mut rest)).await,
            Ok(Ok(_)) | Ok(Err(_))
        )
    }

    async fn read_value(&mut self) -> Value {
        let header = self.read_line().await;
        if let Some(count) = header.strip_prefix('*') {
            let count: usize = count.parse().expect("array length");
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                let line = self.read_line().await;
                items.push(self.read_scalar(&line).await);
            }
            return Value::Array(items);
        }
        self.read_scalar(&header).await
    }

    async fn read_scalar(&mut self, header: &str) -> Value {
        let (kind, body) = header.split_at(1);
        match kind {
            "+" => Value::Simple(body.to_string()),
            "-" => Value::Error(body.to_string()),
            ":" => Value::Int(body.parse().expect("integer")),
            "$" if body == "-1" => Value::Nil,
            "$" => {
                let len: usize = body.parse().expect("bulk length");
                let mut data = vec![0u8; len + 2];
                self.reader.read_exact(&mut data).await.expect("bulk body");
                data.truncate(len);
                Value::Bulk(data)
            }
            other => panic!("unexpected RESP type {other:?}"),
        }
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.expect("read");
        assert!(read > 0, "connection closed by server");
        line.trim_end_matches(['\r', '\n']).to_string()
    }
}
