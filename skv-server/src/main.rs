//! # ShardKV Server
//!
//! Loads configuration, recovers the durability log, starts the shards and
//! serves RESP clients until SIGINT or SIGTERM.
//!
//! Configuration comes from `--config <path>` (or `SKV_CONFIG`) plus
//! `SKV__*` environment overrides.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use skv_engine::{wal, ShardManager};
use skv_server::{logging, Server, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config_path();
    let settings =
        Settings::load(config_path.as_deref()).context("failed to load configuration")?;
    logging::init(&settings.logging);

    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shards = Arc::new(ShardManager::start(
        &settings.shards,
        events_tx,
        cancel.clone(),
    ));

    if settings.wal.enabled {
        let commands = wal::replay(&settings.wal.path)
            .with_context(|| format!("failed to read {}", settings.wal.path.display()))?;
        shards
            .replay(commands)
            .await
            .context("failed to replay durability log")?;
    }
    let wal = wal::open(&settings.wal).context("failed to open durability log")?;

    let mut server = Server::new(
        settings.server.clone(),
        &settings.watch,
        Arc::clone(&shards),
        events_rx,
        Arc::clone(&wal),
    );
    server.bind_and_listen()?;

    tokio::spawn(shutdown_signal(cancel.clone()));
    let result = server.run(cancel.clone()).await;

    cancel.cancel();
    shards.wait_stopped().await;
    if let Err(err) = wal.flush() {
        warn!(error = %err, "durability log flush failed");
    }
    info!("bye");
    Ok(result?)
}

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var_os("SKV_CONFIG").map(PathBuf::from)
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
