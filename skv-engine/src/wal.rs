//! # Durability Log
//!
//! Append-only record of mutating commands.
//!
//! ## Record Layout
//!
//! ```text
//! +-----------+----------------------------------------+
//! | argc: u32 | argc x ( len: u32 | bytes: len )        |
//! +-----------+----------------------------------------+
//! ```
//!
//! All integers are little-endian. The command name is the first part.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use skv_common::Command;
use thiserror::Error;
use tracing::info;

/// Durability log failures.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("wal record {index} is truncated")]
    Truncated { index: usize },
}

/// Durability log settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_wal_path")]
    pub path: PathBuf,
    /// Call `fsync` after every append instead of relying on `flush`.
    #[serde(default)]
    pub sync_on_append: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            enabled: false,
            path: default_wal_path(),
            sync_on_append: false,
        }
    }
}

fn default_wal_path() -> PathBuf {
    PathBuf::from("skv.wal")
}

/// Append contract consumed by command workers.
///
/// `append` returning `Ok` is the acknowledgement point: callers must not
/// confirm a mutation to a client before it.
pub trait Wal: Send + Sync {
    fn append(&self, command: &Command) -> Result<(), WalError>;

    fn flush(&self) -> Result<(), WalError>;
}

/// Log that records nothing; used when durability is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWal;

impl Wal for NullWal {
    fn append(&self, _command: &Command) -> Result<(), WalError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), WalError> {
        Ok(())
    }
}

/// File-backed append-only log.
pub struct FileWal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    sync_on_append: bool,
}

impl FileWal {
    pub fn open(path: impl AsRef<Path>, sync_on_append: bool) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(FileWal {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            sync_on_append,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Wal for FileWal {
    fn append(&self, command: &Command) -> Result<(), WalError> {
        let record = encode_record(command);
        let mut writer = self.writer.lock();
        writer.write_all(&record)?;
        writer.flush()?;
        if self.sync_on_append {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), WalError> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }
}

/// Opens the log described by `config`, or a [`NullWal`] if disabled.
pub fn open(config: &WalConfig) -> Result<Arc<dyn Wal>, WalError> {
    if !config.enabled {
        return Ok(Arc::new(NullWal));
    }
    let wal = FileWal::open(&config.path, config.sync_on_append)?;
    info!(path = %wal.path().display(), "durability log opened");
    Ok(Arc::new(wal))
}

/// Reads every record from the log at `path`.
///
/// A missing file yields no commands.
pub fn replay(path: impl AsRef<Path>) -> Result<Vec<Command>, WalError> {
    let file = match File::open(path.as_ref()) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut commands = Vec::new();

    loop {
        let index = commands.len();
        let argc = match read_u32(&mut reader) {
            Ok(argc) => argc,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        };
        let mut parts = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            let len = read_u32(&mut reader).map_err(|err| truncated(err, index))?;
            let mut part = vec![0u8; len as usize];
            reader
                .read_exact(&mut part)
                .map_err(|err| truncated(err, index))?;
            parts.push(part);
        }
        if let Some(command) = Command::from_parts(parts) {
            commands.push(command);
        }
    }
    Ok(commands)
}

fn encode_record(command: &Command) -> Vec<u8> {
    let args = command.args();
    let size = 8 + command.name().len() + args.iter().map(|a| 4 + a.len()).sum::<usize>();
    let mut record = Vec::with_capacity(size);
    record.extend_from_slice(&((args.len() + 1) as u32).to_le_bytes());
    record.extend_from_slice(&(command.name().len() as u32).to_le_bytes());
    record.extend_from_slice(command.name().as_bytes());
    for arg in args {
        record.extend_from_slice(&(arg.len() as u32).to_le_bytes());
        record.extend_from_slice(arg);
    }
    record
}

fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn truncated(err: io::Error, index: usize) -> WalError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        WalError::Truncated { index }
    } else {
        WalError::Io(err)
    }
}
