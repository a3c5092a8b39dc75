//! # Commands
//!
//! Purpose: Represent one parsed client command independent of the wire format.
//!
//! ## Design Principles
//!
//! 1. **Normalized Names**: Command names are uppercased once at construction
//!    so routing never re-compares case-insensitively.
//! 2. **Binary-Safe Arguments**: Arguments are `Bytes` so fan-out to shards and
//!    watch re-execution clone by reference count, not by copy.
//! 3. **Static Routing Table**: `CommandKind` decides key positions and
//!    mutability without touching the storage layer.

use std::hash::{BuildHasher, Hash, Hasher};
use std::time::Duration;

use ahash::RandomState;
use bytes::Bytes;

use crate::error::SkvError;

/// Suffix that turns a read command into a watch subscription.
pub const WATCH_SUFFIX: &str = ".WATCH";

/// Suffix that removes a watch subscription.
pub const UNWATCH_SUFFIX: &str = ".UNWATCH";

// Fixed seeds keep fingerprints stable for the lifetime of the process.
const FINGERPRINT_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Longest accepted expiry (100 years). Larger values would overflow the
/// monotonic clock when turned into a deadline.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Unit of an expiry amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryUnit {
    Seconds,
    Millis,
}

impl ExpiryUnit {
    /// Resolves a `SET` option (`EX` or `PX`), case-insensitively.
    pub fn from_option(option: &[u8]) -> Option<Self> {
        match option.to_ascii_uppercase().as_slice() {
            b"EX" => Some(Self::Seconds),
            b"PX" => Some(Self::Millis),
            _ => None,
        }
    }
}

/// Parses a signed decimal integer argument.
pub fn parse_integer(raw: &[u8]) -> Result<i64, SkvError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(SkvError::NotInteger)
}

/// Converts a positive expiry amount into a TTL no longer than [`MAX_TTL`].
pub fn ttl_from(amount: i64, unit: ExpiryUnit) -> Result<Duration, SkvError> {
    if amount <= 0 {
        return Err(SkvError::InvalidExpireTime);
    }
    let ttl = match unit {
        ExpiryUnit::Seconds => Duration::from_secs(amount as u64),
        ExpiryUnit::Millis => Duration::from_millis(amount as u64),
    };
    if ttl > MAX_TTL {
        return Err(SkvError::InvalidExpireTime);
    }
    Ok(ttl)
}

/// Known command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Ping,
    Echo,
    Info,
    Get,
    Set,
    Del,
    Exists,
    Expire,
    Ttl,
    /// `GET.WATCH key`: subscribe to changes of `GET key`.
    GetWatch,
    /// `GET.UNWATCH fingerprint`: drop a subscription.
    GetUnwatch,
    Unknown,
}

impl CommandKind {
    /// Resolves an uppercase command name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "PING" => Self::Ping,
            "ECHO" => Self::Echo,
            "INFO" => Self::Info,
            "GET" => Self::Get,
            "SET" => Self::Set,
            "DEL" => Self::Del,
            "EXISTS" => Self::Exists,
            "EXPIRE" => Self::Expire,
            "TTL" => Self::Ttl,
            "GET.WATCH" => Self::GetWatch,
            "GET.UNWATCH" => Self::GetUnwatch,
            _ => Self::Unknown,
        }
    }

    /// Returns true if the command changes stored data.
    pub const fn is_mutating(self) -> bool {
        matches!(self, Self::Set | Self::Del | Self::Expire)
    }

    /// Returns true if every argument is a key (multi-key commands).
    pub const fn is_multi_key(self) -> bool {
        matches!(self, Self::Del | Self::Exists)
    }
}

/// A single client command: uppercase name plus raw arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
}

impl Command {
    /// Builds a command, normalizing the name to uppercase.
    pub fn new(name: impl AsRef<[u8]>, args: Vec<Bytes>) -> Self {
        let name = String::from_utf8_lossy(name.as_ref()).to_ascii_uppercase();
        Command { name, args }
    }

    /// Builds a command from raw frame parts; the first part is the name.
    ///
    /// Returns `None` for an empty frame.
    pub fn from_parts(parts: Vec<Vec<u8>>) -> Option<Self> {
        let mut parts = parts.into_iter();
        let name = parts.next()?;
        Some(Command::new(name, parts.map(Bytes::from).collect()))
    }

    /// Uppercase command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lowercase command name, as used in error messages.
    pub fn lower_name(&self) -> String {
        self.name.to_ascii_lowercase()
    }

    /// All arguments after the name.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Argument at `idx`, if present.
    pub fn arg(&self, idx: usize) -> Option<&Bytes> {
        self.args.get(idx)
    }

    pub fn kind(&self) -> CommandKind {
        CommandKind::from_name(&self.name)
    }

    pub fn is_mutating(&self) -> bool {
        self.kind().is_mutating()
    }

    /// Keys the command touches, in argument order.
    ///
    /// Used both for shard routing and for matching watch subscriptions
    /// against key-change events.
    pub fn keys(&self) -> &[Bytes] {
        match self.kind() {
            CommandKind::Del | CommandKind::Exists => &self.args,
            CommandKind::Get
            | CommandKind::Set
            | CommandKind::Expire
            | CommandKind::Ttl
            | CommandKind::GetWatch => self.args.get(..1).unwrap_or(&[]),
            _ => &[],
        }
    }

    /// Returns the plain read command behind a `<CMD>.WATCH` subscription.
    pub fn watched_command(&self) -> Option<Command> {
        let base = self.name.strip_suffix(WATCH_SUFFIX)?;
        Some(Command {
            name: base.to_string(),
            args: self.args.clone(),
        })
    }

    /// Returns a copy of this command restricted to a subset of its keys.
    ///
    /// Only meaningful for multi-key commands; used when scattering across shards.
    pub fn with_args(&self, args: Vec<Bytes>) -> Command {
        Command {
            name: self.name.clone(),
            args,
        }
    }

    /// Checks expiry arguments of `SET .. EX|PX n` and `EXPIRE k n`.
    ///
    /// Runs before a mutation is logged, so a value the shard would reject
    /// never reaches the durability log. Other commands always pass.
    pub fn check_expiry(&self) -> Result<(), SkvError> {
        match (self.kind(), self.args.as_slice()) {
            (CommandKind::Set, [_, _, option, amount]) => {
                let unit = ExpiryUnit::from_option(option).ok_or(SkvError::Syntax)?;
                ttl_from(parse_integer(amount)?, unit).map(drop)
            }
            (CommandKind::Expire, [_, amount]) => match parse_integer(amount)? {
                // Non-positive EXPIRE deletes the key.
                seconds if seconds <= 0 => Ok(()),
                seconds => ttl_from(seconds, ExpiryUnit::Seconds).map(drop),
            },
            _ => Ok(()),
        }
    }

    /// Stable identity of a command, used to key watch subscriptions.
    ///
    /// Two clients watching the same command share one fingerprint.
    pub fn fingerprint(&self) -> u64 {
        let state = RandomState::with_seeds(
            FINGERPRINT_SEEDS[0],
            FINGERPRINT_SEEDS[1],
            FINGERPRINT_SEEDS[2],
            FINGERPRINT_SEEDS[3],
        );
        let mut hasher = state.build_hasher();
        self.name.hash(&mut hasher);
        for arg in &self.args {
            arg.hash(&mut hasher);
        }
        hasher.finish()
    }
}
