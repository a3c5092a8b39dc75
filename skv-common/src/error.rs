//! # ShardKV Error Types
//!
//! ## Design Principles
//!
//! 1. **Stable Codes**: Each variant has a fixed numeric code so logs and
//!    metrics can group failures without string matching.
//! 2. **Categorized Ranges**: Codes are grouped by intent (client, server, transient, protocol).
//! 3. **Low Overhead**: Enums are `Copy` and `repr(u16)` so they travel through
//!    shard replies without allocation.
//! 4. **Client-Facing Text**: `Display` renders the Redis-style error line.

use core::fmt;

/// Result type used across ShardKV components.
pub type SkvResult<T> = core::result::Result<T, SkvError>;

/// High-level category for grouping error codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SkvErrorCategory {
    /// Invalid input or user request issues.
    Client,
    /// Server-side resource or invariant failures.
    Server,
    /// Retryable conditions such as contention or shutdown.
    Transient,
    /// Wire protocol violations.
    Protocol,
}

impl SkvErrorCategory {
    /// Returns true if the category is safe to retry.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Command-level error codes.
#[repr(u16)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SkvError {
    /// Client error: argument count does not match the command (code 1).
    WrongArity = 1,
    /// Client error: command name is not known (code 2).
    UnknownCommand = 2,
    /// Client error: argument is not an integer or out of range (code 3).
    NotInteger = 3,
    /// Client error: malformed option list (code 4).
    Syntax = 4,
    /// Client error: expire time is zero or negative (code 5).
    InvalidExpireTime = 5,

    /// Server error: the owning shard is gone (code 10).
    ShardUnavailable = 10,
    /// Server error: durability log append failed (code 11).
    LogFailure = 11,
    /// Server error: internal invariant violated (code 12).
    InternalError = 12,

    /// Transient error: shard queue is full (code 20).
    Busy = 20,
    /// Transient error: operation interrupted by shutdown (code 22).
    Interrupted = 22,

    /// Protocol error: request framing is invalid (code 31).
    ProtocolViolation = 31,
}

impl SkvError {
    /// Returns the stable numeric code for the error.
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Returns the coarse category of the error.
    pub const fn category(self) -> SkvErrorCategory {
        match self {
            Self::WrongArity
            | Self::UnknownCommand
            | Self::NotInteger
            | Self::Syntax
            | Self::InvalidExpireTime => SkvErrorCategory::Client,
            Self::ShardUnavailable | Self::LogFailure | Self::InternalError => {
                SkvErrorCategory::Server
            }
            Self::Busy | Self::Interrupted => SkvErrorCategory::Transient,
            Self::ProtocolViolation => SkvErrorCategory::Protocol,
        }
    }

    /// Returns true if callers should retry the operation.
    pub const fn is_retryable(self) -> bool {
        self.category().is_retryable()
    }

    /// Converts a numeric code into a typed error.
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::WrongArity),
            2 => Some(Self::UnknownCommand),
            3 => Some(Self::NotInteger),
            4 => Some(Self::Syntax),
            5 => Some(Self::InvalidExpireTime),
            10 => Some(Self::ShardUnavailable),
            11 => Some(Self::LogFailure),
            12 => Some(Self::InternalError),
            20 => Some(Self::Busy),
            22 => Some(Self::Interrupted),
            31 => Some(Self::ProtocolViolation),
            _ => None,
        }
    }

    /// Renders the client-visible error line for a command.
    ///
    /// `command` is the lowercase command name; only the arity and
    /// unknown-command messages embed it.
    pub fn message(self, command: &str) -> String {
        match self {
            Self::WrongArity => {
                format!("ERR wrong number of arguments for '{}' command", command)
            }
            Self::UnknownCommand => format!("ERR unknown command '{}'", command),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for SkvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::WrongArity => "ERR wrong number of arguments",
            Self::UnknownCommand => "ERR unknown command",
            Self::NotInteger => "ERR value is not an integer or out of range",
            Self::Syntax => "ERR syntax error",
            Self::InvalidExpireTime => "ERR invalid expire time",
            Self::ShardUnavailable => "ERR shard unavailable",
            Self::LogFailure => "ERR durability log append failed",
            Self::InternalError => "ERR internal error",
            Self::Busy => "BUSY server is busy, retry later",
            Self::Interrupted => "ERR interrupted by shutdown",
            Self::ProtocolViolation => "ERR Protocol error",
        };
        write!(f, "{}", label)
    }
}

impl std::error::Error for SkvError {}

#[cfg(test)]
mod tests {
    use super::{SkvError, SkvErrorCategory};

    #[test]
    fn maps_error_categories() {
        assert_eq!(SkvError::WrongArity.category(), SkvErrorCategory::Client);
        assert_eq!(SkvError::ShardUnavailable.category(), SkvErrorCategory::Server);
        assert_eq!(SkvError::Busy.category(), SkvErrorCategory::Transient);
        assert_eq!(SkvError::ProtocolViolation.category(), SkvErrorCategory::Protocol);
    }

    #[test]
    fn retryable_only_for_transient() {
        assert!(SkvError::Busy.is_retryable());
        assert!(!SkvError::WrongArity.is_retryable());
    }

    #[test]
    fn converts_from_code() {
        assert_eq!(SkvError::from_code(1), Some(SkvError::WrongArity));
        assert_eq!(SkvError::from_code(99), None);
    }

    #[test]
    fn renders_arity_message_with_command_name() {
        assert_eq!(
            SkvError::WrongArity.message("del"),
            "ERR wrong number of arguments for 'del' command"
        );
        assert_eq!(SkvError::Syntax.message("set"), "ERR syntax error");
    }
}
