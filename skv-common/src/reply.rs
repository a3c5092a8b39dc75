//! Replies produced by shards and command workers, before wire encoding.

use bytes::Bytes;

use crate::error::SkvError;

/// A protocol-agnostic reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Status line such as `OK` or `PONG`.
    Simple(String),
    /// Error line, already rendered for the client.
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    /// Missing value.
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    /// Builds an error reply for `command` (lowercase name).
    pub fn error(err: SkvError, command: &str) -> Self {
        Reply::Error(err.message(command))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Returns the integer payload, if this is an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(value) => Some(*value),
            _ => None,
        }
    }
}
