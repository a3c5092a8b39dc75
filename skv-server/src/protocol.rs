//! # RESP2 Protocol
//!
//! Parse RESP2 arrays of bulk strings (and inline commands) from a streaming
//! TCP byte feed, and encode replies back to RESP2.
//!
//! ## Design Principles
//!
//! 1. **State Machine Pattern**: Explicit parser states avoid backtracking and
//!    keep control flow predictable across partial reads.
//! 2. **Streaming Friendly**: `feed` buffers whatever it cannot complete yet
//!    and returns only whole commands.
//! 3. **Bounded Frames**: Array and bulk lengths are capped so a hostile
//!    length prefix cannot force a huge allocation.
//! 4. **Fail Fast**: Malformed frames return a protocol error immediately.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use skv_common::{Command, Reply};

/// Largest accepted bulk string.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest accepted argument count.
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Largest accepted inline command line.
pub const MAX_INLINE_LEN: usize = 64 * 1024;

/// Largest accepted `*N` / `$N` header line, CRLF excluded.
pub const MAX_HEADER_LEN: usize = 64;

/// RESP parser errors; the connection is closed after one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    /// The input is not valid RESP2 for the supported subset.
    Protocol,
    /// A length prefix exceeds the configured limits.
    TooLarge,
}

impl fmt::Display for RespError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol => write!(f, "invalid RESP frame"),
            Self::TooLarge => write!(f, "RESP frame exceeds size limits"),
        }
    }
}

impl std::error::Error for RespError {}

/// Streaming RESP2 parser, one per connection.
#[derive(Debug)]
pub struct RespParser {
    buffer: BytesMut,
    state: ParseState,
    args: Vec<Vec<u8>>,
    remaining: usize,
    bulk_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    ArrayLen,
    BulkLen,
    BulkData,
}

impl RespParser {
    /// Creates a new parser in the initial state.
    pub fn new() -> Self {
        RespParser {
            buffer: BytesMut::new(),
            state: ParseState::ArrayLen,
            args: Vec::new(),
            remaining: 0,
            bulk_len: 0,
        }
    }

    /// Appends `bytes` and returns every command completed so far.
    ///
    /// Incomplete trailing input stays buffered for the next call. Empty
    /// frames (`*0`, blank inline lines) are skipped.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Command>, RespError> {
        self.buffer.extend_from_slice(bytes);
        let mut commands = Vec::new();
        while let Some(parts) = self.parse_frame()? {
            if let Some(command) = Command::from_parts(parts) {
                commands.push(command);
            }
        }
        Ok(commands)
    }

    /// Bytes received but not yet part of a complete command.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn parse_frame(&mut self) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        loop {
            match self.state {
                ParseState::ArrayLen => {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    if self.buffer[0] != b'*' {
                        return self.parse_inline();
                    }
                    let line = match read_header(&mut self.buffer)? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    let count = parse_usize(&line[1..])?;
                    if count > MAX_ARRAY_LEN {
                        return Err(RespError::TooLarge);
                    }
                    self.args.clear();
                    self.remaining = count;
                    if self.remaining == 0 {
                        return Ok(Some(Vec::new()));
                    }
                    self.state = ParseState::BulkLen;
                }
                ParseState::BulkLen => {
                    let line = match read_header(&mut self.buffer)? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    if line.first() != Some(&b'$') {
                        return Err(RespError::Protocol);
                    }
                    let len = parse_usize(&line[1..])?;
                    if len > MAX_BULK_LEN {
                        return Err(RespError::TooLarge);
                    }
                    self.bulk_len = len;
                    self.state = ParseState::BulkData;
                }
                ParseState::BulkData => {
                    if self.buffer.len() < self.bulk_len + 2 {
                        return Ok(None);
                    }
                    let data = self.buffer.split_to(self.bulk_len).to_vec();
                    if self.buffer.get_u8() != b'\r' || self.buffer.get_u8() != b'\n' {
                        return Err(RespError::Protocol);
                    }
                    self.args.push(data);
                    self.remaining -= 1;
                    if self.remaining == 0 {
                        self.state = ParseState::ArrayLen;
                        return Ok(Some(std::mem::take(&mut self.args)));
                    }
                    self.state = ParseState::BulkLen;
                }
            }
        }
    }

    // Inline commands: one whitespace-separated line, as typed into telnet.
    fn parse_inline(&mut self) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        let newline = match self.buffer.iter().position(|&b| b == b'\n') {
            Some(idx) => idx,
            None if self.buffer.len() > MAX_INLINE_LEN => return Err(RespError::TooLarge),
            None => return Ok(None),
        };
        let mut line = self.buffer.split_to(newline + 1);
        line.truncate(newline);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        let parts = line[..]
            .split(|b: &u8| b.is_ascii_whitespace())
            .filter(|part| !part.is_empty())
            .map(<[u8]>::to_vec)
            .collect();
        Ok(Some(parts))
    }
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

// Splits off one CRLF-terminated header line. Only the first
// `MAX_HEADER_LEN + 2` bytes are searched, so an unterminated header is
// rejected instead of buffered without bound.
fn read_header(buf: &mut BytesMut) -> Result<Option<BytesMut>, RespError> {
    let window = buf.len().min(MAX_HEADER_LEN + 2);
    let mut idx = 1;
    while idx < window {
        if buf[idx] == b'\n' && buf[idx - 1] == b'\r' {
            let line = buf.split_to(idx - 1);
            buf.advance(2);
            return Ok(Some(line));
        }
        idx += 1;
    }
    if buf.len() >= MAX_HEADER_LEN + 2 {
        return Err(RespError::TooLarge);
    }
    Ok(None)
}

fn parse_usize(data: &[u8]) -> Result<usize, RespError> {
    if data.is_empty() {
        return Err(RespError::Protocol);
    }
    let mut value: usize = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(RespError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    Ok(value)
}

/// Appends the RESP2 encoding of `reply` to `out`.
pub fn encode_reply(reply: &Reply, out: &mut BytesMut) {
    match reply {
        Reply::Simple(text) => {
            out.put_u8(b'+');
            out.put_slice(text.as_bytes());
            out.put_slice(b"\r\n");
        }
        Reply::Error(text) => {
            out.put_u8(b'-');
            out.put_slice(text.as_bytes());
            out.put_slice(b"\r\n");
        }
        Reply::Integer(value) => {
            out.put_u8(b':');
            out.put_slice(value.to_string().as_bytes());
            out.put_slice(b"\r\n");
        }
        Reply::Bulk(data) => {
            out.put_u8(b'$');
            out.put_slice(data.len().to_string().as_bytes());
            out.put_slice(b"\r\n");
            out.put_slice(data);
            out.put_slice(b"\r\n");
        }
        Reply::Nil => out.put_slice(b"$-1\r\n"),
        Reply::Array(items) => {
            out.put_u8(b'*');
            out.put_slice(items.len().to_string().as_bytes());
            out.put_slice(b"\r\n");
            for item in items {
                encode_reply(item, out);
            }
        }
    }
}

/// Encodes a single reply into a standalone payload.
pub fn encode(reply: &Reply) -> Bytes {
    let mut out = BytesMut::with_capacity(64);
    encode_reply(reply, &mut out);
    out.freeze()
}

/// Builds the push frame delivered for a watch: `[<CMD>.WATCH, fingerprint, reply]`.
pub fn watch_push(command_name: &str, fingerprint: u64, reply: Reply) -> Reply {
    Reply::Array(vec![
        Reply::Bulk(Bytes::from(format!("{command_name}.WATCH"))),
        Reply::Bulk(Bytes::from(fingerprint.to_string())),
        reply,
    ])
}
