#![deny(unsafe_code)]

//! Wire-level frame types for the tether channel protocol.
//!
//! A channel carries discrete frames between two peers: commands, their
//! progress/result replies, uncorrelated events, and a small set of control
//! frames (hello, redirect, close). Command arguments and reply data are
//! opaque byte arrays at this layer; their interpretation belongs to the
//! service named in the frame.
//!
//! Frames are encoded with a one-byte kind tag followed by little-endian
//! integers and u32-length-prefixed strings and byte arrays. The byte-stream
//! length prefix that delimits frames on the wire is *not* part of this
//! encoding; that belongs to the framing layer.

// ============================================================================
// Token
// ============================================================================

/// Token correlating an issued command with its progress/result replies.
///
/// Tokens are unique within the issuing channel and monotonically
/// increasing. A token is never reused while the command it identifies is
/// still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Token(pub u64);

impl Token {
    /// Create a new token.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for Token {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<Token> for u64 {
    fn from(id: Token) -> Self {
        id.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cmd:{}", self.0)
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Invoke a named command on a remote service. `args` is opaque.
    Command {
        token: Token,
        service: String,
        name: String,
        args: Vec<u8>,
    },
    /// Intermediate reply for a pending command. Repeatable, non-terminal.
    Progress { token: Token, data: Vec<u8> },
    /// Terminal reply for a pending command. Command-level failures are
    /// encoded inside `data` by the service; the frame itself is a success.
    Result { token: Token, data: Vec<u8> },
    /// Uncorrelated service event broadcast.
    Event {
        service: String,
        name: String,
        data: Vec<u8>,
    },
    /// Handshake: the list of service names the sender exposes locally.
    /// Sent once after connecting, and again by the new remote endpoint
    /// after a redirect.
    Hello { services: Vec<String> },
    /// Ask the remote endpoint (acting as a proxy/locator) to re-point this
    /// channel at another peer. Success is observed as the new endpoint's
    /// hello; failure as a close frame carrying the cause.
    Redirect { peer_id: String },
    /// Close the channel. `cause` is `None` for a graceful close and an
    /// error description otherwise.
    Close { cause: Option<String> },
}

const KIND_COMMAND: u8 = 1;
const KIND_PROGRESS: u8 = 2;
const KIND_RESULT: u8 = 3;
const KIND_EVENT: u8 = 4;
const KIND_HELLO: u8 = 5;
const KIND_REDIRECT: u8 = 6;
const KIND_CLOSE: u8 = 7;

impl Frame {
    /// Encode this frame into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        match self {
            Frame::Command {
                token,
                service,
                name,
                args,
            } => {
                out.push(KIND_COMMAND);
                put_u64(out, token.raw());
                put_str(out, service)?;
                put_str(out, name)?;
                put_bytes(out, args)?;
            }
            Frame::Progress { token, data } => {
                out.push(KIND_PROGRESS);
                put_u64(out, token.raw());
                put_bytes(out, data)?;
            }
            Frame::Result { token, data } => {
                out.push(KIND_RESULT);
                put_u64(out, token.raw());
                put_bytes(out, data)?;
            }
            Frame::Event {
                service,
                name,
                data,
            } => {
                out.push(KIND_EVENT);
                put_str(out, service)?;
                put_str(out, name)?;
                put_bytes(out, data)?;
            }
            Frame::Hello { services } => {
                out.push(KIND_HELLO);
                put_u32(out, len_u32(services.len())?);
                for s in services {
                    put_str(out, s)?;
                }
            }
            Frame::Redirect { peer_id } => {
                out.push(KIND_REDIRECT);
                put_str(out, peer_id)?;
            }
            Frame::Close { cause } => {
                out.push(KIND_CLOSE);
                match cause {
                    None => out.push(0),
                    Some(c) => {
                        out.push(1);
                        put_str(out, c)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Decode a frame from `buf`. The buffer must contain exactly one frame.
    pub fn decode(buf: &[u8]) -> Result<Frame, WireError> {
        let mut cur = Cursor { buf, pos: 0 };
        let kind = cur.take_u8()?;
        let frame = match kind {
            KIND_COMMAND => Frame::Command {
                token: Token::new(cur.take_u64()?),
                service: cur.take_str()?,
                name: cur.take_str()?,
                args: cur.take_bytes()?,
            },
            KIND_PROGRESS => Frame::Progress {
                token: Token::new(cur.take_u64()?),
                data: cur.take_bytes()?,
            },
            KIND_RESULT => Frame::Result {
                token: Token::new(cur.take_u64()?),
                data: cur.take_bytes()?,
            },
            KIND_EVENT => Frame::Event {
                service: cur.take_str()?,
                name: cur.take_str()?,
                data: cur.take_bytes()?,
            },
            KIND_HELLO => {
                let count = cur.take_u32()? as usize;
                let mut services = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    services.push(cur.take_str()?);
                }
                Frame::Hello { services }
            }
            KIND_REDIRECT => Frame::Redirect {
                peer_id: cur.take_str()?,
            },
            KIND_CLOSE => {
                let cause = match cur.take_u8()? {
                    0 => None,
                    _ => Some(cur.take_str()?),
                };
                Frame::Close { cause }
            }
            other => return Err(WireError::UnknownKind(other)),
        };
        let trailing = cur.remaining();
        if trailing != 0 {
            return Err(WireError::TrailingBytes(trailing));
        }
        Ok(frame)
    }

    /// The token this frame correlates to, if any.
    pub fn token(&self) -> Option<Token> {
        match self {
            Frame::Command { token, .. }
            | Frame::Progress { token, .. }
            | Frame::Result { token, .. } => Some(*token),
            _ => None,
        }
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

fn len_u32(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::TooLarge)
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), WireError> {
    put_u32(out, len_u32(bytes.len())?);
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), WireError> {
    put_bytes(out, s.as_bytes())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Truncated)?;
        if end > self.buf.len() {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn take_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.take_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn take_str(&mut self) -> Result<String, WireError> {
        let bytes = self.take_bytes()?;
        String::from_utf8(bytes).map_err(|_| WireError::BadUtf8)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error decoding or encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The buffer ended before the frame did.
    Truncated,
    /// Unknown frame kind tag.
    UnknownKind(u8),
    /// A string field was not valid UTF-8.
    BadUtf8,
    /// Bytes left over after a complete frame.
    TrailingBytes(usize),
    /// A field exceeded the u32 length prefix.
    TooLarge,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated => write!(f, "truncated frame"),
            WireError::UnknownKind(k) => write!(f, "unknown frame kind: {k}"),
            WireError::BadUtf8 => write!(f, "string field is not valid UTF-8"),
            WireError::TrailingBytes(n) => write!(f, "{n} trailing bytes after frame"),
            WireError::TooLarge => write!(f, "field too large for u32 length prefix"),
        }
    }
}

impl std::error::Error for WireError {}
