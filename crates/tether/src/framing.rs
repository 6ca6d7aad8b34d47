//! Length-prefixed framing for async byte streams.
//!
//! Frames are prefixed by a 4-byte little-endian frame length. This module
//! is generic over the transport type: anything that implements `AsyncRead`
//! or `AsyncWrite` works, including TCP sockets, Unix domain sockets, and
//! the in-memory duplex links used in tests.
//!
//! The reader and writer are separate types because a channel's driver task
//! owns the inbound direction while a dedicated writer task drains the
//! outbound queue.

use std::io;

use tether_wire::Frame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const FRAME_LEN_PREFIX_SIZE: usize = 4;
const RECV_BUF_COMPACT_THRESHOLD: usize = 64 * 1024;

/// Upper bound on a single frame body. Payloads are opaque byte arrays, so
/// this only guards against a corrupt or hostile length prefix.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode `frame` with its length prefix, ready to write to the wire.
pub fn encode_frame(frame: &Frame) -> io::Result<Vec<u8>> {
    let mut out = vec![0u8; FRAME_LEN_PREFIX_SIZE];
    frame
        .encode(&mut out)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let body_len = out.len() - FRAME_LEN_PREFIX_SIZE;
    if body_len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame exceeds maximum length",
        ));
    }
    let prefix = (body_len as u32).to_le_bytes();
    out[..FRAME_LEN_PREFIX_SIZE].copy_from_slice(&prefix);
    Ok(out)
}

fn compact_recv_buffer(buf: &mut Vec<u8>, unread_start: &mut usize) {
    if *unread_start == buf.len() {
        buf.clear();
        *unread_start = 0;
        return;
    }

    if *unread_start >= RECV_BUF_COMPACT_THRESHOLD && *unread_start >= buf.len() / 2 {
        buf.drain(..*unread_start);
        *unread_start = 0;
    }
}

/// Reads length-prefixed frames from an async byte stream.
pub struct FrameReader<R> {
    stream: R,
    buf: Vec<u8>,
    unread_start: usize,
}

impl<R> FrameReader<R> {
    /// Create a frame reader over `stream`.
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            unread_start: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream. An end of stream in the
    /// middle of a frame is an error.
    pub async fn recv(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.try_decode_buffered()? {
                return Ok(Some(frame));
            }

            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                let trailing = self.buf.len().saturating_sub(self.unread_start);
                if trailing != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("eof with {trailing} trailing bytes and no complete frame"),
                    ));
                }
                return Ok(None);
            }
            compact_recv_buffer(&mut self.buf, &mut self.unread_start);
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    fn try_decode_buffered(&mut self) -> io::Result<Option<Frame>> {
        let unread = &self.buf[self.unread_start..];
        if unread.len() < FRAME_LEN_PREFIX_SIZE {
            return Ok(None);
        }

        let frame_len = u32::from_le_bytes([unread[0], unread[1], unread[2], unread[3]]) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {frame_len} exceeds maximum"),
            ));
        }
        let frame_end = self.unread_start + FRAME_LEN_PREFIX_SIZE + frame_len;
        if frame_end > self.buf.len() {
            return Ok(None);
        }

        let frame_start = self.unread_start + FRAME_LEN_PREFIX_SIZE;
        let decoded = Frame::decode(&self.buf[frame_start..frame_end]);

        // Advance past the frame even on a decode error so the error does
        // not repeat forever on the same bytes.
        self.unread_start = frame_end;
        compact_recv_buffer(&mut self.buf, &mut self.unread_start);

        match decoded {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        }
    }
}

/// Writes length-prefixed frames to an async byte stream.
pub struct FrameWriter<W> {
    stream: W,
}

impl<W> FrameWriter<W> {
    /// Create a frame writer over `stream`.
    pub fn new(stream: W) -> Self {
        Self { stream }
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Send one frame, flushing the stream. Returns the number of bytes
    /// written, including the length prefix.
    pub async fn send(&mut self, frame: &Frame) -> io::Result<usize> {
        let buf = encode_frame(frame)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(buf.len())
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
