//! Transport connectors.
//!
//! The channel layer consumes any ordered, reliable duplex byte stream. A
//! [`Connector`] knows how to dial a [`Peer`]'s address attributes and hand
//! back such a stream; the framing layer does the rest.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

use crate::peer::Peer;

/// A factory that dials new byte-stream connections on demand.
pub trait Connector: Send + Sync + 'static {
    /// The raw stream type (e.g., `TcpStream`).
    type Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Establish a new connection to `peer`.
    fn connect(&self, peer: &Peer) -> impl Future<Output = io::Result<Self::Transport>> + Send;
}

/// Connects over TCP using the peer's `Host` and `Port` attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Transport = TcpStream;

    fn connect(&self, peer: &Peer) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let addr = tcp_addr(peer);
        async move {
            let (host, port) = addr?;
            TcpStream::connect((host.as_str(), port)).await
        }
    }
}

fn tcp_addr(peer: &Peer) -> io::Result<(String, u16)> {
    let host = peer
        .attribute(Peer::ATTR_HOST)
        .ok_or_else(|| bad_peer(peer, "missing Host attribute"))?;
    let port = peer
        .attribute(Peer::ATTR_PORT)
        .ok_or_else(|| bad_peer(peer, "missing Port attribute"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| bad_peer(peer, "Port attribute is not a valid port"))?;
    Ok((host.to_string(), port))
}

fn bad_peer(peer: &Peer, msg: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("peer {}: {msg}", peer.id()),
    )
}

/// An in-memory duplex transport pair, for tests and local loopback.
pub fn memory_pair() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(64 * 1024)
}
