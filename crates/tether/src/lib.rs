//! Asynchronous multiplexed peer communication.
//!
//! A [`Channel`] carries concurrent commands, results, progress reports,
//! and events between two peers over any ordered byte stream, with
//! token-based correlation, signed congestion feedback, and multi-hop
//! establishment through proxies via a [`Redirector`].
//!
//! All channel callbacks fire on a single dedicated [`Dispatcher`] thread.
//! Ordinary threads bridge into that world with [`BlockingTask`], and
//! remote data is mirrored locally through lazily validated [`DataCache`]s.

#![deny(unsafe_code)]

pub mod cache;
pub mod channel;
pub mod congestion;
pub mod dispatch;
pub mod framing;
pub mod peer;
pub mod redirect;
pub mod task;
pub mod transport;

mod errors;

pub use cache::{CacheUpdate, DataCache};
pub use channel::{
    Channel, ChannelEvents, ChannelState, CommandHandler, CommandOutcome, ListenerId,
    LOCATOR_SERVICE,
};
pub use dispatch::{Dispatcher, DispatcherHandle};
pub use errors::{ChannelError, TaskError};
pub use peer::Peer;
pub use redirect::{hop_route, HopSequence, Redirector};
pub use task::{BlockingTask, Settle};
pub use transport::{memory_pair, Connector, TcpConnector};

pub use tether_wire::{Frame, Token, WireError};

#[cfg(test)]
mod tests;
