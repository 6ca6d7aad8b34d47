//! Multi-hop channel establishment through proxies.
//!
//! Only the first hop of a route is dialed; every later hop is reached by
//! asking the already-open channel's current endpoint to redirect. The
//! route is precomputed up front from the target's configured proxy chain,
//! optionally prefixed by local value-add peers (protocol adapters the
//! channel should pass through first).

use crate::channel::Channel;
use crate::dispatch::DispatcherHandle;
use crate::errors::ChannelError;
use crate::peer::Peer;
use crate::transport::Connector;

/// Compute the full hop route to `target`: value-add peers first, then the
/// target's configured proxy chain, then the target itself. Always at
/// least one hop.
pub fn hop_route(target: &Peer, value_adds: &[Peer]) -> Vec<Peer> {
    let mut hops = Vec::with_capacity(value_adds.len() + 1);
    hops.extend_from_slice(value_adds);
    hops.extend(target.proxy_chain());
    hops.push(target.clone());
    hops
}

/// A precomputed route with a cursor over the hop being established.
pub struct HopSequence {
    hops: Vec<Peer>,
    next: usize,
}

impl HopSequence {
    pub fn new(target: &Peer, value_adds: &[Peer]) -> Self {
        Self {
            hops: hop_route(target, value_adds),
            next: 0,
        }
    }

    /// Total hops in the route, the target included.
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Hops not yet confirmed.
    pub fn remaining(&self) -> usize {
        self.hops.len() - self.next
    }

    /// The hop currently being established, if any.
    pub fn current(&self) -> Option<&Peer> {
        self.hops.get(self.next)
    }

    /// Mark the current hop as established and advance to the next.
    pub fn confirm(&mut self) {
        if self.next < self.hops.len() {
            self.next += 1;
        }
    }

    /// Rewind to the first hop, for retrying the route from scratch.
    pub fn restart(&mut self) {
        self.next = 0;
    }
}

/// Opens channels across proxy routes.
pub struct Redirector<C> {
    connector: C,
}

impl<C: Connector> Redirector<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    /// Open a channel to `target`, hopping through `value_adds` and the
    /// target's proxy chain in order. The first failing hop aborts the
    /// route: later hops are unreachable without it.
    pub async fn connect(
        &self,
        dispatcher: &DispatcherHandle,
        local_peer: Peer,
        target: &Peer,
        value_adds: &[Peer],
    ) -> Result<Channel, ChannelError> {
        let mut hops = HopSequence::new(target, value_adds);

        // hop_route always yields at least the target itself.
        let first = match hops.current() {
            Some(peer) => peer.clone(),
            None => return Err(ChannelError::Redirect("empty hop route".into())),
        };
        tracing::debug!(target = %target, hops = hops.len(), "opening channel");

        let stream = self
            .connector
            .connect(&first)
            .await
            .map_err(ChannelError::io)?;
        let channel = Channel::attach(dispatcher, stream, local_peer, first.id());
        channel.start();
        channel.wait_open().await?;
        hops.confirm();

        loop {
            let Some(hop_id) = hops.current().map(|p| p.id().to_string()) else {
                break;
            };
            let seen = channel.open_count();
            channel.redirect(&hop_id);
            channel.wait_open_since(seen).await?;
            hops.confirm();
        }
        Ok(channel)
    }
}
