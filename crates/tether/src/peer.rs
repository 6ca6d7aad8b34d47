//! Peer descriptors.
//!
//! A peer is an addressable communication endpoint identified by a string
//! id and described by a flat string attribute map. The attribute map is
//! how peer configuration travels: transport address, and the ordered proxy
//! chain a channel must hop through to reach the peer.

use std::collections::HashMap;

/// An addressable communication endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    id: String,
    attributes: HashMap<String, String>,
}

impl Peer {
    /// Transport host name or address.
    pub const ATTR_HOST: &'static str = "Host";
    /// Transport port.
    pub const ATTR_PORT: &'static str = "Port";
    /// Comma-separated ordered list of proxy peer ids to hop through
    /// before reaching this peer. Absent or empty means a direct route.
    pub const ATTR_PROXIES: &'static str = "Proxies";

    /// Create a peer with no attributes.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: HashMap::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    /// Decode the configured proxy chain, in hop order. Proxy entries are
    /// id-only peers: every hop after the first is reached by redirecting
    /// an already-open channel, not by dialing an address.
    pub fn proxy_chain(&self) -> Vec<Peer> {
        match self.attribute(Self::ATTR_PROXIES) {
            None => Vec::new(),
            Some(encoded) => encoded
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(Peer::new)
                .collect(),
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}
