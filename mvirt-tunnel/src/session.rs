//! Session table for server-side demultiplexing.
//!
//! Maps the tunnel-internal address of a peer host to whatever currently
//! represents it on the transport: a return address for datagram transports,
//! a connection handle for stream transports. Entries are written by the
//! transport-receiving loop(s) and read by the interface-receiving loop.
//!
//! Entries never expire; the last writer wins.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock};

/// Tunnel address → transport peer map.
pub struct SessionTable<P> {
    entries: RwLock<HashMap<IpAddr, P>>,
}

impl<P: Clone> SessionTable<P> {
    /// Create a new empty table.
    pub fn new() -> Self {
        SessionTable {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or refresh) the peer for a tunnel address.
    ///
    /// Returns the previous peer if one existed.
    pub fn register(&self, tunnel_addr: IpAddr, peer: P) -> Option<P> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tunnel_addr, peer)
    }

    /// Find the peer currently representing a tunnel address.
    pub fn lookup(&self, tunnel_addr: &IpAddr) -> Option<P> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tunnel_addr)
            .cloned()
    }

    /// Number of known tunnel addresses.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: Clone> Default for SessionTable<P> {
    fn default() -> Self {
        Self::new()
    }
}
