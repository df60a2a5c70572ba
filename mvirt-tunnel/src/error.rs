//! Tunnel error taxonomy.
//!
//! Transient conditions (unparseable buffers, chatter, session misses,
//! unknown service messages) never surface as errors; they are logged and
//! the loop continues. Everything represented here is fatal: either at
//! startup, or to the direction that hit it.

use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Interface error: {0}")]
    Interface(String),

    #[error(
        "Endpoint {endpoint} is routed through {interface}; tunneled traffic would loop. \
         Review the routing table or set skip_routing_check = true"
    )]
    RoutingConflict { endpoint: IpAddr, interface: String },

    #[error("Payload too long for transport: {len} > {mtu} bytes")]
    PayloadTooLong { len: usize, mtu: usize },

    #[error("Unexpected ICMP message type {0}")]
    UnexpectedIcmp(u8),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("{0} closed")]
    Closed(&'static str),
}

impl TunnelError {
    /// Wrap an I/O error with the operation that produced it.
    pub fn io(context: &'static str, source: io::Error) -> Self {
        TunnelError::Io { context, source }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display_includes_context() {
        let err = TunnelError::io(
            "transport read",
            io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        );
        assert_eq!(err.to_string(), "transport read: reset");
    }

    #[test]
    fn test_payload_too_long_display() {
        let err = TunnelError::PayloadTooLong { len: 140, mtu: 139 };
        assert_eq!(
            err.to_string(),
            "Payload too long for transport: 140 > 139 bytes"
        );
    }
}
