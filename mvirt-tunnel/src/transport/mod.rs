//! Transport capability set
//!
//! A transport knows how to move opaque byte buffers between tunnel
//! endpoints; it knows nothing about tunnel peers. Every transport has the
//! readable/writable flags and the routing-conflict check from [`Transport`],
//! and implements one client shape ([`Dial`]) and one server shape
//! ([`DatagramListen`] or [`StreamListen`]).
//!
//! All operations block; the bridge runs them on dedicated threads.

pub mod cat;
pub mod dns;
pub mod icmp;
pub mod udp;
pub mod unix;

use std::fmt;
use std::net::IpAddr;

use tracing::info;

use crate::config::{Role, TransportConfig};
use crate::error::{Result, TunnelError};
use crate::tun::PacketDevice;

pub use cat::CatTransport;
pub use dns::DnsTransport;
pub use icmp::IcmpTransport;
pub use udp::UdpTransport;
pub use unix::UnixTransport;

/// Transport kinds selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    Unix,
    Icmp,
    Dns,
    Cat,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Udp => "udp",
            TransportKind::Unix => "unix",
            TransportKind::Icmp => "icmp",
            TransportKind::Dns => "dns",
            TransportKind::Cat => "cat",
        };
        f.write_str(name)
    }
}

/// Capabilities shared by every transport.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn is_readable(&self) -> bool {
        true
    }

    fn is_writable(&self) -> bool {
        true
    }

    /// IP address this transport dials or listens on, if it uses one.
    fn endpoint_ip(&self) -> Option<IpAddr>;

    /// Largest payload a single write can carry, if the transport imposes
    /// a limit below the interface MTU.
    fn max_payload(&self) -> Option<usize> {
        None
    }

    /// Is the transport's own endpoint routed through the tunnel interface?
    fn has_routing_conflict(&self, device: &dyn PacketDevice) -> Result<bool> {
        match self.endpoint_ip() {
            Some(ip) if !ip.is_unspecified() => device
                .is_routed_through(ip)
                .map_err(|e| TunnelError::io("routing table query", e)),
            _ => Ok(false),
        }
    }
}

/// A connection to a single peer.
pub trait Connection: Send + Sync + 'static {
    /// Receive one payload. Returns 0 for an empty payload.
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send one payload.
    fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Human-readable peer description for diagnostics.
    fn peer(&self) -> String;
}

/// Server side of a connectionless transport: every read carries the
/// sender's address, every write names the receiver.
pub trait PacketSocket: Send + Sync + 'static {
    type Addr: Clone + Send + Sync + fmt::Display + 'static;

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Self::Addr)>;

    fn send_to(&self, buf: &[u8], addr: &Self::Addr) -> Result<usize>;
}

/// Server side of a connection-oriented transport.
pub trait Acceptor: Send + 'static {
    type Conn: Connection;

    fn accept(&self) -> Result<Self::Conn>;
}

/// Client shape: every transport can dial its configured peer.
pub trait Dial: Transport {
    type Conn: Connection;

    fn dial(&self) -> Result<Self::Conn>;
}

/// Connectionless server shape.
pub trait DatagramListen: Transport {
    type Socket: PacketSocket;

    fn listen(&self) -> Result<Self::Socket>;
}

/// Connection-oriented server shape.
pub trait StreamListen: Transport {
    type Acceptor: Acceptor;

    fn listen(&self) -> Result<Self::Acceptor>;
}

/// The closed set of transports, built from configuration.
pub enum AnyTransport {
    Udp(UdpTransport),
    Unix(UnixTransport),
    Icmp(IcmpTransport),
    Dns(DnsTransport),
    Cat(CatTransport),
}

impl AnyTransport {
    /// Build the configured transport for the given role.
    pub fn from_config(config: &TransportConfig, role: Role) -> Result<Self> {
        let transport = match config {
            TransportConfig::Udp { address } => {
                AnyTransport::Udp(UdpTransport::new(crate::config::resolve(address)?))
            }
            TransportConfig::Unix { path } => AnyTransport::Unix(UnixTransport::new(path)),
            TransportConfig::Icmp { address } => {
                AnyTransport::Icmp(IcmpTransport::new(crate::config::resolve_ipv4(address)?))
            }
            TransportConfig::Dns {
                server,
                listen,
                root_domain,
            } => {
                let endpoint = match role {
                    Role::Client => {
                        let server = server.as_deref().ok_or_else(|| {
                            TunnelError::Config("dns client needs transport.server".into())
                        })?;
                        crate::config::resolve(server)?
                    }
                    Role::Server => crate::config::resolve(listen)?,
                };
                AnyTransport::Dns(DnsTransport::new(endpoint, root_domain)?)
            }
            TransportConfig::Cat {
                local_name,
                remote_name,
            } => AnyTransport::Cat(CatTransport::new(local_name, remote_name)),
        };
        info!(kind = %transport.as_transport().kind(), ?role, "Transport configured");
        Ok(transport)
    }

    pub fn as_transport(&self) -> &dyn Transport {
        match self {
            AnyTransport::Udp(t) => t,
            AnyTransport::Unix(t) => t,
            AnyTransport::Icmp(t) => t,
            AnyTransport::Dns(t) => t,
            AnyTransport::Cat(t) => t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeDevice;
    use std::net::SocketAddr;

    #[test]
    fn test_routing_conflict_uses_endpoint() {
        let device = FakeDevice::new("mvtun0");
        let endpoint: SocketAddr = "192.0.2.1:1917".parse().unwrap();
        let transport = UdpTransport::new(endpoint);

        assert!(!transport.has_routing_conflict(&device).unwrap());
        device.route_through(endpoint.ip());
        assert!(transport.has_routing_conflict(&device).unwrap());
    }

    #[test]
    fn test_unspecified_endpoint_never_conflicts() {
        let device = FakeDevice::new("mvtun0");
        device.route_through("0.0.0.0".parse().unwrap());
        let transport = UdpTransport::new("0.0.0.0:1917".parse().unwrap());
        assert!(!transport.has_routing_conflict(&device).unwrap());
    }

    #[test]
    fn test_unix_never_conflicts() {
        let device = FakeDevice::new("mvtun0");
        let transport = UnixTransport::new("/tmp/mvirt-tunnel-test.sock");
        assert_eq!(transport.endpoint_ip(), None);
        assert!(!transport.has_routing_conflict(&device).unwrap());
    }

    #[test]
    fn test_from_config_dns_client_requires_server() {
        let config = TransportConfig::Dns {
            server: None,
            listen: "0.0.0.0:53".into(),
            root_domain: "t.example".into(),
        };
        let err = AnyTransport::from_config(&config, Role::Client).err().unwrap();
        assert!(matches!(err, TunnelError::Config(_)));

        let server = AnyTransport::from_config(&config, Role::Server).unwrap();
        assert_eq!(server.as_transport().kind(), TransportKind::Dns);
    }

    #[test]
    fn test_from_config_kinds() {
        let udp = TransportConfig::Udp {
            address: "127.0.0.1:1917".into(),
        };
        let transport = AnyTransport::from_config(&udp, Role::Client).unwrap();
        assert_eq!(transport.as_transport().kind(), TransportKind::Udp);
        assert_eq!(
            transport.as_transport().endpoint_ip(),
            Some("127.0.0.1".parse().unwrap())
        );

        let icmp = TransportConfig::Icmp {
            address: "192.0.2.1".into(),
        };
        let transport = AnyTransport::from_config(&icmp, Role::Server).unwrap();
        assert_eq!(transport.as_transport().kind(), TransportKind::Icmp);
    }
}
