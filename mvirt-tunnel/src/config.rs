//! Tunnel configuration file
//!
//! ```toml
//! drop_chatter = true
//! send_hello = true
//!
//! [tun]
//! cidr = "10.10.0.2/24"
//!
//! [transport]
//! kind = "udp"
//! address = "192.0.2.1:1917"
//! ```

use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use crate::error::{Result, TunnelError};
use crate::transport::dns::codec;

/// Which end of the tunnel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Suppress broadcast/multicast forwarding.
    #[serde(default = "default_true")]
    pub drop_chatter: bool,

    /// Keep going when the transport endpoint is routed through the tunnel.
    #[serde(default)]
    pub skip_routing_check: bool,

    /// Client: send a hello right after dialing.
    #[serde(default)]
    pub send_hello: bool,

    pub tun: TunConfig,

    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunConfig {
    /// Interface name prefix; the interface becomes `<prefix><N>`.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Tunnel address and netmask of this host.
    pub cidr: Ipv4Net,

    /// Client: route all IPv4 traffic through the tunnel.
    #[serde(default)]
    pub default_route: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Udp {
        /// `host:port` to dial (client) or bind (server).
        address: String,
    },
    Unix {
        path: PathBuf,
    },
    Icmp {
        /// IPv4 host to dial (client) or bind (server).
        address: String,
    },
    Dns {
        /// Resolver `host:port` (client).
        #[serde(default)]
        server: Option<String>,
        /// Address to answer on (server).
        #[serde(default = "default_dns_listen")]
        listen: String,
        root_domain: String,
    },
    Cat {
        /// Name the operator knows this end by.
        #[serde(default = "default_cat_name")]
        local_name: String,
        /// Client: where the operator delivers payloads.
        #[serde(default = "default_cat_name")]
        remote_name: String,
    },
}

fn default_true() -> bool {
    true
}

fn default_prefix() -> String {
    "mvtun".to_string()
}

fn default_dns_listen() -> String {
    "0.0.0.0:53".to_string()
}

fn default_cat_name() -> String {
    "server".to_string()
}

impl Config {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TunnelError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| TunnelError::Config(e.to_string()))
    }

    /// Check the settings the chosen role depends on.
    pub fn validate_for(&self, role: Role) -> Result<()> {
        if self.tun.prefix.is_empty() {
            return Err(TunnelError::Config("tun.prefix is empty".into()));
        }

        match &self.transport {
            TransportConfig::Udp { address } | TransportConfig::Icmp { address } => {
                if address.trim().is_empty() {
                    return Err(TunnelError::Config("transport.address is empty".into()));
                }
            }
            TransportConfig::Unix { path } => {
                if path.as_os_str().is_empty() {
                    return Err(TunnelError::Config("transport.path is empty".into()));
                }
            }
            TransportConfig::Dns {
                server,
                root_domain,
                ..
            } => {
                let root = codec::normalize_root(root_domain)?;
                let mtu = codec::max_payload_len(&root);
                if mtu < codec::MIN_MTU {
                    return Err(TunnelError::Config(format!(
                        "MTU too low for root domain {root}: {mtu} < {}",
                        codec::MIN_MTU
                    )));
                }
                if role == Role::Client && server.as_deref().is_none_or(str::is_empty) {
                    return Err(TunnelError::Config(
                        "dns client needs transport.server".into(),
                    ));
                }
            }
            TransportConfig::Cat { local_name, .. } => {
                if role == Role::Server && local_name.trim().is_empty() {
                    return Err(TunnelError::Config("empty cat server name".into()));
                }
            }
        }

        if role == Role::Server && self.tun.default_route {
            return Err(TunnelError::Config(
                "tun.default_route only applies to clients".into(),
            ));
        }
        Ok(())
    }
}

/// Resolve `host:port` to its first socket address.
pub fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|e| TunnelError::Config(format!("cannot resolve {address}: {e}")))?
        .next()
        .ok_or_else(|| TunnelError::Config(format!("{address} resolves to nothing")))
}

/// Resolve a host name or literal to an IPv4 address.
pub fn resolve_ipv4(host: &str) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    (host, 0)
        .to_socket_addrs()
        .map_err(|e| TunnelError::Config(format!("cannot resolve {host}: {e}")))?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| TunnelError::Config(format!("{host} has no IPv4 address")))
}
