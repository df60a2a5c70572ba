//! TUN interface management
//!
//! Creates a layer-3 TUN device (no packet info header), assigns the tunnel
//! address and brings it up over rtnetlink. The forwarding loops only see
//! the [`PacketDevice`] trait so they can be driven by a fake in tests.

use futures::TryStreamExt;
use ipnet::Ipv4Net;
use nix::libc::{self, IFF_NO_PI, IFF_TUN, IFNAMSIZ, c_char, c_short};
use rtnetlink::Handle;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::AsRawFd;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};

const TUNSETIFF: nix::libc::Ioctl = 0x400454ca as nix::libc::Ioctl;

/// Byte-oriented packet source/sink plus the routing query used by the
/// routing-conflict check.
pub trait PacketDevice: Send + Sync + 'static {
    /// Interface name, e.g. `mvtun0`.
    fn name(&self) -> &str;

    /// Read one whole packet. Blocks until one is available.
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one whole packet.
    fn write_packet(&self, buf: &[u8]) -> io::Result<usize>;

    /// Does the host currently route `addr` through this interface?
    fn is_routed_through(&self, addr: IpAddr) -> io::Result<bool>;
}

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

pub struct TunDevice {
    pub name: String,
    pub if_index: u32,
    file: File,
}

impl TunDevice {
    /// Allocate the next free `<prefix><N>` interface, assign `cidr` and
    /// bring it up.
    pub async fn create(prefix: &str, cidr: Ipv4Net) -> Result<Self> {
        let existing = interface_names()?;
        let name = next_interface_name(prefix, existing.iter().map(String::as_str));
        if name.len() >= IFNAMSIZ {
            return Err(TunnelError::Interface(format!(
                "interface name {name} exceeds {} bytes",
                IFNAMSIZ - 1
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| TunnelError::io("open /dev/net/tun", e))?;

        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: (IFF_TUN | IFF_NO_PI) as c_short,
            _padding: [0; 22],
        };
        for (i, byte) in name.bytes().enumerate() {
            ifr.ifr_name[i] = byte as c_char;
        }

        let result = unsafe { nix::libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
        if result < 0 {
            return Err(TunnelError::io("TUNSETIFF", io::Error::last_os_error()));
        }

        let handle = netlink_handle()?;
        let if_index = get_interface_index(&handle, &name)
            .await
            .ok_or_else(|| TunnelError::Interface(format!("interface {name} not found")))?;

        info!(name = %name, if_index, "TUN device created");

        let device = TunDevice {
            name,
            if_index,
            file,
        };
        device.add_address(cidr).await?;
        device.set_up().await?;
        Ok(device)
    }

    async fn add_address(&self, cidr: Ipv4Net) -> Result<()> {
        let handle = netlink_handle()?;
        handle
            .address()
            .add(self.if_index, IpAddr::V4(cidr.addr()), cidr.prefix_len())
            .execute()
            .await
            .map_err(|e| TunnelError::Interface(format!("add address {cidr}: {e}")))?;

        info!(addr = %cidr, name = %self.name, "Address added");
        Ok(())
    }

    async fn set_up(&self) -> Result<()> {
        let handle = netlink_handle()?;
        handle
            .link()
            .set(self.if_index)
            .up()
            .execute()
            .await
            .map_err(|e| TunnelError::Interface(format!("set {} up: {e}", self.name)))?;

        info!(name = %self.name, "Interface set UP");
        Ok(())
    }

    /// Limit the interface MTU, so the kernel never hands us a packet the
    /// transport cannot carry in one write.
    pub async fn set_mtu(&self, mtu: u32) -> Result<()> {
        let handle = netlink_handle()?;
        handle
            .link()
            .set(self.if_index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(|e| TunnelError::Interface(format!("set {} mtu {mtu}: {e}", self.name)))?;

        info!(name = %self.name, mtu, "Interface MTU set");
        Ok(())
    }

    /// Route all IPv4 traffic through this interface.
    ///
    /// Installs 0.0.0.0/1 and 128.0.0.0/1, which win over an existing
    /// default route by prefix length without replacing it.
    pub async fn set_default_route(&self) -> Result<()> {
        self.add_route_v4(Ipv4Addr::new(0, 0, 0, 0), 1).await?;
        self.add_route_v4(Ipv4Addr::new(128, 0, 0, 0), 1).await
    }

    async fn add_route_v4(&self, prefix: Ipv4Addr, prefix_len: u8) -> Result<()> {
        let handle = netlink_handle()?;
        match handle
            .route()
            .add()
            .v4()
            .destination_prefix(prefix, prefix_len)
            .output_interface(self.if_index)
            .execute()
            .await
        {
            Ok(()) => {
                info!(prefix = %prefix, prefix_len, name = %self.name, "Kernel route added");
                Ok(())
            }
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
                warn!(prefix = %prefix, prefix_len, name = %self.name, "Kernel route already exists");
                Ok(())
            }
            Err(e) => Err(TunnelError::Interface(format!(
                "add route {prefix}/{prefix_len} via {}: {e}",
                self.name
            ))),
        }
    }
}

impl PacketDevice for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    fn write_packet(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    fn is_routed_through(&self, addr: IpAddr) -> io::Result<bool> {
        let output = Command::new("ip")
            .args(["route", "get", &addr.to_string()])
            .output()?;
        if !output.status.success() {
            // unreachable destinations have no route at all
            debug!(addr = %addr, "ip route get failed");
            return Ok(false);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(route_device(&stdout) == Some(self.name.as_str()))
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        debug!(name = %self.name, "TUN device closed");
    }
}

fn netlink_handle() -> Result<Handle> {
    let (connection, handle, _) =
        rtnetlink::new_connection().map_err(|e| TunnelError::io("netlink connection", e))?;
    tokio::spawn(connection);
    Ok(handle)
}

async fn get_interface_index(handle: &Handle, name: &str) -> Option<u32> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    if let Ok(Some(link)) = links.try_next().await {
        return Some(link.header.index);
    }
    None
}

fn interface_names() -> Result<Vec<String>> {
    let interfaces = nix::net::if_::if_nameindex()
        .map_err(|e| TunnelError::io("list interfaces", io::Error::from(e)))?;
    Ok(interfaces
        .iter()
        .map(|iface| iface.name().to_string_lossy().into_owned())
        .collect())
}

/// Pick `<prefix><N>` with N one above the highest existing suffix.
pub fn next_interface_name<'a>(prefix: &str, existing: impl IntoIterator<Item = &'a str>) -> String {
    let next = existing
        .into_iter()
        .filter_map(|name| name.strip_prefix(prefix)?.parse::<u32>().ok())
        .max()
        .map_or(0, |highest| highest + 1);
    format!("{prefix}{next}")
}

/// Extract the output device from `ip route get` output.
pub fn route_device(output: &str) -> Option<&str> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "dev" {
            return tokens.next();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_interface_name_empty() {
        assert_eq!(next_interface_name("mvtun", ["lo", "eth0"]), "mvtun0");
    }

    #[test]
    fn test_next_interface_name_skips_gaps() {
        let existing = ["lo", "mvtun0", "mvtun3", "mvtun1", "eth0"];
        assert_eq!(next_interface_name("mvtun", existing), "mvtun4");
    }

    #[test]
    fn test_next_interface_name_ignores_non_numeric_suffix() {
        let existing = ["mvtunnel", "mvtun2x", "mvtun1"];
        assert_eq!(next_interface_name("mvtun", existing), "mvtun2");
    }

    #[test]
    fn test_route_device() {
        let out = "192.0.2.1 via 10.0.0.1 dev eth0 src 10.0.0.5 uid 0 \n    cache \n";
        assert_eq!(route_device(out), Some("eth0"));

        let out = "10.10.0.7 dev mvtun0 src 10.10.0.1 uid 0 \n    cache \n";
        assert_eq!(route_device(out), Some("mvtun0"));

        assert_eq!(route_device("local 127.0.0.1 dev lo table local"), Some("lo"));
        assert_eq!(route_device(""), None);
    }

    #[tokio::test]
    #[ignore = "requires CAP_NET_ADMIN"]
    async fn test_create_tun_device() {
        let cidr: Ipv4Net = "10.99.97.1/24".parse().unwrap();
        let device = TunDevice::create("mvtest", cidr)
            .await
            .expect("Failed to create TUN device");
        assert!(device.name.starts_with("mvtest"));
        assert!(device.if_index > 0);
        assert!(
            device
                .is_routed_through("10.99.97.7".parse().unwrap())
                .unwrap()
        );
    }
}
