//! Shared fixtures for the tunnel integration tests.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use mvirt_tunnel::bridge::{BridgeOptions, Tunnel};
use mvirt_tunnel::test_util::FakeDevice;

/// Tunnel-internal address of the client host.
pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 2);

/// Tunnel-internal address of the server host.
pub const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 1);

/// Upper bound for anything that should arrive.
pub const ARRIVAL: Duration = Duration::from_secs(3);

/// How long to watch for something that must not arrive.
pub const SILENCE: Duration = Duration::from_millis(300);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Allocate an available port for testing.
pub fn allocate_port() -> u16 {
    portpicker::pick_unused_port().expect("No available port")
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// A tunnel over a fresh fake interface; the device handle stays with the
/// test for injecting and observing packets.
pub fn fake_tunnel(name: &str, options: BridgeOptions) -> (Tunnel<FakeDevice>, Arc<FakeDevice>) {
    let device = Arc::new(FakeDevice::new(name));
    (Tunnel::new(Arc::clone(&device), options), device)
}
