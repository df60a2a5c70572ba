//! Test utilities for driving tunnels without privileges
//!
//! [`FakeDevice`] stands in for the TUN interface so whole tunnels can be
//! run over loopback transports; [`packets`] builds the IP traffic fed into it.

pub mod fake_device;
pub mod packets;

pub use fake_device::FakeDevice;
