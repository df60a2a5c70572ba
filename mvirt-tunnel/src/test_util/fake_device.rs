//! In-memory packet device
//!
//! Packets injected by the test are returned by `read_packet` in order;
//! packets the tunnel writes are captured and can be awaited.

use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::tun::PacketDevice;

/// Fake TUN interface backed by channels.
pub struct FakeDevice {
    name: String,
    inbound_tx: Sender<io::Result<Vec<u8>>>,
    inbound_rx: Receiver<io::Result<Vec<u8>>>,
    written_tx: Sender<Vec<u8>>,
    written_rx: Receiver<Vec<u8>>,
    routed: Mutex<HashSet<IpAddr>>,
    fail_writes: AtomicBool,
}

impl FakeDevice {
    pub fn new(name: &str) -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        let (written_tx, written_rx) = unbounded();
        FakeDevice {
            name: name.to_string(),
            inbound_tx,
            inbound_rx,
            written_tx,
            written_rx,
            routed: Mutex::new(HashSet::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Queue a packet as if the kernel had routed it into the interface.
    pub fn inject(&self, packet: &[u8]) {
        let _ = self.inbound_tx.send(Ok(packet.to_vec()));
    }

    /// Make the next `read_packet` fail.
    pub fn inject_read_error(&self, kind: io::ErrorKind) {
        let _ = self
            .inbound_tx
            .send(Err(io::Error::new(kind, "injected read error")));
    }

    /// Make every subsequent `write_packet` fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Pretend the host routes `addr` through this interface.
    pub fn route_through(&self, addr: IpAddr) {
        self.routed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr);
    }

    /// Wait for the next packet the tunnel wrote into the interface.
    pub fn next_written(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.written_rx.recv_timeout(timeout).ok()
    }
}

impl PacketDevice for FakeDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .inbound_rx
            .recv()
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))??;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    fn write_packet(&self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write error"));
        }
        let _ = self.written_tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn is_routed_through(&self, addr: IpAddr) -> io::Result<bool> {
        Ok(self
            .routed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&addr))
    }
}
