//! Client role: one connection to one peer, two forwarding loops.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, info, trace, warn};

use super::{
    BridgeOptions, Completion, DEVICE_BUF, Inbound, Running, TRANSPORT_BUF, Tunnel, TunnelState,
    classify_inbound, classify_outbound, spawn_loop,
};
use crate::error::{Result, TunnelError};
use crate::message::{HELLO, ServiceMessage};
use crate::transport::{Connection, Dial};
use crate::tun::PacketDevice;

impl<D: PacketDevice> Tunnel<D> {
    pub(super) fn start_client<T: Dial>(&self, transport: &T) -> Result<Running> {
        self.check_routing(transport)?;

        self.state.set(TunnelState::Dialing);
        let conn = Arc::new(transport.dial()?);
        info!(
            kind = %transport.kind(),
            peer = %conn.peer(),
            interface = %self.device.name(),
            "Connected to tunnel peer"
        );

        let (completion, running) = self.completion();
        let (ack_tx, ack_rx) = bounded(1);

        if self.options.send_hello {
            conn.send(&HELLO)?;
            debug!(peer = %conn.peer(), "Sent hello");
            let timeout = self.options.hello_timeout;
            spawn_loop("hello-watchdog".to_string(), move || {
                await_hello_ack(ack_rx, timeout)
            })?;
        }

        if transport.is_writable() {
            let device = Arc::clone(&self.device);
            let conn = Arc::clone(&conn);
            let options = self.options.clone();
            let completion = completion.clone();
            spawn_loop("tun-to-net".to_string(), move || {
                device_to_peer(device.as_ref(), conn.as_ref(), &options, &completion)
            })?;
        }

        if transport.is_readable() {
            let device = Arc::clone(&self.device);
            let options = self.options.clone();
            let peer_live = Arc::clone(&self.peer_live);
            spawn_loop("net-to-tun".to_string(), move || {
                let acks = HelloAcks {
                    live: &peer_live,
                    tx: &ack_tx,
                };
                peer_to_device(device.as_ref(), conn.as_ref(), &options, acks, &completion)
            })?;
        }

        self.state.set(TunnelState::Forwarding);
        Ok(running)
    }
}

fn await_hello_ack(acks: Receiver<()>, timeout: Duration) {
    match acks.recv_timeout(timeout) {
        Ok(()) => {}
        Err(RecvTimeoutError::Timeout) => {
            warn!(timeout = ?timeout, "No hello ack from peer");
        }
        Err(RecvTimeoutError::Disconnected) => {}
    }
}

/// Interface → transport.
fn device_to_peer<D, C>(device: &D, conn: &C, options: &BridgeOptions, completion: &Completion)
where
    D: PacketDevice,
    C: Connection,
{
    let mut buf = vec![0u8; DEVICE_BUF];
    loop {
        let n = match device.read_packet(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                completion.complete(TunnelError::io("interface read", e));
                return;
            }
        };
        let Some(packet) = classify_outbound(&buf[..n], options) else {
            continue;
        };
        trace!(flow = %packet.describe_flow(), bytes = n, "tun=>net");

        if let Err(e) = conn.send(&buf[..n]) {
            completion.complete(e);
            return;
        }
    }
}

/// Where a received hello ack is reported.
struct HelloAcks<'a> {
    live: &'a AtomicBool,
    tx: &'a Sender<()>,
}

/// Transport → interface.
fn peer_to_device<D, C>(
    device: &D,
    conn: &C,
    options: &BridgeOptions,
    acks: HelloAcks<'_>,
    completion: &Completion,
) where
    D: PacketDevice,
    C: Connection,
{
    let mut buf = vec![0u8; TRANSPORT_BUF];
    loop {
        let n = match conn.recv(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                completion.complete(e);
                return;
            }
        };

        match classify_inbound(&buf[..n], options) {
            Inbound::Empty | Inbound::Drop => {}
            Inbound::Service(ServiceMessage::HelloAck) => {
                if options.send_hello {
                    info!(peer = %conn.peer(), "Received hello ack, peer is live");
                    acks.live.store(true, Ordering::Release);
                    let _ = acks.tx.try_send(());
                } else {
                    warn!(peer = %conn.peer(), "Unexpected hello ack");
                }
            }
            Inbound::Service(message) => {
                warn!(peer = %conn.peer(), ?message, bytes = n, "Unknown service message");
            }
            Inbound::Forward(packet) => {
                trace!(flow = %packet.describe_flow(), bytes = n, "net=>tun");
                if let Err(e) = device.write_packet(&buf[..n]) {
                    completion.complete(TunnelError::io("interface write", e));
                    return;
                }
            }
        }
    }
}
