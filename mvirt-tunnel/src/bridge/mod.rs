//! Tunnel bridge
//!
//! Ties a [`PacketDevice`], a transport and (on servers) a [`SessionTable`]
//! together with two blocking forwarding loops per tunnel:
//!
//! - interface → transport: read a packet, drop noise, send it to the peer
//!   (client) or to the peer owning the destination address (server).
//! - transport → interface: read a payload, answer service messages, drop
//!   noise, register the sender (server) and write the packet.
//!
//! The first endpoint failure in any loop completes the tunnel; the run loop
//! waiting on [`Running`] sees that error. Sibling loops are not cancelled.
//!
//! [`SessionTable`]: crate::session::SessionTable

mod client;
mod server;

pub use server::{DatagramSessions, StreamSessions};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, error, trace, warn};

use crate::config::{Config, Role};
use crate::error::{Result, TunnelError};
use crate::message::{ServiceMessage, is_ip_payload};
use crate::packet::{IpVersion, Packet};
use crate::transport::{AnyTransport, Transport};
use crate::tun::PacketDevice;

/// Interface read buffer; larger than any MTU the interface is given.
pub const DEVICE_BUF: usize = 4096;

/// Transport read buffer.
pub const TRANSPORT_BUF: usize = 65536;

/// How long a client waits for a hello ack before warning.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of one tunnel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    Dialing,
    Listening,
    Forwarding,
    Terminated,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Created => "created",
            TunnelState::Dialing => "dialing",
            TunnelState::Listening => "listening",
            TunnelState::Forwarding => "forwarding",
            TunnelState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub drop_chatter: bool,
    pub skip_routing_check: bool,
    pub send_hello: bool,
    pub hello_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        BridgeOptions {
            drop_chatter: true,
            skip_routing_check: false,
            send_hello: false,
            hello_timeout: HELLO_TIMEOUT,
        }
    }
}

impl From<&Config> for BridgeOptions {
    fn from(config: &Config) -> Self {
        BridgeOptions {
            drop_chatter: config.drop_chatter,
            skip_routing_check: config.skip_routing_check,
            send_hello: config.send_hello,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
struct StateCell(RwLock<TunnelState>);

impl StateCell {
    fn get(&self) -> TunnelState {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: TunnelState) {
        let mut current = self.0.write().unwrap_or_else(PoisonError::into_inner);
        if *current != TunnelState::Terminated {
            debug!(from = %*current, to = %state, "Tunnel state change");
            *current = state;
        }
    }
}

/// Single-slot completion signal shared by the forwarding loops.
///
/// The first completion wins; later ones are logged and discarded.
#[derive(Clone)]
pub struct Completion {
    tx: Sender<TunnelError>,
    state: Arc<StateCell>,
}

impl Completion {
    pub fn complete(&self, err: TunnelError) {
        error!(error = %err, "Forwarding loop failed");
        self.state.set(TunnelState::Terminated);
        if self.tx.try_send(err).is_err() {
            debug!("Tunnel already completed");
        }
    }
}

/// Handle to a started tunnel.
pub struct Running {
    rx: Receiver<TunnelError>,
    state: Arc<StateCell>,
}

impl Running {
    /// Block until the tunnel terminates; returns the error that ended it.
    pub fn wait(&self) -> TunnelError {
        self.rx
            .recv()
            .unwrap_or(TunnelError::Closed("forwarding loops"))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TunnelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(err) => Some(err),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(TunnelError::Closed("forwarding loops")),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state.get()
    }
}

/// One tunnel instance over one device.
pub struct Tunnel<D> {
    device: Arc<D>,
    options: BridgeOptions,
    state: Arc<StateCell>,
    /// Set once the peer acknowledged our hello.
    peer_live: Arc<AtomicBool>,
}

impl<D: PacketDevice> Tunnel<D> {
    pub fn new(device: Arc<D>, options: BridgeOptions) -> Self {
        Tunnel {
            device,
            options,
            state: Arc::new(StateCell(RwLock::new(TunnelState::Created))),
            peer_live: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state.get()
    }

    /// Whether a client's hello was acknowledged. Advisory only.
    pub fn peer_live(&self) -> bool {
        self.peer_live.load(Ordering::Acquire)
    }

    /// Start forwarding in the given role over the configured transport.
    pub fn start(&self, role: Role, transport: &AnyTransport) -> Result<Running> {
        let result = match role {
            Role::Client => match transport {
                AnyTransport::Udp(t) => self.start_client(t),
                AnyTransport::Unix(t) => self.start_client(t),
                AnyTransport::Icmp(t) => self.start_client(t),
                AnyTransport::Dns(t) => self.start_client(t),
                AnyTransport::Cat(t) => self.start_client(t),
            },
            Role::Server => match transport {
                AnyTransport::Udp(t) => self.start_datagram_server(t).map(|(running, _)| running),
                AnyTransport::Unix(t) => self.start_stream_server(t).map(|(running, _)| running),
                AnyTransport::Icmp(t) => self.start_datagram_server(t).map(|(running, _)| running),
                AnyTransport::Dns(t) => self.start_datagram_server(t).map(|(running, _)| running),
                AnyTransport::Cat(t) => self.start_datagram_server(t).map(|(running, _)| running),
            },
        };
        if result.is_err() {
            self.state.set(TunnelState::Terminated);
        }
        result
    }

    /// Refuse to start when the transport endpoint is routed through the
    /// tunnel itself, unless told to skip the check.
    fn check_routing(&self, transport: &dyn Transport) -> Result<()> {
        if !transport.is_readable() && !transport.is_writable() {
            return Err(TunnelError::Config(format!(
                "{} transport can neither read nor write",
                transport.kind()
            )));
        }
        if !transport.has_routing_conflict(self.device.as_ref())? {
            return Ok(());
        }
        let endpoint = transport
            .endpoint_ip()
            .ok_or_else(|| TunnelError::Config("routing conflict without endpoint".into()))?;
        if self.options.skip_routing_check {
            warn!(
                endpoint = %endpoint,
                interface = %self.device.name(),
                "Transport endpoint is routed through the tunnel; ignoring due to skip_routing_check"
            );
            return Ok(());
        }
        Err(TunnelError::RoutingConflict {
            endpoint,
            interface: self.device.name().to_string(),
        })
    }

    fn completion(&self) -> (Completion, Running) {
        let (tx, rx) = bounded(1);
        (
            Completion {
                tx,
                state: Arc::clone(&self.state),
            },
            Running {
                rx,
                state: Arc::clone(&self.state),
            },
        )
    }
}

fn spawn_loop<F>(name: String, f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map(|_| ())
        .map_err(|e| TunnelError::io("spawn forwarding thread", e))
}

/// Decide whether a packet read from the interface should be forwarded.
fn classify_outbound<'a>(buf: &'a [u8], options: &BridgeOptions) -> Option<Packet<'a>> {
    let Some(packet) = Packet::parse(buf) else {
        debug!(bytes = buf.len(), "Skipping packet, can't parse as IPv4 nor IPv6");
        return None;
    };
    if options.drop_chatter && packet.is_chatter() {
        trace!(flow = %packet.describe_flow(), "Dropping chatter");
        return None;
    }
    if packet.version() == IpVersion::V6 {
        debug!(flow = %packet.describe_flow(), "Dropping IPv6 packet");
        return None;
    }
    Some(packet)
}

/// What a buffer read from the transport turned out to be.
enum Inbound<'a> {
    Empty,
    Service(ServiceMessage),
    Drop,
    Forward(Packet<'a>),
}

fn classify_inbound<'a>(buf: &'a [u8], options: &BridgeOptions) -> Inbound<'a> {
    if buf.is_empty() {
        return Inbound::Empty;
    }
    if !is_ip_payload(buf) {
        trace!(bytes = buf.len(), "net=>tun: service message");
        return Inbound::Service(ServiceMessage::classify(buf));
    }
    let Some(packet) = Packet::parse(buf) else {
        debug!(bytes = buf.len(), "Can't parse IP packet from transport");
        return Inbound::Drop;
    };
    if options.drop_chatter && packet.is_chatter() {
        trace!(flow = %packet.describe_flow(), "Dropping chatter");
        return Inbound::Drop;
    }
    if packet.version() == IpVersion::V6 {
        debug!(flow = %packet.describe_flow(), "Dropping IPv6 packet");
        return Inbound::Drop;
    }
    Inbound::Forward(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HELLO, HELLO_ACK};
    use crate::test_util::packets::{ipv4_tcp_syn, ipv4_udp, ipv6_udp};
    use std::net::Ipv4Addr;

    const A: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 2);
    const B: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 1);

    #[test]
    fn test_outbound_filters() {
        let options = BridgeOptions::default();
        let syn = ipv4_tcp_syn(A, B, 40000, 80);
        assert!(classify_outbound(&syn, &options).is_some());

        let mdns = ipv4_udp(A, Ipv4Addr::new(224, 0, 0, 251), 5353, 5353, b"q");
        assert!(classify_outbound(&mdns, &options).is_none());

        let chatty = BridgeOptions {
            drop_chatter: false,
            ..Default::default()
        };
        assert!(classify_outbound(&mdns, &chatty).is_some());

        let v6 = ipv6_udp("fd00::2".parse().unwrap(), "fd00::1".parse().unwrap(), 1, 2, b"x");
        assert!(classify_outbound(&v6, &chatty).is_none());
        assert!(classify_outbound(&HELLO, &options).is_none());
    }

    #[test]
    fn test_inbound_classification() {
        let options = BridgeOptions::default();
        assert!(matches!(classify_inbound(&[], &options), Inbound::Empty));
        assert!(matches!(
            classify_inbound(&HELLO, &options),
            Inbound::Service(ServiceMessage::Hello)
        ));
        assert!(matches!(
            classify_inbound(&HELLO_ACK, &options),
            Inbound::Service(ServiceMessage::HelloAck)
        ));
        assert!(matches!(
            classify_inbound(&[0x45, 0x00], &options),
            Inbound::Drop
        ));

        let broadcast = ipv4_udp(A, Ipv4Addr::BROADCAST, 68, 67, b"d");
        assert!(matches!(
            classify_inbound(&broadcast, &options),
            Inbound::Drop
        ));

        let syn = ipv4_tcp_syn(A, B, 40000, 80);
        match classify_inbound(&syn, &options) {
            Inbound::Forward(packet) => assert_eq!(packet.src(), std::net::IpAddr::V4(A)),
            _ => panic!("SYN should be forwarded"),
        }
    }

    #[test]
    fn test_first_completion_wins() {
        let state = Arc::new(StateCell(RwLock::new(TunnelState::Forwarding)));
        let (tx, rx) = bounded(1);
        let completion = Completion {
            tx,
            state: Arc::clone(&state),
        };
        let running = Running { rx, state };

        completion.complete(TunnelError::Closed("first"));
        completion.clone().complete(TunnelError::Closed("second"));

        assert_eq!(running.state(), TunnelState::Terminated);
        assert!(matches!(running.wait(), TunnelError::Closed("first")));
        assert!(running.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_terminated_is_final() {
        let state = StateCell(RwLock::new(TunnelState::Created));
        state.set(TunnelState::Terminated);
        state.set(TunnelState::Forwarding);
        assert_eq!(state.get(), TunnelState::Terminated);
    }
}
