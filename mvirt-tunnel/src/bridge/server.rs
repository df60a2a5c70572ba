//! Server role: many peers behind one transport endpoint, demultiplexed by
//! the source address of the packets they send.

use std::io;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::{
    BridgeOptions, Completion, DEVICE_BUF, Inbound, Running, TRANSPORT_BUF, Tunnel, TunnelState,
    classify_inbound, classify_outbound, spawn_loop,
};
use crate::error::{Result, TunnelError};
use crate::message::{HELLO_ACK, ServiceMessage};
use crate::session::SessionTable;
use crate::transport::{Acceptor, Connection, DatagramListen, PacketSocket, StreamListen};
use crate::tun::PacketDevice;

/// Sessions of a datagram server: tunnel address → return address.
pub type DatagramSessions<T> =
    SessionTable<<<T as DatagramListen>::Socket as PacketSocket>::Addr>;

/// Sessions of a stream server: tunnel address → connection.
pub type StreamSessions<T> =
    SessionTable<Arc<<<T as StreamListen>::Acceptor as Acceptor>::Conn>>;

impl<D: PacketDevice> Tunnel<D> {
    /// Serve a connectionless transport.
    pub fn start_datagram_server<T: DatagramListen>(
        &self,
        transport: &T,
    ) -> Result<(Running, Arc<DatagramSessions<T>>)> {
        self.check_routing(transport)?;

        self.state.set(TunnelState::Listening);
        let socket = Arc::new(transport.listen()?);
        info!(
            kind = %transport.kind(),
            interface = %self.device.name(),
            "Tunnel server listening"
        );

        let sessions = Arc::new(SessionTable::new());
        let (completion, running) = self.completion();

        if transport.is_readable() {
            let device = Arc::clone(&self.device);
            let socket = Arc::clone(&socket);
            let sessions = Arc::clone(&sessions);
            let options = self.options.clone();
            let completion = completion.clone();
            spawn_loop("net-to-tun".to_string(), move || {
                datagrams_to_device(
                    device.as_ref(),
                    socket.as_ref(),
                    &sessions,
                    &options,
                    &completion,
                )
            })?;
        }

        if transport.is_writable() {
            let device = Arc::clone(&self.device);
            let sessions = Arc::clone(&sessions);
            let options = self.options.clone();
            spawn_loop("tun-to-net".to_string(), move || {
                device_to_datagrams(
                    device.as_ref(),
                    socket.as_ref(),
                    &sessions,
                    &options,
                    &completion,
                )
            })?;
        }

        self.state.set(TunnelState::Forwarding);
        Ok((running, sessions))
    }

    /// Serve a connection-oriented transport: one receiving loop per
    /// accepted connection, one shared interface loop.
    pub fn start_stream_server<T: StreamListen>(
        &self,
        transport: &T,
    ) -> Result<(Running, Arc<StreamSessions<T>>)> {
        self.check_routing(transport)?;

        self.state.set(TunnelState::Listening);
        let acceptor = transport.listen()?;
        info!(
            kind = %transport.kind(),
            interface = %self.device.name(),
            "Tunnel server listening"
        );

        let sessions = Arc::new(SessionTable::new());
        let (completion, running) = self.completion();

        {
            let device = Arc::clone(&self.device);
            let sessions = Arc::clone(&sessions);
            let options = self.options.clone();
            let completion = completion.clone();
            let readable = transport.is_readable();
            spawn_loop("accept".to_string(), move || {
                accept_loop(acceptor, device, sessions, options, readable, completion)
            })?;
        }

        if transport.is_writable() {
            let device = Arc::clone(&self.device);
            let sessions = Arc::clone(&sessions);
            let options = self.options.clone();
            spawn_loop("tun-to-net".to_string(), move || {
                device_to_connections(device.as_ref(), &sessions, &options, &completion)
            })?;
        }

        self.state.set(TunnelState::Forwarding);
        Ok((running, sessions))
    }
}

/// Transport → interface, for every peer of a datagram socket.
fn datagrams_to_device<D, S>(
    device: &D,
    socket: &S,
    sessions: &SessionTable<S::Addr>,
    options: &BridgeOptions,
    completion: &Completion,
) where
    D: PacketDevice,
    S: PacketSocket,
{
    let mut buf = vec![0u8; TRANSPORT_BUF];
    loop {
        let (n, source) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) => {
                completion.complete(e);
                return;
            }
        };

        match classify_inbound(&buf[..n], options) {
            Inbound::Empty | Inbound::Drop => {}
            Inbound::Service(ServiceMessage::Hello) => {
                debug!(source = %source, "Received hello");
                if let Err(e) = socket.send_to(&HELLO_ACK, &source) {
                    completion.complete(e);
                    return;
                }
            }
            Inbound::Service(message) => {
                warn!(source = %source, ?message, bytes = n, "Unknown service message");
            }
            Inbound::Forward(packet) => {
                trace!(source = %source, flow = %packet.describe_flow(), bytes = n, "net=>tun");
                if sessions.register(packet.src(), source.clone()).is_none() {
                    info!(tunnel_addr = %packet.src(), peer = %source, "New session");
                }
                if let Err(e) = device.write_packet(&buf[..n]) {
                    completion.complete(TunnelError::io("interface write", e));
                    return;
                }
            }
        }
    }
}

/// Interface → transport, addressed by the session of the destination.
fn device_to_datagrams<D, S>(
    device: &D,
    socket: &S,
    sessions: &SessionTable<S::Addr>,
    options: &BridgeOptions,
    completion: &Completion,
) where
    D: PacketDevice,
    S: PacketSocket,
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
        let Some(peer) = sessions.lookup(&packet.dst()) else {
            debug!(flow = %packet.describe_flow(), "No session for destination, dropping");
            continue;
        };
        trace!(peer = %peer, flow = %packet.describe_flow(), bytes = n, "tun=>net");

        if let Err(e) = socket.send_to(&buf[..n], &peer) {
            completion.complete(e);
            return;
        }
    }
}

fn accept_loop<A, D>(
    acceptor: A,
    device: Arc<D>,
    sessions: Arc<SessionTable<Arc<A::Conn>>>,
    options: BridgeOptions,
    readable: bool,
    completion: Completion,
) where
    A: Acceptor,
    D: PacketDevice,
{
    let mut accepted = 0usize;
    loop {
        let conn = match acceptor.accept() {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                completion.complete(e);
                return;
            }
        };
        accepted += 1;

        if !readable {
            continue;
        }
        let device = Arc::clone(&device);
        let sessions = Arc::clone(&sessions);
        let options = options.clone();
        let conn_completion = completion.clone();
        let spawned = spawn_loop(format!("net-to-tun-{accepted}"), move || {
            connection_to_device(device.as_ref(), conn, &sessions, &options, &conn_completion)
        });
        if let Err(e) = spawned {
            completion.complete(e);
            return;
        }
    }
}

/// Transport → interface, for one accepted connection.
fn connection_to_device<D, C>(
    device: &D,
    conn: Arc<C>,
    sessions: &SessionTable<Arc<C>>,
    options: &BridgeOptions,
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
            Inbound::Service(ServiceMessage::Hello) => {
                debug!(peer = %conn.peer(), "Received hello");
                if let Err(e) = conn.send(&HELLO_ACK) {
                    completion.complete(e);
                    return;
                }
            }
            Inbound::Service(message) => {
                warn!(peer = %conn.peer(), ?message, bytes = n, "Unknown service message");
            }
            Inbound::Forward(packet) => {
                trace!(peer = %conn.peer(), flow = %packet.describe_flow(), bytes = n, "net=>tun");
                if sessions.register(packet.src(), Arc::clone(&conn)).is_none() {
                    info!(tunnel_addr = %packet.src(), peer = %conn.peer(), "New session");
                }
                if let Err(e) = device.write_packet(&buf[..n]) {
                    completion.complete(TunnelError::io("interface write", e));
                    return;
                }
            }
        }
    }
}

/// Interface → transport, through the connection owning the destination.
fn device_to_connections<D, C>(
    device: &D,
    sessions: &SessionTable<Arc<C>>,
    options: &BridgeOptions,
    completion: &Completion,
) where
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
        let Some(conn) = sessions.lookup(&packet.dst()) else {
            debug!(flow = %packet.describe_flow(), "No session for destination, dropping");
            continue;
        };
        trace!(peer = %conn.peer(), flow = %packet.describe_flow(), bytes = n, "tun=>net");

        if let Err(e) = conn.send(&buf[..n]) {
            completion.complete(e);
            return;
        }
    }
}
