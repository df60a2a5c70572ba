//! DNS transport
//!
//! Request/response tunnel over TXT queries. The client encodes each payload
//! into a query name under the root domain; the server answers with whatever
//! it has queued for the clients, so server-to-client traffic only moves
//! when a client asks. Every client write is one query/answer exchange.
//!
//! The largest payload is derived once from the root domain: the longest
//! payload whose query name still fits the 255-byte DNS name limit.

pub mod codec;
pub mod wire;

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use hickory_proto::rr::RecordType;
use tracing::{debug, info, trace, warn};

use super::{Connection, DatagramListen, Dial, PacketSocket, Transport, TransportKind};
use crate::error::{Result, TunnelError};

/// How long a client waits for an answer before treating it as empty.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

/// How often the responder re-checks the send queue while holding a query.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How many times the responder re-checks before answering empty.
pub const POLL_ATTEMPTS: usize = 10;

/// Queries answered concurrently by the server.
pub const RESPONDERS: usize = 16;

const MAX_MESSAGE: usize = 65535;

pub struct DnsTransport {
    endpoint: SocketAddr,
    root: String,
    mtu: usize,
}

impl DnsTransport {
    /// `endpoint` is the resolver to query (client) or the address to
    /// answer on (server).
    pub fn new(endpoint: SocketAddr, root_domain: &str) -> Result<Self> {
        let root = codec::normalize_root(root_domain)?;
        let mtu = codec::max_payload_len(&root);
        if mtu < codec::MIN_MTU {
            return Err(TunnelError::Config(format!(
                "MTU too low for root domain {root}: {mtu} < {}",
                codec::MIN_MTU
            )));
        }
        info!(root = %root, mtu, "DNS transport MTU computed");
        Ok(DnsTransport {
            endpoint,
            root,
            mtu,
        })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Transport for DnsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Dns
    }

    fn endpoint_ip(&self) -> Option<IpAddr> {
        Some(self.endpoint.ip())
    }

    fn max_payload(&self) -> Option<usize> {
        Some(self.mtu)
    }
}

/// Client side: one TXT exchange per write, answers fed to `recv`.
pub struct DnsConnection {
    socket: UdpSocket,
    server: SocketAddr,
    root: String,
    mtu: usize,
    next_id: AtomicU16,
    answers_tx: Sender<Vec<u8>>,
    answers_rx: Receiver<Vec<u8>>,
}

impl DnsConnection {
    /// Wait for the answer to query `id`. A timeout is an empty answer.
    fn await_answer(&self, id: u16) -> Result<()> {
        let mut buf = vec![0u8; MAX_MESSAGE];
        loop {
            let n = match self.socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    debug!(id, "No DNS answer before timeout");
                    return Ok(());
                }
                Err(e) => return Err(TunnelError::io("dns recv", e)),
            };

            match wire::parse_response(&buf[..n]) {
                Ok((answer_id, text)) => {
                    // late answers still carry server traffic
                    if let Some(text) = text {
                        self.deliver(answer_id, &text);
                    }
                    if answer_id == id {
                        return Ok(());
                    }
                    debug!(id, answer_id, "Received late DNS answer");
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed DNS response");
                }
            }
        }
    }

    fn deliver(&self, id: u16, text: &[u8]) {
        match codec::decode_text(text) {
            Ok(payload) if payload.is_empty() => {}
            Ok(payload) => {
                trace!(id, bytes = payload.len(), "DNS answer carries payload");
                let _ = self.answers_tx.send(payload);
            }
            Err(e) => warn!(id, error = %e, "Failed to decode DNS answer"),
        }
    }
}

impl Connection for DnsConnection {
    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let payload = self
            .answers_rx
            .recv()
            .map_err(|_| TunnelError::Closed("dns answers"))?;
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok(len)
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        if buf.len() > self.mtu {
            return Err(TunnelError::PayloadTooLong {
                len: buf.len(),
                mtu: self.mtu,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = codec::encode_query_name(buf, &self.root);
        let query = wire::encode_query(id, &name)?;

        self.socket
            .send(&query)
            .map_err(|e| TunnelError::io("dns send", e))?;
        self.await_answer(id)?;
        Ok(buf.len())
    }

    fn peer(&self) -> String {
        self.server.to_string()
    }
}

impl Dial for DnsTransport {
    type Conn = DnsConnection;

    fn dial(&self) -> Result<DnsConnection> {
        let local = match self.endpoint {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).map_err(|e| TunnelError::io("dns bind", e))?;
        socket
            .connect(self.endpoint)
            .map_err(|e| TunnelError::io("dns connect", e))?;
        socket
            .set_read_timeout(Some(CLIENT_TIMEOUT))
            .map_err(|e| TunnelError::io("dns set timeout", e))?;

        let (answers_tx, answers_rx) = unbounded();
        info!(server = %self.endpoint, root = %self.root, "DNS transport dialed");
        Ok(DnsConnection {
            socket,
            server: self.endpoint,
            root: self.root.clone(),
            mtu: self.mtu,
            next_id: AtomicU16::new(std::process::id() as u16),
            answers_tx,
            answers_rx,
        })
    }
}

/// Payloads waiting for the next query to carry them back.
#[derive(Default)]
pub struct SendQueue {
    packets: Mutex<VecDeque<Vec<u8>>>,
}

impl SendQueue {
    pub fn push(&self, packet: Vec<u8>) {
        let mut packets = self.packets.lock().unwrap_or_else(PoisonError::into_inner);
        packets.push_back(packet);
        trace!(queued = packets.len(), "Send queue grew");
    }

    pub fn try_pop(&self) -> Option<Vec<u8>> {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Pop, re-checking `attempts` more times `interval` apart.
    pub fn pop_within(&self, attempts: usize, interval: Duration) -> Option<Vec<u8>> {
        if let Some(packet) = self.try_pop() {
            return Some(packet);
        }
        for _ in 0..attempts {
            thread::sleep(interval);
            if let Some(packet) = self.try_pop() {
                return Some(packet);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Inbound = Result<(Vec<u8>, SocketAddr)>;

/// Server side: a receiving thread hands queries to a pool of responders.
/// Each responder answers one query at a time, handing decoded payloads to
/// `recv_from` and draining the send queue into answers.
pub struct DnsListener {
    local_addr: SocketAddr,
    queue: Arc<SendQueue>,
    inbound: Receiver<Inbound>,
}

impl DnsListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Receive queries and dispatch them to the responders.
fn receive_queries(
    socket: &UdpSocket,
    queries: &Sender<(Vec<u8>, SocketAddr)>,
    inbound: &Sender<Inbound>,
) {
    let mut buf = vec![0u8; MAX_MESSAGE];
    loop {
        let (n, src) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) => {
                let _ = inbound.send(Err(TunnelError::io("dns recv_from", e)));
                return;
            }
        };
        if queries.send((buf[..n].to_vec(), src)).is_err() {
            return;
        }
    }
}

#[derive(Clone)]
struct Responder {
    socket: Arc<UdpSocket>,
    root: String,
    queue: Arc<SendQueue>,
    inbound: Sender<Inbound>,
}

impl Responder {
    fn run(self, queries: Receiver<(Vec<u8>, SocketAddr)>) {
        for (msg, src) in queries {
            if let Err(e) = self.answer(&msg, src) {
                let _ = self.inbound.send(Err(e));
                return;
            }
        }
    }

    fn answer(&self, msg: &[u8], src: SocketAddr) -> Result<()> {
        let request = match wire::parse_query(msg) {
            Ok(request) => request,
            Err(e) => {
                debug!(src = %src, error = %e, "Ignoring malformed DNS query");
                return Ok(());
            }
        };
        let question = &request.queries()[0];
        let labels = wire::labels(question.name());

        let carries_data = question.query_type() == RecordType::TXT
            && match codec::decode_query_labels(&labels, &self.root) {
                Some(Ok(payload)) => {
                    if !payload.is_empty()
                        && self.inbound.send(Ok((payload, src))).is_err()
                    {
                        return Err(TunnelError::Closed("dns listener"));
                    }
                    true
                }
                Some(Err(e)) => {
                    warn!(src = %src, error = %e, "Failed to decode query name");
                    false
                }
                None => {
                    debug!(src = %src, name = %question.name(), "Query outside root domain");
                    false
                }
            };

        let text = if carries_data {
            self.queue
                .pop_within(POLL_ATTEMPTS, POLL_INTERVAL)
                .map(|payload| codec::encode_text(&payload))
        } else {
            None
        };
        let response = match wire::encode_response(&request, text.as_deref()) {
            Ok(response) => response,
            Err(e) => {
                warn!(src = %src, error = %e, "Failed to encode DNS answer");
                return Ok(());
            }
        };
        self.socket
            .send_to(&response, src)
            .map_err(|e| TunnelError::io("dns send_to", e))?;
        Ok(())
    }
}

impl PacketSocket for DnsListener {
    type Addr = SocketAddr;

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (payload, src) = self
            .inbound
            .recv()
            .map_err(|_| TunnelError::Closed("dns responder"))??;
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok((len, src))
    }

    /// Queue `buf` for the next answer. The address is informational: the
    /// next querying client receives it.
    fn send_to(&self, buf: &[u8], _addr: &SocketAddr) -> Result<usize> {
        self.queue.push(buf.to_vec());
        Ok(buf.len())
    }
}

impl DatagramListen for DnsTransport {
    type Socket = DnsListener;

    fn listen(&self) -> Result<DnsListener> {
        let socket = UdpSocket::bind(self.endpoint).map_err(|e| TunnelError::io("dns bind", e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TunnelError::io("dns local_addr", e))?;
        let queue = Arc::new(SendQueue::default());
        let (inbound_tx, inbound_rx) = unbounded();

        let socket = Arc::new(socket);
        let (queries_tx, queries_rx) = unbounded();

        let responder = Responder {
            socket: Arc::clone(&socket),
            root: self.root.clone(),
            queue: Arc::clone(&queue),
            inbound: inbound_tx.clone(),
        };
        for i in 0..RESPONDERS {
            let responder = responder.clone();
            let queries = queries_rx.clone();
            thread::Builder::new()
                .name(format!("dns-responder-{i}"))
                .spawn(move || responder.run(queries))
                .map_err(|e| TunnelError::io("spawn dns responder", e))?;
        }
        thread::Builder::new()
            .name("dns-recv".to_string())
            .spawn(move || receive_queries(&socket, &queries_tx, &inbound_tx))
            .map_err(|e| TunnelError::io("spawn dns receiver", e))?;

        info!(addr = %local_addr, root = %self.root, "Listening on DNS");
        Ok(DnsListener {
            local_addr,
            queue,
            inbound: inbound_rx,
        })
    }
}
