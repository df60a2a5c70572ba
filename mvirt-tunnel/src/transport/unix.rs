//! Unix domain socket transport
//!
//! A byte stream has no message boundaries, so every payload is framed with
//! a 2-byte big-endian length prefix. One `recv` yields exactly one payload.

use std::fs;
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use super::{Acceptor, Connection, Dial, StreamListen, Transport, TransportKind};
use crate::error::{Result, TunnelError};

/// Largest payload a frame can carry.
pub const MAX_FRAME: usize = u16::MAX as usize;

pub struct UnixTransport {
    path: PathBuf,
}

impl UnixTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        UnixTransport { path: path.into() }
    }
}

impl Transport for UnixTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Unix
    }

    fn endpoint_ip(&self) -> Option<IpAddr> {
        None
    }
}

/// Framed Unix stream.
pub struct UnixConnection {
    reader: UnixStream,
    writer: Mutex<UnixStream>,
    peer: String,
}

impl UnixConnection {
    fn new(stream: UnixStream, peer: String) -> Result<Self> {
        let writer = stream
            .try_clone()
            .map_err(|e| TunnelError::io("unix clone", e))?;
        Ok(UnixConnection {
            reader: stream,
            writer: Mutex::new(writer),
            peer,
        })
    }
}

impl Connection for UnixConnection {
    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut header = [0u8; 2];
        (&self.reader)
            .read_exact(&mut header)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => TunnelError::Closed("unix connection"),
                _ => TunnelError::io("unix recv", e),
            })?;
        let len = u16::from_be_bytes(header) as usize;

        if len > buf.len() {
            // drain the frame so the stream stays in sync
            let mut frame = vec![0u8; len];
            (&self.reader)
                .read_exact(&mut frame)
                .map_err(|e| TunnelError::io("unix recv", e))?;
            return Err(TunnelError::PayloadTooLong {
                len,
                mtu: buf.len(),
            });
        }

        (&self.reader)
            .read_exact(&mut buf[..len])
            .map_err(|e| TunnelError::io("unix recv", e))?;
        Ok(len)
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        if buf.len() > MAX_FRAME {
            return Err(TunnelError::PayloadTooLong {
                len: buf.len(),
                mtu: MAX_FRAME,
            });
        }
        let mut frame = Vec::with_capacity(buf.len() + 2);
        frame.extend_from_slice(&(buf.len() as u16).to_be_bytes());
        frame.extend_from_slice(buf);

        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_all(&frame)
            .map_err(|e| TunnelError::io("unix send", e))?;
        Ok(buf.len())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

impl Dial for UnixTransport {
    type Conn = UnixConnection;

    fn dial(&self) -> Result<UnixConnection> {
        let stream =
            UnixStream::connect(&self.path).map_err(|e| TunnelError::io("unix connect", e))?;
        info!(path = %self.path.display(), "Unix transport dialed");
        UnixConnection::new(stream, self.path.display().to_string())
    }
}

/// Bound Unix socket. The socket file is removed on drop.
pub struct UnixAcceptor {
    listener: UnixListener,
    path: PathBuf,
    accepted: AtomicUsize,
}

impl Acceptor for UnixAcceptor {
    type Conn = UnixConnection;

    fn accept(&self) -> Result<UnixConnection> {
        let (stream, _) = self
            .listener
            .accept()
            .map_err(|e| TunnelError::io("unix accept", e))?;
        let id = self.accepted.fetch_add(1, Ordering::Relaxed);
        let peer = format!("unix#{id}");
        info!(peer = %peer, path = %self.path.display(), "Accepted connection");
        UnixConnection::new(stream, peer)
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

impl StreamListen for UnixTransport {
    type Acceptor = UnixAcceptor;

    fn listen(&self) -> Result<UnixAcceptor> {
        remove_stale_socket(&self.path)?;
        let listener =
            UnixListener::bind(&self.path).map_err(|e| TunnelError::io("unix bind", e))?;
        info!(path = %self.path.display(), "Listening on Unix socket");
        Ok(UnixAcceptor {
            listener,
            path: self.path.clone(),
            accepted: AtomicUsize::new(0),
        })
    }
}

/// Remove a leftover socket file from a previous run. Refuses to touch
/// anything that is not a socket.
fn remove_stale_socket(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(path = %path.display(), "Removing stale socket file");
            fs::remove_file(path).map_err(|e| TunnelError::io("remove stale socket", e))
        }
        Ok(_) => Err(TunnelError::Config(format!(
            "{} exists and is not a socket",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TunnelError::io("stat socket path", e)),
    }
}
