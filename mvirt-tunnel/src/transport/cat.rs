//! Manual relay transport
//!
//! An operator carries every payload by hand: writes print the payload as
//! hex and block until the operator confirms delivery, reads block until
//! the operator types a payload in. Both directions share one console. A
//! blank line always confirms a pending delivery, even when a payload
//! prompt is the one reading it.

use std::io::{self, BufRead, BufReader, Stdin, Stdout, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use tracing::debug;

use super::{Connection, DatagramListen, Dial, PacketSocket, Transport, TransportKind};
use crate::error::{Result, TunnelError};

/// How often a waiting delivery re-checks who owns the console input.
const CONFIRM_POLL: Duration = Duration::from_millis(50);

/// Operator console: line-oriented input plus prompt output.
pub struct Console<R, W> {
    input: Mutex<R>,
    output: Mutex<W>,
    /// Deliveries waiting for the operator's Enter.
    pending: AtomicUsize,
    confirm_tx: Sender<()>,
    confirm_rx: Receiver<()>,
}

fn read_line<R: BufRead>(input: &mut R) -> Result<String> {
    let mut line = String::new();
    let n = input
        .read_line(&mut line)
        .map_err(|e| TunnelError::io("console read", e))?;
    if n == 0 {
        return Err(TunnelError::Closed("console"));
    }
    Ok(line.trim().to_string())
}

impl<R: BufRead, W: Write> Console<R, W> {
    pub fn new(input: R, output: W) -> Self {
        let (confirm_tx, confirm_rx) = unbounded();
        Console {
            input: Mutex::new(input),
            output: Mutex::new(output),
            pending: AtomicUsize::new(0),
            confirm_tx,
            confirm_rx,
        }
    }

    fn print(&self, text: &str) -> Result<()> {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        output
            .write_all(text.as_bytes())
            .and_then(|()| output.flush())
            .map_err(|e| TunnelError::io("console write", e))
    }

    /// Print `prompt` and return the trimmed answer.
    pub fn ask(&self, prompt: &str) -> Result<String> {
        self.print(prompt)?;
        let mut input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        read_line(&mut *input)
    }

    /// Take one pending delivery, if any.
    fn claim_pending(&self) -> bool {
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Ask for a hex payload until the operator enters a valid one.
    pub fn read_payload(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            self.print("Packet contents: ")?;
            let (line, confirmed) = {
                let mut input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
                let line = read_line(&mut *input)?;
                // claimed under the input lock, see `confirm_with`
                let confirmed = line.is_empty() && self.claim_pending();
                if confirmed {
                    let _ = self.confirm_tx.send(());
                }
                (line, confirmed)
            };

            if confirmed {
                debug!("Delivery confirmed at the payload prompt");
                self.print("Delivery confirmed.\n")?;
                continue;
            }
            if line.is_empty() {
                self.print("An empty line is not a payload, try again.\n")?;
                continue;
            }

            let compact: String = line.split_whitespace().collect();
            match HEXLOWER_PERMISSIVE.decode(compact.as_bytes()) {
                Ok(payload) => {
                    let len = payload.len().min(buf.len());
                    buf[..len].copy_from_slice(&payload[..len]);
                    return Ok(len);
                }
                Err(e) => {
                    debug!(error = %e, "Operator entered invalid hex");
                    self.print(&format!("Not a hex payload ({e}), try again.\n"))?;
                }
            }
        }
    }

    /// Show `payload` for delivery to `destination` and wait for the
    /// operator's confirmation.
    pub fn relay(&self, payload: &[u8], destination: &str) -> Result<usize> {
        // counted before the prompt is visible
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.print(&format!(
            "Please fetch the cat and write the following message to {destination}: {}\n\
             Press Enter to continue when you're done.\n",
            HEXLOWER.encode(payload)
        ))?;
        loop {
            match self.input.try_lock() {
                Ok(input) => return self.confirm_with(input).map(|()| payload.len()),
                Err(TryLockError::Poisoned(poisoned)) => {
                    return self
                        .confirm_with(poisoned.into_inner())
                        .map(|()| payload.len());
                }
                // a payload prompt is reading and confirms on a blank line
                Err(TryLockError::WouldBlock) => match self.confirm_rx.recv_timeout(CONFIRM_POLL) {
                    Ok(()) => return Ok(payload.len()),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(TunnelError::Closed("console"));
                    }
                },
            }
        }
    }

    /// Confirm a delivery while holding the input.
    fn confirm_with(&self, mut input: MutexGuard<'_, R>) -> Result<()> {
        if !self.claim_pending() {
            // a payload prompt claimed it and sent before releasing the input
            return self
                .confirm_rx
                .recv()
                .map_err(|_| TunnelError::Closed("console"));
        }
        read_line(&mut *input).map(drop)
    }
}

pub struct CatTransport<R = BufReader<Stdin>, W = Stdout> {
    local_name: String,
    remote_name: String,
    console: Arc<Console<R, W>>,
}

impl CatTransport {
    pub fn new(local_name: &str, remote_name: &str) -> Self {
        Self::with_console(
            local_name,
            remote_name,
            Console::new(BufReader::new(io::stdin()), io::stdout()),
        )
    }
}

impl<R, W> CatTransport<R, W> {
    pub fn with_console(local_name: &str, remote_name: &str, console: Console<R, W>) -> Self {
        CatTransport {
            local_name: local_name.to_string(),
            remote_name: remote_name.to_string(),
            console: Arc::new(console),
        }
    }
}

impl<R: BufRead + Send, W: Write + Send> Transport for CatTransport<R, W> {
    fn kind(&self) -> TransportKind {
        TransportKind::Cat
    }

    fn endpoint_ip(&self) -> Option<IpAddr> {
        None
    }
}

/// Client side: every payload goes to the configured remote name.
pub struct CatConnection<R, W> {
    console: Arc<Console<R, W>>,
    remote_name: String,
}

impl<R, W> Connection for CatConnection<R, W>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.console.read_payload(buf)
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        self.console.relay(buf, &self.remote_name)
    }

    fn peer(&self) -> String {
        self.remote_name.clone()
    }
}

impl<R, W> Dial for CatTransport<R, W>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    type Conn = CatConnection<R, W>;

    fn dial(&self) -> Result<CatConnection<R, W>> {
        debug!(local = %self.local_name, remote = %self.remote_name, "Cat transport dialed");
        Ok(CatConnection {
            console: Arc::clone(&self.console),
            remote_name: self.remote_name.clone(),
        })
    }
}

/// Server side: the operator names the source of every payload.
pub struct CatListener<R, W> {
    console: Arc<Console<R, W>>,
}

impl<R, W> PacketSocket for CatListener<R, W>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    type Addr = String;

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, String)> {
        let source = self.console.ask("Packet source: ")?;
        let n = self.console.read_payload(buf)?;
        Ok((n, source))
    }

    fn send_to(&self, buf: &[u8], addr: &String) -> Result<usize> {
        self.console.relay(buf, addr)
    }
}

impl<R, W> DatagramListen for CatTransport<R, W>
where
    R: BufRead + Send + 'static,
    W: Write + Send + 'static,
{
    type Socket = CatListener<R, W>;

    fn listen(&self) -> Result<CatListener<R, W>> {
        if self.local_name.trim().is_empty() {
            return Err(TunnelError::Config("empty cat server name".into()));
        }
        debug!(local = %self.local_name, "Cat transport listening");
        Ok(CatListener {
            console: Arc::clone(&self.console),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::os::unix::net::UnixStream;
    use std::thread;

    /// Output sink the test can inspect after handing it to the console.
    #[derive(Clone, Default)]
    struct Transcript(Arc<Mutex<Vec<u8>>>);

    impl Write for Transcript {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transcript {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn transport(input: &str) -> (CatTransport<Cursor<Vec<u8>>, Transcript>, Transcript) {
        let transcript = Transcript::default();
        let console = Console::new(Cursor::new(input.as_bytes().to_vec()), transcript.clone());
        (
            CatTransport::with_console("server", "client-a", console),
            transcript,
        )
    }

    #[test]
    fn test_client_send_waits_for_confirmation() {
        let (transport, transcript) = transport("\n");
        let conn = transport.dial().unwrap();

        assert_eq!(conn.send(&[0x01, 0x00]).unwrap(), 2);
        let text = transcript.text();
        assert!(text.contains("write the following message to client-a: 0100"));

        // no confirmation left: the console is gone
        assert!(matches!(conn.send(&[0x01]), Err(TunnelError::Closed("console"))));
    }

    #[test]
    fn test_invalid_hex_is_asked_again() {
        let (transport, transcript) = transport("zz\n45 00 00 1C\n");
        let conn = transport.dial().unwrap();

        let mut buf = [0u8; 16];
        let n = conn.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x45, 0x00, 0x00, 0x1c]);
        assert!(transcript.text().contains("try again"));
    }

    #[test]
    fn test_server_reads_source_then_contents() {
        let (transport, transcript) = transport("client-a\n0101\n");
        let listener = DatagramListen::listen(&transport).unwrap();

        let mut buf = [0u8; 16];
        let (n, source) = listener.recv_from(&mut buf).unwrap();
        assert_eq!(source, "client-a");
        assert_eq!(&buf[..n], &[0x01, 0x01]);

        let text = transcript.text();
        let source_prompt = text.find("Packet source: ").unwrap();
        let contents_prompt = text.find("Packet contents: ").unwrap();
        assert!(source_prompt < contents_prompt);
    }

    #[test]
    fn test_blank_line_confirms_delivery_at_payload_prompt() {
        let (feed, input) = UnixStream::pair().unwrap();
        let transcript = Transcript::default();
        let console = Arc::new(Console::new(BufReader::new(input), transcript.clone()));
        let wait_for = |text: &str| {
            while !transcript.text().contains(text) {
                thread::sleep(Duration::from_millis(10));
            }
        };

        let reader = {
            let console = Arc::clone(&console);
            thread::spawn(move || {
                let mut buf = [0u8; 16];
                let n = console.read_payload(&mut buf).unwrap();
                buf[..n].to_vec()
            })
        };
        wait_for("Packet contents: ");
        // the payload prompt is now blocked reading
        thread::sleep(Duration::from_millis(100));

        let delivery = {
            let console = Arc::clone(&console);
            thread::spawn(move || console.relay(&[0x01, 0x01], "client-a").unwrap())
        };
        wait_for("Press Enter");

        (&feed).write_all(b"\n").unwrap();
        assert_eq!(delivery.join().unwrap(), 2);

        (&feed).write_all(b"0100\n").unwrap();
        assert_eq!(reader.join().unwrap(), [0x01, 0x00]);
        assert!(transcript.text().contains("Delivery confirmed."));
    }

    #[test]
    fn test_blank_line_is_not_a_payload() {
        let (transport, transcript) = transport("\n4500\n");
        let conn = transport.dial().unwrap();

        let mut buf = [0u8; 16];
        let n = conn.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x45, 0x00]);
        assert!(transcript.text().contains("not a payload"));
    }

    #[test]
    fn test_server_needs_a_name() {
        let console = Console::new(Cursor::new(Vec::new()), Transcript::default());
        let transport = CatTransport::with_console(" ", "client", console);
        assert!(matches!(
            DatagramListen::listen(&transport),
            Err(TunnelError::Config(_))
        ));
    }
}
