//! TCP frame bridge.
//!
//! Tunnels stream frames between two hosts over a pull/push socket pair.
//! The server side binds pull = `port` and push = `port + 1`; a client
//! connects the mirror image, so each side's push feeds the other's pull.
//! Dropped connections reconnect with exponential backoff capped at 2 s;
//! a partial frame caught mid-transfer is flushed downstream with its
//! error bits set.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::bridge::wire::{encode_frame, FrameAssembler};
use crate::error::{DaqError, Result};
use crate::stream::{Frame, Master, Slave};

/// Reconnect backoff floor.
const BACKOFF_START: Duration = Duration::from_millis(100);
/// Reconnect backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(2);
/// Socket read timeout; keeps the reader responsive to shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Poll interval for non-blocking accepts and interruptible sleeps.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default connect timeout for on-demand client dials.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

struct BridgeShared {
    addr: String,
    port: u16,
    server: bool,
    master: Master,
    tx: Mutex<Option<TcpStream>>,
    timeout: Mutex<Duration>,
    stop: AtomicBool,
}

impl BridgeShared {
    fn timeout(&self) -> Duration {
        *self.timeout.lock().unwrap()
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Sleep in small slices so shutdown is not held up by backoff.
    fn sleep(&self, dur: Duration) {
        let deadline = Instant::now() + dur;
        while !self.stopped() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return;
            };
            std::thread::sleep(remaining.min(POLL_INTERVAL));
        }
    }
}

/// Combined stream Master+Slave tunnelling frames over TCP.
pub struct TcpBridge {
    shared: Arc<BridgeShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpBridge {
    /// Open a bridge endpoint.
    ///
    /// Server mode binds both listeners immediately and fails with
    /// [`DaqError::Open`] when a port is taken; client mode starts its
    /// reconnect loops and dials the push side on demand.
    pub fn open(addr: &str, port: u16, server: bool) -> Result<Arc<Self>> {
        let shared = Arc::new(BridgeShared {
            addr: addr.to_string(),
            port,
            server,
            master: Master::new(),
            tx: Mutex::new(None),
            timeout: Mutex::new(DEFAULT_TIMEOUT),
            stop: AtomicBool::new(false),
        });

        let mut threads = Vec::new();
        if server {
            let pull = TcpListener::bind((addr, port)).map_err(|_| DaqError::Open {
                path: format!("{addr}:{port}"),
                mask: 0,
            })?;
            let push = TcpListener::bind((addr, port + 1)).map_err(|_| DaqError::Open {
                path: format!("{}:{}", addr, port + 1),
                mask: 0,
            })?;
            pull.set_nonblocking(true)?;
            push.set_nonblocking(true)?;

            let rx_shared = shared.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("bridge-pull".to_string())
                    .spawn(move || run_pull_server(rx_shared, pull))?,
            );
            let tx_shared = shared.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("bridge-push-accept".to_string())
                    .spawn(move || run_push_accept(tx_shared, push))?,
            );
        } else {
            let rx_shared = shared.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("bridge-pull".to_string())
                    .spawn(move || run_pull_client(rx_shared))?,
            );
        }

        Ok(Arc::new(Self {
            shared,
            threads: Mutex::new(threads),
        }))
    }

    /// Connect the sink receiving frames arriving from the remote side.
    pub fn set_slave(&self, slave: Arc<dyn Slave>) {
        self.shared.master.set_slave(slave);
    }

    /// Budget for on-demand push dials.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.shared.timeout.lock().unwrap() = timeout.max(Duration::from_millis(1));
    }

    /// True while a push peer is connected.
    pub fn is_connected(&self) -> bool {
        self.shared.tx.lock().unwrap().is_some()
    }

    /// Stop the bridge threads and wait for them.
    pub fn close(&self) {
        self.shared.stop.store(true, Ordering::Release);
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpBridge {
    fn drop(&mut self) {
        self.close();
    }
}

impl Slave for TcpBridge {
    fn accept_frame(&self, frame: Frame) -> Result<()> {
        let shared = &self.shared;
        let bytes = encode_frame(&frame);

        let mut tx = shared.tx.lock().unwrap();
        if tx.is_none() {
            if shared.server {
                // No subscriber yet; nothing to carry the frame.
                tracing::warn!(payload = frame.payload(), "push side down, dropping frame");
                return Ok(());
            }
            *tx = Some(dial_push(shared)?);
        }

        let stream = tx.as_mut().expect("connected above");
        match stream.write_all(&bytes).and_then(|_| stream.flush()) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Peer went away; the next send redials.
                *tx = None;
                tracing::warn!(error = %e, "push write failed");
                Err(DaqError::Io(e))
            }
        }
    }
}

/// Dial the remote pull socket within the configured budget.
fn dial_push(shared: &BridgeShared) -> Result<TcpStream> {
    let timeout = shared.timeout();
    let deadline = Instant::now() + timeout;
    let mut backoff = BACKOFF_START;
    loop {
        if shared.stopped() {
            return Err(DaqError::Canceled);
        }
        match TcpStream::connect((shared.addr.as_str(), shared.port)) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => {
                if Instant::now() + backoff >= deadline {
                    tracing::warn!(error = %e, "push dial failed");
                    return Err(DaqError::Timeout(timeout));
                }
                shared.sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
}

/// Server-side push accept loop: the latest subscriber wins.
fn run_push_accept(shared: Arc<BridgeShared>, listener: TcpListener) {
    while !shared.stopped() {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "push subscriber connected");
                let _ = stream.set_nodelay(true);
                *shared.tx.lock().unwrap() = Some(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                tracing::warn!(error = %e, "push accept failed");
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Server-side pull loop: accept one publisher at a time and drain it.
fn run_pull_server(shared: Arc<BridgeShared>, listener: TcpListener) {
    while !shared.stopped() {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "pull publisher connected");
                drain_pull(&shared, stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                tracing::warn!(error = %e, "pull accept failed");
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Client-side pull loop: reconnect with exponential backoff.
fn run_pull_client(shared: Arc<BridgeShared>) {
    let mut backoff = BACKOFF_START;
    while !shared.stopped() {
        match TcpStream::connect((shared.addr.as_str(), shared.port + 1)) {
            Ok(stream) => {
                backoff = BACKOFF_START;
                drain_pull(&shared, stream);
            }
            Err(_) => {
                shared.sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
}

/// Read one pull connection to exhaustion, emitting reassembled frames.
fn drain_pull(shared: &BridgeShared, stream: TcpStream) {
    if stream.set_read_timeout(Some(READ_TIMEOUT)).is_err() {
        return;
    }
    let mut stream = stream;
    let mut asm = FrameAssembler::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        if shared.stopped() {
            return;
        }
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => match asm.push(&buf[..n]) {
                Ok(frames) => {
                    for frame in frames {
                        if let Err(e) = shared.master.send_frame(frame) {
                            tracing::warn!(error = %e, "downstream rejected bridged frame");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed bridge stream");
                    break;
                }
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "pull read failed");
                break;
            }
        }
    }

    // Connection gone: surface what was in flight rather than losing it
    // silently.
    if let Some(partial) = asm.take_partial() {
        let _ = shared.master.send_frame(partial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::Recorder;
    use std::sync::atomic::AtomicU16;

    /// Even base ports high in the dynamic range, two per test.
    fn next_port() -> u16 {
        static NEXT: AtomicU16 = AtomicU16::new(0);
        let slot = NEXT.fetch_add(2, Ordering::Relaxed);
        40000 + (std::process::id() % 1000) as u16 * 20 + slot
    }

    fn payload_frame(channel: u8, data: &[u8]) -> Frame {
        let mut frame = Frame::heap(data.len());
        frame.write_bytes(0, data).unwrap();
        frame.set_channel(channel);
        frame
    }

    #[test]
    fn test_client_to_server_frames() {
        let port = next_port();
        let server = TcpBridge::open("127.0.0.1", port, true).unwrap();
        let client = TcpBridge::open("127.0.0.1", port, false).unwrap();

        let rec = Recorder::new();
        server.set_slave(rec.clone());

        client.accept_frame(payload_frame(3, &[1, 2, 3])).unwrap();
        client.accept_frame(payload_frame(3, &[4, 5])).unwrap();

        assert!(rec.wait_for(2, Duration::from_secs(5)));
        let frames = rec.frames();
        assert_eq!(frames[0].channel, 3);
        assert_eq!(frames[0].data, vec![1, 2, 3]);
        assert_eq!(frames[1].data, vec![4, 5], "per-channel order preserved");

        client.close();
        server.close();
    }

    #[test]
    fn test_server_to_client_frames() {
        let port = next_port();
        let server = TcpBridge::open("127.0.0.1", port, true).unwrap();
        let client = TcpBridge::open("127.0.0.1", port, false).unwrap();

        let rec = Recorder::new();
        client.set_slave(rec.clone());

        // Wait for the client's pull loop to subscribe.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !server.is_connected() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(server.is_connected());

        server.accept_frame(payload_frame(7, b"downlink")).unwrap();
        assert!(rec.wait_for(1, Duration::from_secs(5)));
        assert_eq!(rec.frames()[0].data, b"downlink");

        client.close();
        server.close();
    }

    #[test]
    fn test_server_drops_frames_without_subscriber() {
        let port = next_port();
        let server = TcpBridge::open("127.0.0.1", port, true).unwrap();
        // No client: the frame has nowhere to go but the call succeeds.
        server.accept_frame(payload_frame(0, &[1])).unwrap();
        server.close();
    }

    #[test]
    fn test_client_dial_timeout() {
        let port = next_port();
        let client = TcpBridge::open("127.0.0.1", port, false).unwrap();
        client.set_timeout(Duration::from_millis(50));

        let result = client.accept_frame(payload_frame(0, &[1]));
        assert!(matches!(result, Err(DaqError::Timeout(_))));
        client.close();
    }
}
