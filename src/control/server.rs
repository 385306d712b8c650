//! Remote control endpoint.
//!
//! Paired TCP sockets: publish on port `P`, request/response on `P + 1`.
//! Messages are UTF-8 JSON text behind a `u32` big-endian length prefix
//! (the transport's message boundary); the endpoint is stateless per
//! message. Requests drain through a fixed-size worker pool fed by a
//! blocking queue; shutdown enqueues one null sentinel per worker.
//!
//! The request protocol operates a registry of named block variables:
//!
//! ```json
//! {"cmd": "get",  "path": "Top.Adc.Gain"}
//! {"cmd": "set",  "path": "Top.Adc.Gain", "value": 12}
//! {"cmd": "list"}
//! ```
//!
//! A successful `set` publishes an unsolicited update notification to
//! every subscriber on the publish port.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{DaqError, Result};
use crate::memory::{Block, Model, Variable};

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 4;

/// Per-connection socket read timeout; keeps workers stoppable.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Accept poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Request size cap.
const MAX_MESSAGE: u32 = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct Request {
    cmd: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    value: Option<Value>,
}

struct Registry {
    entries: HashMap<String, (Arc<Block>, Arc<Variable>)>,
}

struct ServerShared {
    registry: Mutex<Registry>,
    subscribers: Mutex<Vec<TcpStream>>,
    stop: AtomicBool,
}

/// Request/response + publish channel for remote interaction.
pub struct ControlServer {
    shared: Arc<ServerShared>,
    work_tx: Sender<Option<TcpStream>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    acceptors: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl ControlServer {
    /// Bind the publish socket on `port` and the request socket on
    /// `port + 1`, then start the worker pool.
    pub fn bind(addr: &str, port: u16, workers: usize) -> Result<Arc<Self>> {
        let publish = TcpListener::bind((addr, port)).map_err(|_| DaqError::Open {
            path: format!("{addr}:{port}"),
            mask: 0,
        })?;
        let request = TcpListener::bind((addr, port + 1)).map_err(|_| DaqError::Open {
            path: format!("{}:{}", addr, port + 1),
            mask: 0,
        })?;
        publish.set_nonblocking(true)?;
        request.set_nonblocking(true)?;

        let shared = Arc::new(ServerShared {
            registry: Mutex::new(Registry {
                entries: HashMap::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        });

        let worker_count = workers.max(1);
        let (work_tx, work_rx) = unbounded::<Option<TcpStream>>();

        let mut worker_handles = Vec::with_capacity(worker_count);
        for n in 0..worker_count {
            let shared = shared.clone();
            let rx: Receiver<Option<TcpStream>> = work_rx.clone();
            worker_handles.push(
                std::thread::Builder::new()
                    .name(format!("control-worker-{n}"))
                    .spawn(move || run_worker(shared, rx))?,
            );
        }

        let mut acceptors = Vec::new();
        let req_shared = shared.clone();
        let req_tx = work_tx.clone();
        acceptors.push(
            std::thread::Builder::new()
                .name("control-request-accept".to_string())
                .spawn(move || run_request_accept(req_shared, request, req_tx))?,
        );
        let pub_shared = shared.clone();
        acceptors.push(
            std::thread::Builder::new()
                .name("control-publish-accept".to_string())
                .spawn(move || run_publish_accept(pub_shared, publish))?,
        );

        Ok(Arc::new(Self {
            shared,
            work_tx,
            workers: Mutex::new(worker_handles),
            acceptors: Mutex::new(acceptors),
            worker_count,
        }))
    }

    /// Register a block variable under `path`.
    pub fn add_variable(&self, path: &str, block: Arc<Block>, var: Arc<Variable>) -> Result<()> {
        let mut registry = self.shared.registry.lock().unwrap();
        if registry.entries.contains_key(path) {
            return Err(DaqError::Unsupported(format!(
                "path already registered: {path}"
            )));
        }
        registry.entries.insert(path.to_string(), (block, var));
        Ok(())
    }

    /// Publish an unsolicited notification to every subscriber.
    pub fn publish(&self, text: &str) {
        self.shared.publish(text);
    }

    /// Connected subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().unwrap().len()
    }

    /// Stop acceptors and workers; wake each worker with a null item.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        for _ in 0..self.worker_count {
            let _ = self.work_tx.send(None);
        }
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        for handle in self.acceptors.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ServerShared {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn publish(&self, text: &str) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain_mut(|stream| write_message(stream, text.as_bytes()).is_ok());
    }

    fn handle(&self, request: &str) -> String {
        match self.dispatch(request) {
            Ok(value) => value.to_string(),
            Err(e) => json!({"status": "error", "message": e.to_string()}).to_string(),
        }
    }

    fn dispatch(&self, request: &str) -> Result<Value> {
        let request: Request = serde_json::from_str(request)?;
        match request.cmd.as_str() {
            "list" => {
                let registry = self.registry.lock().unwrap();
                let mut paths: Vec<&String> = registry.entries.keys().collect();
                paths.sort();
                Ok(json!({"status": "ok", "paths": paths}))
            }
            "get" => {
                let (block, var) = self.lookup(request.path.as_deref())?;
                let value = read_value(&block, &var)?;
                Ok(json!({"status": "ok", "value": value}))
            }
            "set" => {
                let (block, var) = self.lookup(request.path.as_deref())?;
                let value = request
                    .value
                    .ok_or_else(|| DaqError::Protocol("set without value".to_string()))?;
                write_value(&block, &var, &value)?;
                let path = request.path.expect("lookup required a path");
                self.publish(&json!({"path": path, "value": value}).to_string());
                Ok(json!({"status": "ok"}))
            }
            other => Err(DaqError::Protocol(format!("unknown command {other}"))),
        }
    }

    fn lookup(&self, path: Option<&str>) -> Result<(Arc<Block>, Arc<Variable>)> {
        let path = path.ok_or_else(|| DaqError::Protocol("missing path".to_string()))?;
        self.registry
            .lock()
            .unwrap()
            .entries
            .get(path)
            .cloned()
            .ok_or_else(|| DaqError::Unsupported(format!("unknown path {path}")))
    }
}

fn read_value(block: &Block, var: &Variable) -> Result<Value> {
    Ok(match var.model() {
        Model::UInt => json!(block.get_uint(var)?),
        Model::Int => json!(block.get_int(var)?),
        Model::Bool => json!(block.get_bool(var)?),
        Model::Float => json!(block.get_float(var)?),
        Model::Double => json!(block.get_double(var)?),
        Model::Fixed => json!(block.get_fixed(var)?),
        Model::String => json!(block.get_string(var)?),
        Model::Bytes | Model::Opaque => json!(block.get_bytes(var)?),
    })
}

fn write_value(block: &Block, var: &Variable, value: &Value) -> Result<()> {
    match var.model() {
        Model::UInt => {
            let v = value
                .as_u64()
                .ok_or_else(|| DaqError::Protocol("expected unsigned integer".to_string()))?;
            block.set_uint(var, v)?;
        }
        Model::Int => {
            let v = value
                .as_i64()
                .ok_or_else(|| DaqError::Protocol("expected integer".to_string()))?;
            block.set_int(var, v)?;
        }
        Model::Bool => {
            let v = value
                .as_bool()
                .ok_or_else(|| DaqError::Protocol("expected bool".to_string()))?;
            block.set_bool(var, v)?;
        }
        Model::Float => {
            let v = value
                .as_f64()
                .ok_or_else(|| DaqError::Protocol("expected number".to_string()))?;
            block.set_float(var, v as f32)?;
        }
        Model::Double => {
            let v = value
                .as_f64()
                .ok_or_else(|| DaqError::Protocol("expected number".to_string()))?;
            block.set_double(var, v)?;
        }
        Model::Fixed => {
            let v = value
                .as_f64()
                .ok_or_else(|| DaqError::Protocol("expected number".to_string()))?;
            block.set_fixed(var, v)?;
        }
        Model::String => {
            let v = value
                .as_str()
                .ok_or_else(|| DaqError::Protocol("expected string".to_string()))?;
            block.set_string(var, v)?;
        }
        Model::Bytes | Model::Opaque => {
            let bytes: Vec<u8> = value
                .as_array()
                .ok_or_else(|| DaqError::Protocol("expected byte array".to_string()))?
                .iter()
                .map(|v| {
                    v.as_u64()
                        .filter(|&b| b <= 255)
                        .map(|b| b as u8)
                        .ok_or_else(|| DaqError::Protocol("expected byte array".to_string()))
                })
                .collect::<Result<_>>()?;
            block.set_bytes(var, &bytes)?;
        }
    }
    block.flush()
}

/// Write one length-prefixed message.
pub fn write_message(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}

/// Read one length-prefixed message; `Ok(None)` on clean EOF.
pub fn read_message(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match stream.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len);
    if len > MAX_MESSAGE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "control message too large",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok(Some(payload))
}

fn run_request_accept(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    work_tx: Sender<Option<TcpStream>>,
) {
    while !shared.stopped() {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "control client connected");
                if work_tx.send(Some(stream)).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                tracing::warn!(error = %e, "request accept failed");
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn run_publish_accept(shared: Arc<ServerShared>, listener: TcpListener) {
    while !shared.stopped() {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "subscriber connected");
                shared.subscribers.lock().unwrap().push(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                tracing::warn!(error = %e, "publish accept failed");
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Worker loop: serve one request connection at a time until the null
/// sentinel arrives.
fn run_worker(shared: Arc<ServerShared>, rx: Receiver<Option<TcpStream>>) {
    loop {
        let Ok(Some(mut stream)) = rx.recv() else {
            // Null work item or closed queue: shut down.
            return;
        };
        if stream.set_read_timeout(Some(READ_TIMEOUT)).is_err() {
            continue;
        }
        loop {
            if shared.stopped() {
                return;
            }
            match read_message(&mut stream) {
                Ok(Some(payload)) => {
                    let request = String::from_utf8_lossy(&payload);
                    let response = shared.handle(&request);
                    if write_message(&mut stream, response.as_bytes()).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "control connection dropped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RamSlave;
    use std::sync::atomic::AtomicU16;

    fn next_port() -> u16 {
        static NEXT: AtomicU16 = AtomicU16::new(0);
        let slot = NEXT.fetch_add(2, Ordering::Relaxed);
        30000 + (std::process::id() % 1000) as u16 * 20 + slot
    }

    fn server_with_gain(port: u16) -> Arc<ControlServer> {
        let server = ControlServer::bind("127.0.0.1", port, 2).unwrap();
        let ram = RamSlave::new(0, 64, 4, 64);
        let block = Arc::new(Block::new(ram, 0).unwrap());
        let var = Variable::builder("Gain", Model::UInt)
            .field(0, 16)
            .build()
            .unwrap();
        block.add_variable(var.clone()).unwrap();
        server.add_variable("Top.Gain", block, var).unwrap();
        server
    }

    fn request(stream: &mut TcpStream, body: &str) -> Value {
        write_message(stream, body.as_bytes()).unwrap();
        let reply = read_message(stream).unwrap().unwrap();
        serde_json::from_slice(&reply).unwrap()
    }

    #[test]
    fn test_set_get_list_round_trip() {
        let port = next_port();
        let server = server_with_gain(port);
        let mut stream = TcpStream::connect(("127.0.0.1", port + 1)).unwrap();

        let reply = request(&mut stream, r#"{"cmd":"list"}"#);
        assert_eq!(reply["status"], "ok");
        assert_eq!(reply["paths"][0], "Top.Gain");

        let reply = request(&mut stream, r#"{"cmd":"set","path":"Top.Gain","value":42}"#);
        assert_eq!(reply["status"], "ok");

        let reply = request(&mut stream, r#"{"cmd":"get","path":"Top.Gain"}"#);
        assert_eq!(reply["status"], "ok");
        assert_eq!(reply["value"], 42);

        server.stop();
    }

    #[test]
    fn test_unknown_path_and_bad_json() {
        let port = next_port();
        let server = server_with_gain(port);
        let mut stream = TcpStream::connect(("127.0.0.1", port + 1)).unwrap();

        let reply = request(&mut stream, r#"{"cmd":"get","path":"Nope"}"#);
        assert_eq!(reply["status"], "error");

        let reply = request(&mut stream, "not json at all");
        assert_eq!(reply["status"], "error");

        server.stop();
    }

    #[test]
    fn test_set_publishes_update() {
        let port = next_port();
        let server = server_with_gain(port);

        let mut subscriber = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // Wait for the accept loop to register the subscriber.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while server.subscriber_count() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.subscriber_count(), 1);

        let mut stream = TcpStream::connect(("127.0.0.1", port + 1)).unwrap();
        let reply = request(&mut stream, r#"{"cmd":"set","path":"Top.Gain","value":7}"#);
        assert_eq!(reply["status"], "ok");

        let update = read_message(&mut subscriber).unwrap().unwrap();
        let update: Value = serde_json::from_slice(&update).unwrap();
        assert_eq!(update["path"], "Top.Gain");
        assert_eq!(update["value"], 7);

        server.stop();
    }

    #[test]
    fn test_stop_wakes_idle_workers() {
        let port = next_port();
        let server = ControlServer::bind("127.0.0.1", port, 4).unwrap();
        // No connections at all: stop must still return promptly.
        server.stop();
    }
}
