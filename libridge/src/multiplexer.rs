//! Serial side of the bridge.
//!
//! On IoT-LAB every node's serial console is reachable as a TCP socket
//! (port 20000 on a host named after the node). `TcpSerialMultiplexer` keeps
//! one connection task per node and merges their lines into a single stream.

use crate::error::{BridgeError, Result};
use crate::models::SerialLine;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Port the testbed exposes node serial consoles on
pub const DEFAULT_SERIAL_PORT: u16 = 20000;

/// Writes waiting for a node's socket; more are dropped
const WRITE_QUEUE: usize = 64;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Line source/sink keyed by internal node id
pub trait LineMultiplexer: Send + Sync {
    /// Starts reading; every line is delivered on `lines` with its trailing
    /// `\n` removed.
    fn start(&self, lines: mpsc::Sender<SerialLine>) -> Result<()>;

    /// Best-effort write of `data` to each node, never waiting on a socket.
    /// Unknown nodes are ignored; data for a node whose link is down is dropped.
    fn send(&self, nodes: &[String], data: &str) -> Result<()>;

    /// Stops reading and releases connections. Calling it again is a no-op.
    fn stop(&self) -> Result<()>;
}

pub struct TcpSerialMultiplexer {
    nodes: BTreeSet<String>,
    port: u16,
    reconnect_delay: Duration,
    running: Mutex<Option<Links>>,
}

/// Per-node write queues and connection tasks of a started multiplexer
struct Links {
    writers: HashMap<String, NodeWriter>,
    tasks: Vec<JoinHandle<()>>,
}

struct NodeWriter {
    queue: mpsc::Sender<Vec<u8>>,
    /// Set while the node's socket is connected
    up: Arc<AtomicBool>,
}

impl TcpSerialMultiplexer {
    pub fn new(nodes: BTreeSet<String>, port: u16, reconnect_delay: Duration) -> Self {
        Self {
            nodes,
            port,
            reconnect_delay,
            running: Mutex::new(None),
        }
    }

    fn address(&self, node: &str) -> String {
        format!("{node}:{}", self.port)
    }

    /// True while the serial link of `node` is up
    pub fn is_connected(&self, node: &str) -> bool {
        self.running
            .lock()
            .as_ref()
            .and_then(|links| links.writers.get(node))
            .is_some_and(|writer| writer.up.load(Ordering::Acquire))
    }
}

impl LineMultiplexer for TcpSerialMultiplexer {
    fn start(&self, lines: mpsc::Sender<SerialLine>) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(BridgeError::InvalidState("multiplexer already running"));
        }

        let mut links = Links {
            writers: HashMap::with_capacity(self.nodes.len()),
            tasks: Vec::with_capacity(self.nodes.len()),
        };
        for node in &self.nodes {
            let (queue, outgoing) = mpsc::channel(WRITE_QUEUE);
            let up = Arc::new(AtomicBool::new(false));
            let link = NodeLink {
                node: node.clone(),
                address: self.address(node),
                reconnect_delay: self.reconnect_delay,
                up: up.clone(),
            };
            links.tasks.push(task::spawn(link.run(outgoing, lines.clone())));
            links.writers.insert(node.clone(), NodeWriter { queue, up });
        }

        info!(nodes = self.nodes.len(), port = self.port, "serial multiplexer started");
        *running = Some(links);
        Ok(())
    }

    fn send(&self, nodes: &[String], data: &str) -> Result<()> {
        let running = self.running.lock();
        let links = running
            .as_ref()
            .ok_or_else(|| BridgeError::Multiplexer("multiplexer is not running".into()))?;

        for node in nodes {
            let Some(writer) = links.writers.get(node) else {
                debug!(node = %node, "not a managed node, ignoring send");
                continue;
            };
            if !writer.up.load(Ordering::Acquire) {
                warn!(node = %node, "serial link down, data dropped");
                continue;
            }
            match writer.queue.try_send(data.as_bytes().to_vec()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(node = %node, "serial write queue full, data dropped")
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(node = %node, "serial link task is gone, data dropped")
                }
            }
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let Some(links) = self.running.lock().take() else {
            return Ok(());
        };
        for handle in links.tasks {
            handle.abort();
        }
        info!("serial multiplexer stopped");
        Ok(())
    }
}

impl Drop for TcpSerialMultiplexer {
    fn drop(&mut self) {
        if let Some(links) = self.running.get_mut().take() {
            links.tasks.iter().for_each(JoinHandle::abort);
        }
    }
}

/// Why a connection to a node ended
enum LinkEnd {
    /// Peer closed or I/O failed: reconnect
    Lost(Option<std::io::Error>),
    /// Bridge side went away: exit the task
    Shutdown,
}

struct NodeLink {
    node: String,
    address: String,
    reconnect_delay: Duration,
    up: Arc<AtomicBool>,
}

impl NodeLink {
    async fn run(
        self,
        mut outgoing: mpsc::Receiver<Vec<u8>>,
        lines: mpsc::Sender<SerialLine>,
    ) {
        loop {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address)).await {
                Ok(Ok(stream)) => {
                    // writes racing the previous link loss are stale now
                    let mut stale = 0usize;
                    while outgoing.try_recv().is_ok() {
                        stale += 1;
                    }
                    if stale > 0 {
                        debug!(node = %self.node, stale, "discarded writes queued before reconnect");
                    }

                    info!(node = %self.node, address = %self.address, "serial link up");
                    self.up.store(true, Ordering::Release);
                    let end = self.serve(stream, &mut outgoing, &lines).await;
                    self.up.store(false, Ordering::Release);
                    match end {
                        LinkEnd::Shutdown => return,
                        LinkEnd::Lost(Some(e)) => {
                            warn!(node = %self.node, error = %e, "serial link failed")
                        }
                        LinkEnd::Lost(None) => warn!(node = %self.node, "serial link closed by node"),
                    }
                }
                Ok(Err(e)) => {
                    warn!(node = %self.node, address = %self.address, error = %e, "cannot reach serial port")
                }
                Err(_) => {
                    warn!(node = %self.node, address = %self.address, timeout = ?CONNECT_TIMEOUT, "serial port connect timed out")
                }
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn serve(
        &self,
        stream: TcpStream,
        outgoing: &mut mpsc::Receiver<Vec<u8>>,
        lines: &mpsc::Sender<SerialLine>,
    ) -> LinkEnd {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        // partial reads stay here if the write branch wins the select
        let mut buf = Vec::new();

        loop {
            tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => {
                    match read {
                        Ok(0) => return LinkEnd::Lost(None),
                        Ok(_) => {}
                        Err(e) => return LinkEnd::Lost(Some(e)),
                    }
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    let line = SerialLine::new(self.node.as_str(), String::from_utf8_lossy(&buf));
                    buf.clear();
                    if lines.send(line).await.is_err() {
                        return LinkEnd::Shutdown;
                    }
                }
                data = outgoing.recv() => {
                    let Some(data) = data else {
                        return LinkEnd::Shutdown;
                    };
                    if let Err(e) = write_half.write_all(&data).await {
                        return LinkEnd::Lost(Some(e));
                    }
                }
            }
        }
    }
}
