/*!
Mock serial multiplexer for bridge tests

Implements `LineMultiplexer` in memory. Writes aimed at nodes are recorded;
tests emit node output with `emit_line`.
*/

use anyhow::{anyhow, Result};
use libridge::error::BridgeError;
use libridge::{LineMultiplexer, SerialLine};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One `send` call as the session issued it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub nodes: Vec<String>,
    pub data: String,
}

#[derive(Clone, Default)]
pub struct MockMultiplexer {
    state: Arc<MuxState>,
}

#[derive(Default)]
struct MuxState {
    lines: Mutex<Option<mpsc::Sender<SerialLine>>>,
    sent: Mutex<Vec<SentCommand>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
}

impl MockMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.fail_start.store(fail, Ordering::SeqCst);
    }

    /// `stop` still shuts down but reports an error
    pub fn fail_stop(&self, fail: bool) {
        self.state.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Simulates `node` printing `line` on its serial port
    pub async fn emit_line(&self, node: &str, line: &str) -> Result<()> {
        let sender = self
            .state
            .lines
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("mock multiplexer is not running"))?;
        sender
            .send(SerialLine::new(node, line))
            .await
            .map_err(|_| anyhow!("session no longer reads serial lines"))
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.state.sent.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.lines.lock().is_some()
    }

    pub fn start_count(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }
}

impl LineMultiplexer for MockMultiplexer {
    fn start(&self, lines: mpsc::Sender<SerialLine>) -> libridge::Result<()> {
        if self.state.fail_start.load(Ordering::SeqCst) {
            return Err(BridgeError::Multiplexer("mock multiplexer failed to start".into()));
        }
        *self.state.lines.lock() = Some(lines);
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, nodes: &[String], data: &str) -> libridge::Result<()> {
        if self.state.lines.lock().is_none() {
            return Err(BridgeError::Multiplexer("not running".into()));
        }
        self.state.sent.lock().push(SentCommand {
            nodes: nodes.to_vec(),
            data: data.to_string(),
        });
        Ok(())
    }

    fn stop(&self) -> libridge::Result<()> {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        self.state.lines.lock().take();
        if self.state.fail_stop.load(Ordering::SeqCst) {
            return Err(BridgeError::Multiplexer("mock stop failure".into()));
        }
        Ok(())
    }
}
