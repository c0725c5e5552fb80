//! Bridge session: couples the MQTT session with the serial multiplexer.
//!
//! ```text
//! broker ──TransportEvent──┐                       ┌──send()──▶ serial
//!                          ├──▶ dispatch loop ──────┤
//! serial ──SerialLine──────┘                       └──publish()─▶ broker
//! ```
//!
//! Both streams feed one dispatch loop, so lines of a given node are
//! published in the order the multiplexer delivered them.

use crate::error::{BridgeError, Result};
use crate::mapping::IdentifierMapper;
use crate::models::{unix_timestamp, InboundEnvelope, OutboundRecord, SerialLine};
use crate::mqtt::{BrokerTransport, TransportEvent};
use crate::multiplexer::LineMultiplexer;
use crate::stats::{SessionStats, StatsSnapshot};
use crate::topics::{inbound_topic, outbound_json_topic, outbound_topic, parse_inbound_topic};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Buffered serial lines between the multiplexer and the dispatch loop
const LINE_BUFFER: usize = 1024;

/// Environment variables an operator sets to fix rejected credentials
const CREDENTIALS_HINT: &str = "check LC_LIBRIDGE_USER / LC_LIBRIDGE_PWD (or --username / --password)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Running,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human readable reason for an MQTT 3.1.1 CONNACK return code
pub fn rejection_reason(code: u8) -> &'static str {
    match code {
        0 => "accepted",
        1 => "unacceptable protocol version",
        2 => "client identifier rejected",
        3 => "broker unavailable",
        4 => "bad username or password",
        5 => "bad credentials (not authorized)",
        _ => "unknown return code",
    }
}

/// Cheap to clone; every clone drives the same session
#[derive(Clone)]
pub struct BridgeSession {
    inner: Arc<Inner>,
}

struct Inner {
    nodes: BTreeSet<String>,
    mapper: IdentifierMapper,
    transport: Arc<dyn BrokerTransport>,
    multiplexer: Arc<dyn LineMultiplexer>,
    looping: AtomicBool,
    state: Mutex<SessionState>,
    stats: SessionStats,
    shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeSession {
    pub fn new(
        nodes: BTreeSet<String>,
        mapper: IdentifierMapper,
        transport: Arc<dyn BrokerTransport>,
        multiplexer: Arc<dyn LineMultiplexer>,
    ) -> Result<Self> {
        mapper.check_nodes(&nodes)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                nodes,
                mapper,
                transport,
                multiplexer,
                looping: AtomicBool::new(false),
                state: Mutex::new(SessionState::Idle),
                stats: SessionStats::default(),
                shutdown,
                dispatcher: Mutex::new(None),
            }),
        })
    }

    /// Launches the MQTT network loop, the multiplexer and a background
    /// dispatch task, then returns.
    pub fn start(&self) -> Result<()> {
        let (events, lines) = self.launch()?;
        let session = self.clone();
        let handle = task::spawn(async move {
            if let Err(e) = session.dispatch(events, lines).await {
                debug!(error = %e, "dispatch loop ended");
            }
        });
        *self.inner.dispatcher.lock() = Some(handle);
        Ok(())
    }

    /// Like `start`, but runs the dispatch loop on the calling task until
    /// `stop` is called. Fails with `ConnectionRejected` when the broker
    /// refuses the connection.
    pub async fn loop_forever(&self) -> Result<()> {
        let (events, lines) = self.launch()?;
        self.dispatch(events, lines).await
    }

    /// Stops the network loop and the multiplexer. Safe to call from any
    /// task, any number of times.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), SessionState::Stopped);
        self.inner.looping.store(false, Ordering::SeqCst);
        if previous == SessionState::Stopped {
            debug!("bridge already stopped");
            return;
        }

        self.inner.shutdown.send_replace(true);
        if let Err(e) = self.inner.transport.disconnect() {
            warn!(error = %e, "failed to stop MQTT network loop");
        }
        if let Err(e) = self.inner.multiplexer.stop() {
            warn!(error = %e, "failed to stop serial multiplexer");
        }
        info!("bridge stopped");
    }

    /// Waits for the background dispatch task spawned by `start`
    pub async fn join(&self) {
        let handle = self.inner.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatch task ended abnormally");
            }
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// True while connected to the broker with the multiplexer running
    pub fn is_looping(&self) -> bool {
        self.inner.looping.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn nodes(&self) -> &BTreeSet<String> {
        &self.inner.nodes
    }

    fn launch(&self) -> Result<(mpsc::Receiver<TransportEvent>, mpsc::Receiver<SerialLine>)> {
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Idle {
                return Err(BridgeError::InvalidState(state.as_str()));
            }
            *state = SessionState::Connecting;
        }

        let events = match self.inner.transport.connect() {
            Ok(events) => events,
            Err(e) => {
                self.set_state_unless_stopped(SessionState::Idle);
                return Err(e);
            }
        };

        let (lines_tx, lines_rx) = mpsc::channel(LINE_BUFFER);
        if let Err(e) = self.inner.multiplexer.start(lines_tx) {
            if let Err(disconnect) = self.inner.transport.disconnect() {
                warn!(error = %disconnect, "failed to stop MQTT network loop");
            }
            self.set_state_unless_stopped(SessionState::Idle);
            return Err(e);
        }

        info!(nodes = self.inner.nodes.len(), mapped = self.inner.mapper.len(), "bridge starting");
        Ok((events, lines_rx))
    }

    async fn dispatch(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut lines: mpsc::Receiver<SerialLine>,
    ) -> Result<()> {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut events_open = true;
        let mut lines_open = true;

        while events_open || lines_open {
            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_transport_event(event)?,
                    None => {
                        debug!("MQTT event stream ended");
                        events_open = false;
                    }
                },
                line = lines.recv(), if lines_open => match line {
                    Some(line) => self.handle_line(line),
                    None => {
                        debug!("serial line stream ended");
                        lines_open = false;
                    }
                },
            }
        }
        debug!("dispatch loop finished");
        Ok(())
    }

    /// Errors end the dispatch loop
    fn handle_transport_event(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::ConnAck { code: 0 } => self.on_connected(),
            TransportEvent::ConnAck { code } => return Err(self.on_rejected(code)),
            TransportEvent::Message(envelope) => self.on_message(envelope),
            TransportEvent::Disconnected => self.on_disconnected(),
        }
        Ok(())
    }

    fn on_connected(&self) {
        if !self.set_state_unless_stopped(SessionState::Running) {
            return;
        }
        self.inner.looping.store(true, Ordering::SeqCst);
        self.inner.stats.connected();

        // the broker forgets subscriptions with a clean session, so every
        // CONNACK re-issues them
        for external in self.inner.mapper.external_ids(&self.inner.nodes) {
            let topic = inbound_topic(external);
            if let Err(e) = self.inner.transport.subscribe(&topic) {
                warn!(topic = %topic, error = %e, "subscribe failed");
            }
        }
        info!(nodes = self.inner.nodes.len(), "connected to broker, node topics subscribed");
    }

    /// Tears the launch down so `start` can be called again
    fn on_rejected(&self, code: u8) -> BridgeError {
        self.inner.looping.store(false, Ordering::SeqCst);

        let err = BridgeError::ConnectionRejected {
            code,
            reason: rejection_reason(code).to_string(),
        };
        if matches!(code, 4 | 5) {
            error!(code, hint = CREDENTIALS_HINT, "{err}");
        } else {
            error!(code, "{err}");
        }

        if self.state() == SessionState::Stopped {
            return err;
        }
        if let Err(e) = self.inner.transport.disconnect() {
            warn!(error = %e, "failed to release MQTT network loop");
        }
        if let Err(e) = self.inner.multiplexer.stop() {
            warn!(error = %e, "failed to stop serial multiplexer");
        }
        self.set_state_unless_stopped(SessionState::Idle);
        err
    }

    fn on_disconnected(&self) {
        self.inner.looping.store(false, Ordering::SeqCst);
        if self.set_state_unless_stopped(SessionState::Connecting) {
            warn!("connection to broker lost, waiting for reconnect");
        }
    }

    fn on_message(&self, envelope: InboundEnvelope) {
        match self.forward_inbound(envelope) {
            Ok(()) => self.inner.stats.message_forwarded(),
            Err(e) => {
                self.inner.stats.message_dropped();
                warn!(error = %e, "dropping inbound message");
            }
        }
    }

    fn forward_inbound(&self, envelope: InboundEnvelope) -> Result<()> {
        let InboundEnvelope { topic, payload } = envelope;
        let external = parse_inbound_topic(&topic)?;
        let internal = self.inner.mapper.to_internal(external).to_string();
        if !self.inner.nodes.contains(&internal) {
            return Err(BridgeError::UnknownNode(internal));
        }
        let text = String::from_utf8(payload).map_err(|source| BridgeError::PayloadDecode {
            topic: topic.clone(),
            source,
        })?;

        debug!(node = %internal, bytes = text.len(), "mqtt -> serial");
        self.inner.multiplexer.send(&[internal], &text)
    }

    fn handle_line(&self, line: SerialLine) {
        self.inner.stats.line_received();

        let state = self.state();
        if matches!(state, SessionState::Idle | SessionState::Stopped) {
            debug!(node = %line.node, state = %state, "no broker session, serial line dropped");
            return;
        }

        let external = self.inner.mapper.to_external(&line.node);
        trace!(node = %external, line = %line.line, "serial -> mqtt");
        let now = unix_timestamp();

        let raw = OutboundRecord::raw(now, external, &line.line);
        self.publish(&outbound_topic(external), &raw, false);

        // lines that are not JSON only get the raw record
        if let Some(json) = OutboundRecord::json(now, external, &line.line) {
            self.publish(&outbound_json_topic(external), &json, true);
        }
    }

    fn publish(&self, topic: &str, record: &OutboundRecord, json: bool) {
        let sent = record
            .to_bytes()
            .map_err(BridgeError::from)
            .and_then(|payload| self.inner.transport.publish(topic, payload));
        match sent {
            Ok(()) => self.inner.stats.record_published(json),
            Err(e) => {
                self.inner.stats.publish_failed();
                warn!(topic = %topic, error = %e, "publish failed");
            }
        }
    }

    /// Returns false, leaving the state untouched, once the session is stopped
    fn set_state_unless_stopped(&self, next: SessionState) -> bool {
        let mut state = self.inner.state.lock();
        if *state == SessionState::Stopped {
            return false;
        }
        *state = next;
        true
    }
}
