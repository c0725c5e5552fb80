/*!
Mock broker for bridge tests

Implements `BrokerTransport` in memory: nothing leaves the process. Every
subscription and publish is recorded, and tests push CONNACKs, inbound
messages or connection losses into the session's event stream.
*/

use anyhow::{anyhow, Result};
use libridge::error::BridgeError;
use libridge::{BrokerTransport, InboundEnvelope, TransportEvent};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// In-memory broker; clones share the same state
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    published: Mutex<Vec<MockMessage>>,
    subscriptions: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    fail_disconnect: AtomicBool,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `connect` calls fail
    pub fn fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// `disconnect` still tears the event stream down but reports an error
    pub fn fail_disconnect(&self, fail: bool) {
        self.state.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Answers the pending connection with the given CONNACK return code
    pub async fn connack(&self, code: u8) -> Result<()> {
        self.push(TransportEvent::ConnAck { code }).await
    }

    /// Simulates a PUBLISH from another client on a subscribed topic
    pub async fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.push(TransportEvent::Message(InboundEnvelope {
            topic: topic.to_string(),
            payload: payload.into(),
        }))
        .await
    }

    /// Simulates losing an established connection
    pub async fn drop_connection(&self) -> Result<()> {
        self.push(TransportEvent::Disconnected).await
    }

    async fn push(&self, event: TransportEvent) -> Result<()> {
        let sender = self
            .state
            .events
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("mock broker is not connected"))?;
        sender
            .send(event)
            .await
            .map_err(|e| anyhow!("session no longer listens: {:?}", e.0))
    }

    pub fn published(&self) -> Vec<MockMessage> {
        self.state.published.lock().clone()
    }

    /// Payloads published on `topic`, oldest first
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .published
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .map(|msg| msg.payload.clone())
            .collect()
    }

    /// Parses the last payload published on `topic`
    pub fn last_json_on<T: DeserializeOwned>(&self, topic: &str) -> Result<Option<T>> {
        match self.published_on(topic).last() {
            Some(payload) => Ok(Some(serde_json::from_slice(payload)?)),
            None => Ok(None),
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.state.events.lock().is_some()
    }

    pub fn clear(&self) {
        self.state.published.lock().clear();
        self.state.subscriptions.lock().clear();
    }
}

impl BrokerTransport for MockBroker {
    fn connect(&self) -> libridge::Result<mpsc::Receiver<TransportEvent>> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("mock broker refused to connect".into()));
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        *self.state.events.lock() = Some(tx);
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    fn subscribe(&self, topic: &str) -> libridge::Result<()> {
        self.state.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> libridge::Result<()> {
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("mock publish failure".into()));
        }
        self.state.published.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    fn disconnect(&self) -> libridge::Result<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.events.lock().take();
        if self.state.fail_disconnect.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("mock disconnect failure".into()));
        }
        Ok(())
    }
}
