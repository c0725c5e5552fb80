/*!
Test harness for the bridge session

Wires a `BridgeSession` to a `MockBroker` and a `MockMultiplexer`, and offers
polling helpers since the session reacts on its own dispatch task.
*/

use crate::mqtt_stub::MockBroker;
use crate::serial_stub::MockMultiplexer;
use anyhow::{bail, Result};
use libridge::{BridgeSession, IdentifierMapper, SessionState};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Default wait for the session to react
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Installs a test-friendly subscriber once; later calls are no-ops
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Polls `cond` until it holds or `timeout` elapses
pub async fn wait_until<F>(what: &str, timeout: Duration, mut cond: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > timeout {
            bail!("timed out after {:?} waiting for {}", timeout, what);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

pub struct TestHarness {
    pub broker: MockBroker,
    pub serial: MockMultiplexer,
    pub session: BridgeSession,
}

impl TestHarness {
    /// Session over `nodes` with identity naming
    pub fn new(nodes: &[&str]) -> Result<Self> {
        Self::build(nodes, IdentifierMapper::identity())
    }

    /// Session over `nodes` with a JSON mapping (serial id -> MQTT id)
    pub fn with_mapping(nodes: &[&str], mapping_json: &str) -> Result<Self> {
        Self::build(nodes, IdentifierMapper::from_json_str(mapping_json)?)
    }

    fn build(nodes: &[&str], mapper: IdentifierMapper) -> Result<Self> {
        init_tracing();
        let broker = MockBroker::new();
        let serial = MockMultiplexer::new();
        let nodes: BTreeSet<String> = nodes.iter().map(|n| n.to_string()).collect();
        let session = BridgeSession::new(
            nodes,
            mapper,
            Arc::new(broker.clone()),
            Arc::new(serial.clone()),
        )?;
        Ok(Self { broker, serial, session })
    }

    /// Starts the session and accepts its connection
    pub async fn start_connected(&self) -> Result<()> {
        self.session.start()?;
        self.broker.connack(0).await?;
        self.wait_for_state(SessionState::Running).await
    }

    pub async fn wait_for_state(&self, expected: SessionState) -> Result<()> {
        let session = &self.session;
        wait_until(&format!("state {}", expected), DEFAULT_TIMEOUT, || {
            session.state() == expected
        })
        .await
    }

    /// Waits until `count` payloads were published on `topic`
    pub async fn wait_for_publishes(&self, topic: &str, count: usize) -> Result<()> {
        let broker = &self.broker;
        wait_until(&format!("{} publishes on {}", count, topic), DEFAULT_TIMEOUT, || {
            broker.published_on(topic).len() >= count
        })
        .await
    }

    /// Waits for a publish on `topic` and returns it parsed
    pub async fn wait_for_message(&self, topic: &str) -> Result<Value> {
        self.wait_for_publishes(topic, 1).await?;
        match self.broker.last_json_on(topic)? {
            Some(value) => Ok(value),
            None => bail!("no message on {}", topic),
        }
    }

    /// Waits until the serial side received `count` writes
    pub async fn wait_for_sends(&self, count: usize) -> Result<()> {
        let serial = &self.serial;
        wait_until(&format!("{} serial writes", count), DEFAULT_TIMEOUT, || {
            serial.sent().len() >= count
        })
        .await
    }

    /// Waits until the session counted `count` dropped inbound messages
    pub async fn wait_for_drops(&self, count: u64) -> Result<()> {
        let session = &self.session;
        wait_until(&format!("{} dropped messages", count), DEFAULT_TIMEOUT, || {
            session.stats().messages_dropped >= count
        })
        .await
    }

    /// Stops the session and waits for its dispatch task
    pub async fn shutdown(&self) {
        self.session.stop();
        self.session.join().await;
    }
}
