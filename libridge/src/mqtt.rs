//! Broker side of the bridge.
//!
//! `BrokerTransport` is the narrow pub/sub surface the session needs. The
//! production implementation wraps a `rumqttc` client; its network loop runs
//! in its own task and turns broker traffic into `TransportEvent`s.

use crate::error::{BridgeError, Result};
use crate::models::InboundEnvelope;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Capacity of the client request queue and of the event channel
const CHANNEL_CAPACITY: usize = 256;

/// Upper bound for flushing the DISCONNECT packet on shutdown
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// What the network loop reports to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// CONNACK received; `code` is the MQTT 3.1.1 return code (0 = accepted)
    ConnAck { code: u8 },
    /// PUBLISH received on a subscribed topic
    Message(InboundEnvelope),
    /// Established connection lost; the transport reconnects by itself
    Disconnected,
}

/// Pub/sub primitives used by the bridge session.
///
/// Every call must return quickly: they run on the dispatch task.
pub trait BrokerTransport: Send + Sync {
    /// Starts the network loop. The connection completes asynchronously and
    /// is reported as `TransportEvent::ConnAck` on the returned channel.
    fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>>;

    fn subscribe(&self, topic: &str) -> Result<()>;

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Stops the network loop. Calling it again is a no-op.
    fn disconnect(&self) -> Result<()>;
}

/// `rumqttc`-backed transport
///
/// A network loop that ended (broker refused us, or `disconnect`) is rebuilt
/// from the stored options on the next `connect`.
pub struct MqttTransport {
    options: MqttOptions,
    client: Mutex<AsyncClient>,
    /// Event loop created with `client` and not yet driven by a pump
    idle_loop: Mutex<Option<EventLoop>>,
    pump: Mutex<Option<Pump>>,
    qos: QoS,
    retry_delay: Duration,
}

struct Pump {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl MqttTransport {
    pub fn new(options: MqttOptions, qos: QoS, retry_delay: Duration) -> Self {
        let (client, eventloop) = AsyncClient::new(options.clone(), CHANNEL_CAPACITY);
        Self {
            options,
            client: Mutex::new(client),
            idle_loop: Mutex::new(Some(eventloop)),
            pump: Mutex::new(None),
            qos,
            retry_delay,
        }
    }

    /// Event loop for a new pump; requests queued on the current client are
    /// kept when its loop was never driven.
    fn take_eventloop(&self) -> EventLoop {
        if let Some(eventloop) = self.idle_loop.lock().take() {
            return eventloop;
        }
        let (client, eventloop) = AsyncClient::new(self.options.clone(), CHANNEL_CAPACITY);
        *self.client.lock() = client;
        eventloop
    }
}

impl BrokerTransport for MqttTransport {
    fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut pump = self.pump.lock();
        if pump.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            return Err(BridgeError::InvalidState("transport already connected"));
        }

        let eventloop = self.take_eventloop();
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = task::spawn(pump_events(eventloop, events_tx, shutdown_rx, self.retry_delay));
        *pump = Some(Pump { handle, shutdown });
        Ok(events_rx)
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .lock()
            .try_subscribe(topic, self.qos)
            .map_err(|e| BridgeError::Transport(format!("subscribe {topic}: {e}")))
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .lock()
            .try_publish(topic, self.qos, false, payload)
            .map_err(|e| BridgeError::Transport(format!("publish {topic}: {e}")))
    }

    fn disconnect(&self) -> Result<()> {
        let Some(pump) = self.pump.lock().take() else {
            debug!("MQTT network loop not running, nothing to disconnect");
            return Ok(());
        };
        // the request is flushed by the pump before it exits
        if let Err(e) = self.client.lock().try_disconnect() {
            debug!(error = %e, "DISCONNECT could not be queued");
        }
        pump.shutdown.send_replace(true);
        Ok(())
    }
}

/// Resolves once shutdown is requested or the transport is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Network loop: polls the event loop and forwards what the session cares about
async fn pump_events(
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
    retry_delay: Duration,
) {
    let mut connected = false;

    loop {
        let polled = tokio::select! {
            polled = eventloop.poll() => polled,
            _ = shutdown_requested(&mut shutdown) => {
                flush_disconnect(&mut eventloop).await;
                break;
            }
        };

        let event = match polled {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                connected = true;
                TransportEvent::ConnAck { code: ack.code as u8 }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                TransportEvent::Message(InboundEnvelope {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                })
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                connected = false;
                TransportEvent::Disconnected
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent, leaving network loop");
                break;
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => {
                // the broker answered, retrying would be refused the same way
                let _ = events.send(TransportEvent::ConnAck { code: code as u8 }).await;
                break;
            }
            Err(e) => {
                warn!(error = %e, retry_in = ?retry_delay, "MQTT connection error");
                if connected {
                    connected = false;
                    if events.send(TransportEvent::Disconnected).await.is_err() {
                        break;
                    }
                }
                tokio::time::sleep(retry_delay).await;
                continue;
            }
        };

        if events.send(event).await.is_err() {
            debug!("session dropped its event receiver, leaving network loop");
            break;
        }
    }

    info!("MQTT network loop stopped");
}

async fn flush_disconnect(eventloop: &mut EventLoop) {
    let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if flushed.is_err() {
        debug!("DISCONNECT not flushed before grace period elapsed");
    }
}
