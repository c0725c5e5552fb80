//! libridge - IoT-LAB serial consoles over MQTT
//!
//! Every line a node prints on its serial port is published on
//! `testbed/node/<id>/out` (and on `testbed/node/<id>/out_json` when the line
//! is JSON). Anything published on `testbed/node/<id>/in` is written to the
//! node's serial port.
//!
//! ```text
//! testbed/node/<id>/in        ──▶ serial write
//! serial line  ──▶ testbed/node/<id>/out       {"timestamp", "node_id", "payload": "<text>"}
//!              └─▶ testbed/node/<id>/out_json  {"timestamp", "node_id", "payload": <json>}
//! ```
//!
//! `<id>` is the node's external name: its serial-side name passed through the
//! optional identifier mapping.

pub mod config;
pub mod error;
pub mod mapping;
pub mod models;
pub mod mqtt;
pub mod multiplexer;
pub mod session;
pub mod stats;
pub mod topics;

pub use config::{BridgeConfig, Credentials, ScriptConfig, ScriptConfigFile};
pub use error::{BridgeError, Result};
pub use mapping::{Direction, IdentifierMapper};
pub use models::{InboundEnvelope, OutboundRecord, SerialLine};
pub use mqtt::{BrokerTransport, MqttTransport, TransportEvent};
pub use multiplexer::{LineMultiplexer, TcpSerialMultiplexer};
pub use session::{BridgeSession, SessionState};
pub use stats::StatsSnapshot;

use std::sync::Arc;

/// Builds a session wired to a real broker and to the testbed serial ports
pub fn session_from_config(config: &BridgeConfig, mapper: IdentifierMapper) -> Result<BridgeSession> {
    config.validate()?;
    let transport = MqttTransport::new(config.mqtt_options(), config.mqtt_qos()?, config.reconnect_delay);
    let multiplexer = TcpSerialMultiplexer::new(
        config.nodes.clone(),
        config.serial_port,
        config.reconnect_delay,
    );
    BridgeSession::new(
        config.nodes.clone(),
        mapper,
        Arc::new(transport),
        Arc::new(multiplexer),
    )
}
