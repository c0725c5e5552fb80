use crate::error::{BridgeError, Result};

/// Root shared by every per-node topic
pub const TOPIC_ROOT: &str = "testbed/node";

/// Topic the bridge subscribes to for data headed to a node's serial port
pub fn inbound_topic(external_id: &str) -> String {
    format!("{TOPIC_ROOT}/{external_id}/in")
}

/// Topic carrying every serial line, wrapped as a raw record
pub fn outbound_topic(external_id: &str) -> String {
    format!("{TOPIC_ROOT}/{external_id}/out")
}

/// Topic carrying serial lines that parsed as JSON
pub fn outbound_json_topic(external_id: &str) -> String {
    format!("{TOPIC_ROOT}/{external_id}/out_json")
}

/// Extracts the external node id from an inbound topic.
/// Ex: "testbed/node/node42/in" -> "node42"
pub fn parse_inbound_topic(topic: &str) -> Result<&str> {
    topic
        .split('/')
        .nth(2)
        .ok_or_else(|| BridgeError::MalformedTopic(topic.to_string()))
}
