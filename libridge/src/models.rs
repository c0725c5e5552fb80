use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// One line read from a node's serial port, tagged with the internal node id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialLine {
    pub node: String,
    pub line: String,
}

impl SerialLine {
    pub fn new(node: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            line: line.into(),
        }
    }
}

/// Message delivered by the broker on one of the inbound topics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Record published for every serial line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRecord {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    /// External node id
    pub node_id: String,
    /// Raw line text, or the parsed JSON value for the `out_json` variant
    pub payload: Value,
}

impl OutboundRecord {
    /// Raw-text record; trailing carriage returns are stripped
    pub fn raw(timestamp: f64, node_id: &str, line: &str) -> Self {
        Self {
            timestamp,
            node_id: node_id.to_string(),
            payload: Value::String(strip_cr(line).to_string()),
        }
    }

    /// JSON record, or `None` when the line is not JSON text
    pub fn json(timestamp: f64, node_id: &str, line: &str) -> Option<Self> {
        let payload = serde_json::from_str::<Value>(strip_cr(line)).ok()?;
        Some(Self {
            timestamp,
            node_id: node_id.to_string(),
            payload,
        })
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

fn strip_cr(line: &str) -> &str {
    line.trim_end_matches('\r')
}

/// Current wall-clock time as float seconds
pub fn unix_timestamp() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_record_strips_trailing_cr() {
        let record = OutboundRecord::raw(1.5, "node42", "hello world\r\r");
        assert_eq!(record.payload, json!("hello world"));

        let encoded: Value = serde_json::from_slice(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"timestamp": 1.5, "node_id": "node42", "payload": "hello world"})
        );
    }

    #[test]
    fn test_json_record_parses_line() {
        let record = OutboundRecord::json(2.0, "node42", "42\r").unwrap();
        assert_eq!(record.payload, json!(42));

        let record = OutboundRecord::json(2.0, "n", r#"{"temp": 21.5, "ok": true}"#).unwrap();
        assert_eq!(record.payload["temp"], json!(21.5));
    }

    #[test]
    fn test_json_record_skips_plain_text() {
        assert!(OutboundRecord::json(0.0, "n", "boot ok").is_none());
        assert!(OutboundRecord::json(0.0, "n", "{broken").is_none());
        assert!(OutboundRecord::json(0.0, "n", "").is_none());
    }

    #[test]
    fn test_unix_timestamp_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(unix_timestamp() > 1_577_836_800.0);
    }
}
