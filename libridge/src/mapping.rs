//! Identifier mapping between serial-side (internal) and MQTT-side (external)
//! node names.
//!
//! The mapping file is a flat JSON object, e.g. `{"m3-42": "node42"}`. Nodes
//! that do not appear in it keep their internal name on the MQTT side.

use crate::error::{BridgeError, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Which way an identifier is translated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    InternalToExternal,
    ExternalToInternal,
}

/// Immutable bidirectional map, built once at startup
#[derive(Debug, Clone, Default)]
pub struct IdentifierMapper {
    to_external: HashMap<String, String>,
    to_internal: HashMap<String, String>,
}

impl IdentifierMapper {
    /// Identity mapping: every id translates to itself
    pub fn identity() -> Self {
        Self::default()
    }

    /// Builds the mapper, rejecting mappings where two internal ids share an
    /// external id (the reverse lookup would be ambiguous).
    pub fn new(to_external: HashMap<String, String>) -> Result<Self> {
        let mut to_internal = HashMap::with_capacity(to_external.len());
        for (internal, external) in &to_external {
            if let Some(previous) = to_internal.insert(external.clone(), internal.clone()) {
                let (first, second) = if previous < *internal {
                    (previous, internal.clone())
                } else {
                    (internal.clone(), previous)
                };
                return Err(BridgeError::Config(format!(
                    "identifier mapping is not one-to-one: '{first}' and '{second}' both map to '{external}'"
                )));
            }
        }
        Ok(Self {
            to_external,
            to_internal,
        })
    }

    /// Parses a flat `{"internal": "external", ...}` JSON object
    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| BridgeError::Config(format!("mapping is not valid JSON: {e}")))?;

        let serde_json::Value::Object(entries) = value else {
            return Err(BridgeError::Config(
                "mapping must be a JSON object of string to string".into(),
            ));
        };

        let mut to_external = HashMap::with_capacity(entries.len());
        for (internal, external) in entries {
            match external {
                serde_json::Value::String(external) => {
                    to_external.insert(internal, external);
                }
                other => {
                    return Err(BridgeError::Config(format!(
                        "mapping value for '{internal}' must be a string, got {other}"
                    )))
                }
            }
        }

        Self::new(to_external)
    }

    /// Loads the mapping file at `path`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("cannot read mapping file {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text).map_err(|e| match e {
            BridgeError::Config(msg) => BridgeError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Translates `id`; unmapped ids come back unchanged
    pub fn translate<'a>(&'a self, id: &'a str, direction: Direction) -> &'a str {
        let table = match direction {
            Direction::InternalToExternal => &self.to_external,
            Direction::ExternalToInternal => &self.to_internal,
        };
        table.get(id).map(String::as_str).unwrap_or(id)
    }

    pub fn to_external<'a>(&'a self, internal: &'a str) -> &'a str {
        self.translate(internal, Direction::InternalToExternal)
    }

    pub fn to_internal<'a>(&'a self, external: &'a str) -> &'a str {
        self.translate(external, Direction::ExternalToInternal)
    }

    /// External names of every node in `nodes`, in node order
    pub fn external_ids<'a>(&'a self, nodes: &'a BTreeSet<String>) -> Vec<&'a str> {
        nodes.iter().map(|n| self.to_external(n)).collect()
    }

    /// Checks that every node in `nodes` gets its own external name and is
    /// reached back from it. An unmapped node whose id is also another node's
    /// external name would otherwise alias the two.
    pub fn check_nodes(&self, nodes: &BTreeSet<String>) -> Result<()> {
        for node in nodes {
            let external = self.to_external(node);
            let back = self.to_internal(external);
            if back != node {
                return Err(BridgeError::Config(format!(
                    "nodes '{back}' and '{node}' would share the MQTT name '{external}'"
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.to_external.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_external.is_empty()
    }
}
