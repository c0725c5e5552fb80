use std::string::FromUtf8Error;

/// Errors raised by the bridge core and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("broker rejected connection (code {code}): {reason}")]
    ConnectionRejected { code: u8, reason: String },
    #[error("malformed topic: {0}")]
    MalformedTopic(String),
    #[error("payload on {topic} is not valid UTF-8: {source}")]
    PayloadDecode {
        topic: String,
        #[source]
        source: FromUtf8Error,
    },
    #[error("no managed node named '{0}'")]
    UnknownNode(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("multiplexer error: {0}")]
    Multiplexer(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
