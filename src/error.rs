use crate::loxone::codec::CodecError;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Miniserver unreachable: {0}")]
    Unreachable(String),

    #[error("WebSocket dial failed: {0}")]
    DialFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout waiting for response: {0}")]
    HandshakeTimeout(String),

    #[error("Timeout waiting for structure file")]
    StructureTimeout,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Miniserver rejected {command} with code {code}")]
    AuthRejected { command: String, code: u16 },

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
