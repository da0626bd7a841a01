use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value '{value}' for {field}: {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Decode error: {0}")]
    CodecError(#[from] CodecError),

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Guest data source error: {message}")]
    SourceError { message: String },

    #[error("Transport error on {address}: {message}")]
    TransportError { address: String, message: String },

    #[error("Failed to daemonize: {0}")]
    DaemonizeError(String),
}

/// Wire decoding failures shared by the AgentX and BER codecs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unexpected tag 0x{actual:02x}, expected 0x{expected:02x}")]
    UnexpectedTag { expected: u8, actual: u8 },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(i64),

    #[error("unknown PDU type {0}")]
    UnknownPduType(u8),

    #[error("unknown value type {0}")]
    UnknownValueType(u16),

    #[error("malformed {what}")]
    Malformed { what: &'static str },
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    pub fn data_source(message: impl Into<String>) -> Self {
        Self::SourceError {
            message: message.into(),
        }
    }

    pub fn transport(address: impl Into<String>, message: impl ToString) -> Self {
        Self::TransportError {
            address: address.into(),
            message: message.to_string(),
        }
    }
}
