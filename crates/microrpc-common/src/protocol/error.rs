use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    /// Invalid call arguments (nil request body, empty response payload).
    #[error("Internal error: {0}")]
    Internal(String),

    /// Resolution or dial failure.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Route not found for service '{0}'")]
    RouteNotFound(String),

    /// The selector was handed an empty address list.
    #[error("No addresses available for selection")]
    NotAvailable,

    /// Explicit cancellation or context expiry.
    #[error("Call canceled: {0}")]
    Canceled(String),

    /// Status returned by the remote handler, propagated unchanged.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// True when the call's context was cancelled or its deadline passed.
    pub fn is_canceled(&self) -> bool {
        matches!(self, RpcError::Canceled(_))
    }
}

impl From<std::net::AddrParseError> for RpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        RpcError::InvalidConfig(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
