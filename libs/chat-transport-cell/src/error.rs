use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Handshake with {url} failed: {reason}")]
    HandshakeFailed { url: String, reason: String },

    #[error("No chat endpoint accepted a connection (tried: {tried})")]
    EndpointsExhausted { tried: String },

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Cannot send: no open connection")]
    NotConnected,

    #[error("Cannot send an empty message")]
    EmptyMessage,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not decode inbound payload: {0}")]
    Decode(String),

    #[error("Chat server reported an error: {0}")]
    Server(String),

    #[error("Invalid socket URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid connect options: {0}")]
    InvalidOptions(String),
}

impl TransportError {
    /// Short category shown next to the message in UI toasts and logs.
    pub fn classification(&self) -> &'static str {
        match self {
            TransportError::Connection(_)
            | TransportError::HandshakeFailed { .. }
            | TransportError::EndpointsExhausted { .. }
            | TransportError::ReconnectExhausted { .. } => "connection",
            TransportError::NotConnected
            | TransportError::EmptyMessage
            | TransportError::Send(_)
            | TransportError::Serialization(_) => "send",
            TransportError::Decode(_) => "decode",
            TransportError::Server(_) => "server",
            TransportError::InvalidUrl(_) | TransportError::InvalidOptions(_) => "configuration",
        }
    }

    /// Whether the transport has stopped trying on its own. A fresh
    /// `connect` is needed to get going again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportError::ReconnectExhausted { .. } | TransportError::EndpointsExhausted { .. }
        )
    }
}

impl From<url::ParseError> for TransportError {
    fn from(e: url::ParseError) -> Self {
        TransportError::InvalidUrl(e.to_string())
    }
}
