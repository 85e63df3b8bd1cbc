use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use shared_models::chat::{ChatMessage, SenderType};

use crate::TransportError;

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

/// Lifecycle of the transport's current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

/// WebSocket close codes (RFC 6455).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    Away,
    Protocol,
    Unsupported,
    NoStatus,
    Abnormal,
    Invalid,
    Policy,
    TooBig,
    Extension,
    Error,
    Restart,
    Again,
    Custom(u16),
}

impl CloseCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Away => 1001,
            Self::Protocol => 1002,
            Self::Unsupported => 1003,
            Self::NoStatus => 1005,
            Self::Abnormal => 1006,
            Self::Invalid => 1007,
            Self::Policy => 1008,
            Self::TooBig => 1009,
            Self::Extension => 1010,
            Self::Error => 1011,
            Self::Restart => 1012,
            Self::Again => 1013,
            Self::Custom(code) => *code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::TooBig,
            1010 => Self::Extension,
            1011 => Self::Error,
            1012 => Self::Restart,
            1013 => Self::Again,
            code => Self::Custom(code),
        }
    }

    /// Anything other than a normal closure was not asked for by the client
    /// and is eligible for an automatic reconnect.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, Self::Normal)
    }
}

/// Per-connect tuning.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// Promote lifecycle logging from `debug` to `info`.
    pub debug: bool,
    /// Probe these endpoint paths instead of the configured resolver.
    pub endpoint_candidates: Option<Vec<String>>,
    /// Extra query parameters appended after the token.
    pub extra_params: Vec<(String, String)>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            debug: false,
            endpoint_candidates: None,
            extra_params: Vec::new(),
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn reconnect_delay_ms(self, millis: u64) -> Self {
        self.reconnect_delay(Duration::from_millis(millis))
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn endpoint_candidates<I, S>(mut self, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoint_candidates = Some(candidates.into_iter().map(Into::into).collect());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.push((key.into(), value.into()));
        self
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.reconnect_delay.is_zero() {
            return Err(TransportError::InvalidOptions(
                "reconnect delay must be greater than zero".to_string(),
            ));
        }
        if matches!(&self.endpoint_candidates, Some(c) if c.is_empty()) {
            return Err(TransportError::InvalidOptions(
                "endpoint candidate list is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Text frame body for a message sent from this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub chat_id: String,
    pub content: String,
    pub sender_type: SenderType,
}

/// A decoded server payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(ChatMessage),
    Error(String),
    Unrecognized(Value),
}
