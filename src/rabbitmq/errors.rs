// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ queue error: {0}")]
    QueueError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(String),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("RPC request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Response slot was dropped before a reply arrived")]
    ResponseChannelClosed,
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }

    /// HTTP-equivalent status class the consumer-facing layer should surface.
    pub fn status_code(&self) -> u16 {
        match self {
            RpcError::Timeout(_) => 504,
            RpcError::DeserializationError(_) => 502,
            RpcError::SerializationError(_) => 500,
            RpcError::ConnectionError(_)
            | RpcError::ChannelError(_)
            | RpcError::QueueError(_)
            | RpcError::PublishError(_)
            | RpcError::ConsumeError(_)
            | RpcError::AckError(_)
            | RpcError::ResponseChannelClosed => 503,
        }
    }
}

// Operations map lapin errors to a specific variant with map_err; this is the
// fallback for call sites that only know they talked to the broker.
impl From<LapinError> for RpcError {
    fn from(error: LapinError) -> Self {
        match error {
            LapinError::InvalidConnectionState(_) | LapinError::IOError(_) => {
                RpcError::ConnectionError(error.to_string())
            }
            LapinError::InvalidChannelState(_) | LapinError::ChannelsLimitReached => {
                RpcError::ChannelError(error.to_string())
            }
            other => RpcError::ChannelError(other.to_string()),
        }
    }
}

impl From<SerdeError> for RpcError {
    fn from(error: SerdeError) -> Self {
        if error.is_data() || error.is_syntax() || error.is_eof() {
            RpcError::DeserializationError(error.to_string())
        } else {
            RpcError::SerializationError(error.to_string())
        }
    }
}
