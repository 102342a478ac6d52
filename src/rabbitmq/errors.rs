// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ broker unreachable: {0}")]
    Unreachable(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ protocol error: {0}")]
    ProtocolError(String),

    #[error("Exchange '{exchange}' does not exist: {reason}")]
    ExchangeNotFound { exchange: String, reason: String },

    #[error("RabbitMQ channel is not available")]
    ChannelUnavailable,

    #[error("RabbitMQ connection failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<RabbitMQError>,
    },

    #[error("Operation cancelled by shutdown request")]
    Cancelled,

    #[error("Delivery tag {delivery_tag} belongs to a channel that is no longer open")]
    StaleDelivery { delivery_tag: u64 },

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Connectivity-class failures: the broker could not be reached or the
    /// socket dropped while connecting. Everything else is treated as fatal by
    /// the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RabbitMQError::Unreachable(_))
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match error {
            LapinError::IOError(_) | LapinError::MissingHeartbeatError => {
                RabbitMQError::Unreachable(error_text)
            }
            LapinError::InvalidConnectionState(_) => RabbitMQError::ConnectionError(error_text),
            LapinError::InvalidChannelState(_)
            | LapinError::InvalidChannel(_)
            | LapinError::ChannelsLimitReached => RabbitMQError::ChannelError(error_text),
            LapinError::ProtocolError(_) => RabbitMQError::ProtocolError(error_text),
            _ => RabbitMQError::ConnectionError(error_text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

    #[test]
    fn io_errors_are_retryable() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let error = RabbitMQError::from(LapinError::IOError(Arc::new(refused)));

        assert!(matches!(error, RabbitMQError::Unreachable(_)));
        assert!(error.is_retryable());
    }

    #[test]
    fn missing_heartbeat_is_retryable() {
        let error = RabbitMQError::from(LapinError::MissingHeartbeatError);
        assert!(error.is_retryable());
    }

    #[test]
    fn operational_errors_are_fatal() {
        let fatal = [
            RabbitMQError::ChannelUnavailable,
            RabbitMQError::ProtocolError("ACCESS_REFUSED".to_string()),
            RabbitMQError::ExchangeNotFound {
                exchange: "tasks".to_string(),
                reason: "NOT_FOUND".to_string(),
            },
            RabbitMQError::ConfigError("missing password".to_string()),
            RabbitMQError::Cancelled,
        ];

        for error in fatal {
            assert!(!error.is_retryable(), "{error} should not be retried");
        }
    }

    #[test]
    fn exhausted_retries_report_the_last_error() {
        let error = RabbitMQError::RetriesExhausted {
            attempts: 4,
            last: Box::new(RabbitMQError::Unreachable("connection refused".to_string())),
        };

        assert_eq!(
            error.to_string(),
            "RabbitMQ connection failed after 4 attempts: RabbitMQ broker unreachable: connection refused"
        );
        assert!(!error.is_retryable());
    }
}
