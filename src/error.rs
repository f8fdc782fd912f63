//! Error types and result handling for event-gateway.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use event_gateway::{Error, Result};
//!
//! fn validate(event_type: &str) -> Result<()> {
//!     if event_type.is_empty() {
//!         return Err(Error::Validation("event type is required".to_string()));
//!     }
//!     Ok(())
//! }
//!
//! match validate("") {
//!     Ok(()) => println!("Valid"),
//!     Err(e) if e.is_client_error() => eprintln!("Rejected: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// The main error type for event-gateway operations.
///
/// Errors local to a single event (validation, deserialization, handler)
/// never abort the service. Connectivity and group-membership errors are
/// propagated to the gateway, which decides between retrying and failing.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from invalid files or environment variables.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka client, producer or consumer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// JSON serialization error when encoding an event for the wire.
    #[error("Marshal error: {0}")]
    Marshal(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed inbound event. Never reaches the broker.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The broker was unreachable or rejected the write after the client
    /// exhausted its retries.
    #[error("Publish error: {message}")]
    Publish {
        /// Description of the failed write
        message: String,
    },

    /// A consumed record could not be decoded into an event.
    #[error("Deserialization error at partition {partition} offset {offset}: {message}")]
    Deserialization {
        /// Partition the record was read from
        partition: i32,
        /// Offset of the malformed record
        offset: i64,
        /// Decoder error
        message: String,
    },

    /// The configured event handler failed to process a valid record.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Group membership or rebalance failure.
    #[error("Coordination error: {message}")]
    Coordination {
        /// Description of the coordination failure
        message: String,
    },

    /// Broker could not be reached. Transient.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The topic does not exist on the broker.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// A partition operation was attempted without holding a claim on it.
    #[error("Partition {partition} is not assigned to this member")]
    NotAssigned {
        /// Partition the member tried to use
        partition: i32,
    },

    /// Authentication failure with the broker.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// The gateway is shutting down and no longer accepts work.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl Error {
    /// Returns `true` for failures that retrying will not fix.
    ///
    /// The consumer group session stops rejoining and reports these upward.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Authentication(_) | Error::UnknownTopic(_) | Error::Config(_) => true,
            Error::Kafka(e) => e.rdkafka_error_code().map_or(false, is_fatal_code),
            _ => false,
        }
    }

    /// Returns `true` when the caller sent something the gateway refuses to
    /// publish.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

fn is_fatal_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::Fatal
            | RDKafkaErrorCode::UnknownTopic
            | RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::InvalidConfig
    )
}

/// A convenient Result type alias for event-gateway operations.
///
/// This is equivalent to `std::result::Result<T, event_gateway::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::UnknownTopic("events".to_string()).is_fatal());
        assert!(Error::Authentication("bad credentials".to_string()).is_fatal());
        assert!(!Error::Unavailable("connection refused".to_string()).is_fatal());
        assert!(!Error::NotAssigned { partition: 1 }.is_fatal());
        assert!(Error::Kafka(KafkaError::MessageConsumption(
            RDKafkaErrorCode::TopicAuthorizationFailed
        ))
        .is_fatal());
        assert!(!Error::Kafka(KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure
        ))
        .is_fatal());
    }

    #[test]
    fn test_client_error_classification() {
        assert!(Error::Validation("missing type".to_string()).is_client_error());
        assert!(!Error::Publish {
            message: "timed out".to_string()
        }
        .is_client_error());
    }
}
