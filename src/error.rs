use thiserror::Error;

/// Failures the consumer can observe.
///
/// Only [`ConsumerError::Configuration`] is fatal. Every other variant is
/// logged by the loop and the loop keeps polling.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to receive messages: {0}")]
    Receive(String),

    #[error("failed to process message: {0}")]
    Processing(String),

    #[error("failed to delete message: {0}")]
    Ack(String),
}

pub type Result<T, E = ConsumerError> = std::result::Result<T, E>;
