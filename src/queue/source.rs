use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

/// The broker side of the consumer loop.
///
/// `receive` may block up to `wait_seconds` and returns messages in broker
/// delivery order. `delete` removes exactly the delivery identified by the
/// receipt handle. Neither call is retried by the caller.
#[async_trait]
pub trait QueueSource: Send + Sync {
    fn name(&self) -> &str;

    async fn receive(&self, max_messages: i32, wait_seconds: i32) -> Result<Vec<QueueMessage>>;

    async fn delete(&self, receipt_handle: &str) -> Result<()>;
}

/// One delivery attempt of a queued payload.
///
/// A redelivery of the same payload arrives with a fresh receipt handle, so the
/// handle is only meaningful for the cycle that received it.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub receipt_handle: String,
    pub body: String,
    pub message_id: Option<String>,
    pub attributes: HashMap<String, String>,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

impl QueueMessage {
    pub fn new(receipt_handle: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            message_id: None,
            attributes: HashMap::new(),
            received_at: chrono::Utc::now(),
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Identifier used in logs and span fields. Falls back to the receipt handle.
    pub fn display_id(&self) -> &str {
        self.message_id.as_deref().unwrap_or(&self.receipt_handle)
    }
}
