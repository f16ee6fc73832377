use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::Message;
use aws_sdk_sqs::Client as SqsClient;
use tracing::instrument;

use super::source::{QueueMessage, QueueSource};
use crate::error::{ConsumerError, Result};
use crate::utils::config::Config;

pub struct SqsSource {
    client: SqsClient,
    queue_url: String,
}

impl SqsSource {
    pub fn new(client: SqsClient, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    /// Builds the process-wide client once at startup.
    pub async fn from_config(config: &Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let shared = loader.load().await;
        Self::new(SqsClient::new(&shared), config.queue_url.clone())
    }

}

#[async_trait]
impl QueueSource for SqsSource {
    fn name(&self) -> &str {
        &self.queue_url
    }

    #[instrument(skip(self), fields(queue = %self.queue_url))]
    async fn receive(&self, max_messages: i32, wait_seconds: i32) -> Result<Vec<QueueMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_seconds)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| ConsumerError::Receive(DisplayErrorContext(&e).to_string()))?;

        let messages = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(into_queue_message)
            .collect::<Vec<_>>();

        log::debug!("Received {} messages from {}", messages.len(), self.queue_url);
        Ok(messages)
    }

    #[instrument(skip(self, receipt_handle), fields(queue = %self.queue_url))]
    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        if receipt_handle.is_empty() {
            return Err(ConsumerError::Ack("receipt handle is empty".to_string()));
        }

        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| ConsumerError::Ack(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }
}

fn into_queue_message(message: Message) -> Option<QueueMessage> {
    let Some(receipt_handle) = message.receipt_handle() else {
        log::warn!(
            "Skipping message {:?} without a receipt handle, it cannot be acknowledged",
            message.message_id()
        );
        return None;
    };

    let attributes = message
        .message_attributes()
        .map(|attrs| {
            attrs
                .iter()
                .filter_map(|(key, value)| {
                    value.string_value().map(|v| (key.clone(), v.to_string()))
                })
                .collect::<HashMap<_, _>>()
        })
        .unwrap_or_default();

    let mut queued = QueueMessage::new(receipt_handle, message.body().unwrap_or_default());
    if let Some(id) = message.message_id() {
        queued = queued.with_message_id(id);
    }
    queued.attributes = attributes;

    Some(queued)
}
