use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::MessageProcessor;
use crate::error::{ConsumerError, Result};
use crate::queue::QueueMessage;
use crate::telemetry;

/// Emits one structured "Consumed message" record per delivery.
///
/// The record carries the payload and the trace id of the enclosing
/// `process_message` span so logs can be joined with traces.
pub struct LogProcessor {
    work: Duration,
    reject_empty: bool,
}

impl LogProcessor {
    pub fn new(work: Duration) -> Self {
        Self {
            work,
            reject_empty: false,
        }
    }

    pub fn reject_empty(mut self, reject: bool) -> Self {
        self.reject_empty = reject;
        self
    }
}

impl Default for LogProcessor {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[async_trait]
impl MessageProcessor for LogProcessor {
    fn name(&self) -> &str {
        "log"
    }

    async fn process(&self, message: &QueueMessage) -> Result<()> {
        if self.reject_empty && message.body.trim().is_empty() {
            return Err(ConsumerError::Processing(format!(
                "message {} has an empty body",
                message.display_id()
            )));
        }

        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }

        let trace_id = telemetry::current_trace_id().unwrap_or_default();
        info!(
            body = %message.body,
            trace_id = %trace_id,
            received_at = %message.received_at.to_rfc3339(),
            "Consumed message"
        );

        Ok(())
    }
}
