use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::source::{QueueMessage, QueueSource};
use crate::error::ConsumerError;
use crate::processor::MessageProcessor;
use crate::telemetry::CycleTracer;
use crate::utils::config::Config;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Batch size of a single receive.
    pub max_messages: i32,
    /// Long-poll bound of a single receive.
    pub wait_seconds: i32,
    /// Idle delay between cycles. Also the backoff after a failed receive.
    pub poll_interval: Duration,
    pub processing_timeout: Duration,
    /// How long an in-flight message may keep running once shutdown is requested.
    pub shutdown_grace: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait_seconds: 5,
            poll_interval: Duration::from_secs(1),
            processing_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for ConsumerSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_messages: config.max_messages,
            wait_seconds: config.wait_seconds,
            poll_interval: config.poll_interval(),
            processing_timeout: config.processing_timeout(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// What happened to one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Acknowledged,
    ProcessingFailed,
    AckFailed,
    /// Left to broker redelivery because shutdown interrupted it.
    Abandoned,
}

impl MessageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageOutcome::Acknowledged => "acknowledged",
            MessageOutcome::ProcessingFailed => "processing_failed",
            MessageOutcome::AckFailed => "ack_failed",
            MessageOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub received: usize,
    pub acknowledged: usize,
    pub processing_failed: usize,
    pub ack_failed: usize,
    pub abandoned: usize,
    pub receive_failed: bool,
}

impl CycleReport {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Acknowledged => self.acknowledged += 1,
            MessageOutcome::ProcessingFailed => self.processing_failed += 1,
            MessageOutcome::AckFailed => self.ack_failed += 1,
            MessageOutcome::Abandoned => self.abandoned += 1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub cycles: u64,
    pub received: u64,
    pub acknowledged: u64,
    pub processing_failed: u64,
    pub ack_failed: u64,
    pub abandoned: u64,
    pub receive_failures: u64,
}

impl ConsumerStats {
    fn absorb(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.received += report.received as u64;
        self.acknowledged += report.acknowledged as u64;
        self.processing_failed += report.processing_failed as u64;
        self.ack_failed += report.ack_failed as u64;
        self.abandoned += report.abandoned as u64;
        if report.receive_failed {
            self.receive_failures += 1;
        }
    }
}

/// Sequential poll → process → delete loop over one queue.
///
/// A message is deleted only after the processor returned `Ok` for that exact
/// delivery, and each receipt handle is used for at most one delete. Failures
/// of any stage are logged and never stop the loop; redelivery is left to the
/// broker's visibility timeout.
pub struct Consumer {
    source: Arc<dyn QueueSource>,
    processor: Arc<dyn MessageProcessor>,
    tracer: CycleTracer,
    settings: ConsumerSettings,
    worker_id: String,
}

impl Consumer {
    pub fn new(
        source: Arc<dyn QueueSource>,
        processor: Arc<dyn MessageProcessor>,
        tracer: CycleTracer,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            source,
            processor,
            tracer,
            settings,
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Runs cycles until `shutdown` is cancelled and returns the totals.
    pub async fn run(&self, shutdown: CancellationToken) -> ConsumerStats {
        let span = info_span!(
            "consumer",
            worker.id = %self.worker_id,
            queue = %self.source.name(),
            processor = %self.processor.name(),
            consumer.cycles = 0_u64,
        );

        self.run_loop(shutdown).instrument(span).await
    }

    async fn run_loop(&self, shutdown: CancellationToken) -> ConsumerStats {
        info!(
            max_messages = self.settings.max_messages,
            wait_seconds = self.settings.wait_seconds,
            poll_interval = ?self.settings.poll_interval,
            "Consumer loop started"
        );

        let span = Span::current();
        let mut stats = ConsumerStats::default();
        let mut cycle = 0_u64;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            cycle += 1;
            span.record("consumer.cycles", cycle);

            let report = self.run_cycle(cycle, &shutdown).await;
            stats.absorb(&report);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!(
            cycles = stats.cycles,
            received = stats.received,
            acknowledged = stats.acknowledged,
            processing_failed = stats.processing_failed,
            ack_failed = stats.ack_failed,
            abandoned = stats.abandoned,
            receive_failures = stats.receive_failures,
            "Consumer loop stopped"
        );

        stats
    }

    /// One poll cycle: a single receive, then every returned message in order.
    pub async fn run_cycle(&self, cycle: u64, shutdown: &CancellationToken) -> CycleReport {
        let span = self.tracer.cycle_span(cycle);
        let report = self
            .poll_and_drain(cycle, &span, shutdown)
            .instrument(span.clone())
            .await;

        span.record("messages.received", report.received as u64);
        span.record("messages.acknowledged", report.acknowledged as u64);
        span.record(
            "messages.failed",
            (report.processing_failed + report.ack_failed) as u64,
        );

        report
    }

    async fn poll_and_drain(
        &self,
        cycle: u64,
        cycle_span: &Span,
        shutdown: &CancellationToken,
    ) -> CycleReport {
        let mut report = CycleReport::default();

        let received = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Receive interrupted by shutdown");
                return report;
            }
            result = self.source.receive(self.settings.max_messages, self.settings.wait_seconds) => result,
        };

        let messages = match received {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "Failed to receive messages, retrying after backoff");
                report.receive_failed = true;
                return report;
            }
        };

        report.received = messages.len();
        if messages.is_empty() {
            debug!("No messages received");
            return report;
        }

        debug!(message_count = messages.len(), "Received messages");

        let mut pending = messages.into_iter();
        while let Some(message) = pending.next() {
            if shutdown.is_cancelled() {
                let left = 1 + pending.len();
                warn!(left, "Shutdown requested, leaving remaining messages for redelivery");
                report.abandoned += left;
                break;
            }

            let outcome = self.handle_message(cycle, cycle_span, message, shutdown).await;
            report.record(outcome);
        }

        debug!(
            acknowledged = report.acknowledged,
            processing_failed = report.processing_failed,
            ack_failed = report.ack_failed,
            abandoned = report.abandoned,
            "Cycle complete"
        );

        report
    }

    async fn handle_message(
        &self,
        cycle: u64,
        cycle_span: &Span,
        message: QueueMessage,
        shutdown: &CancellationToken,
    ) -> MessageOutcome {
        let span = self.tracer.message_span(cycle_span, cycle, &message);
        let work = self.process_and_ack(&message).instrument(span.clone());
        tokio::pin!(work);

        let outcome = tokio::select! {
            outcome = &mut work => outcome,
            _ = shutdown.cancelled() => {
                match tokio::time::timeout(self.settings.shutdown_grace, &mut work).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            parent: &span,
                            grace = ?self.settings.shutdown_grace,
                            "In-flight message did not finish within the shutdown grace period"
                        );
                        MessageOutcome::Abandoned
                    }
                }
            }
        };

        span.record("outcome", outcome.as_str());
        outcome
    }

    async fn process_and_ack(&self, message: &QueueMessage) -> MessageOutcome {
        let timeout = self.settings.processing_timeout;
        let processed = match tokio::time::timeout(timeout, self.processor.process(message)).await {
            Ok(result) => result,
            Err(_) => Err(ConsumerError::Processing(format!(
                "processing timed out after {:?}",
                timeout
            ))),
        };

        if let Err(e) = processed {
            error!(
                message.id = %message.display_id(),
                error = %e,
                "Message processing failed, leaving it for redelivery"
            );
            return MessageOutcome::ProcessingFailed;
        }

        match self.source.delete(&message.receipt_handle).await {
            Ok(()) => {
                debug!(message.id = %message.display_id(), "Message acknowledged");
                MessageOutcome::Acknowledged
            }
            Err(e) => {
                error!(
                    message.id = %message.display_id(),
                    error = %e,
                    "Failed to delete processed message, it will be redelivered"
                );
                MessageOutcome::AckFailed
            }
        }
    }
}
