use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use shipping_worker::error::Result;
use shipping_worker::processor::MessageProcessor;
use shipping_worker::queue::{Consumer, ConsumerSettings, QueueMessage, QueueSource};
use shipping_worker::telemetry::CycleTracer;
use shipping_worker::ConsumerError;
use tokio_util::sync::CancellationToken;

type Poll = Result<Vec<QueueMessage>>;

/// Replays a fixed list of poll results, then cancels the consumer.
struct ScriptedQueue {
    polls: Mutex<VecDeque<Poll>>,
    failing_handles: Vec<String>,
    delete_attempts: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    receive_times: Mutex<Vec<Instant>>,
    shutdown: CancellationToken,
}

impl ScriptedQueue {
    fn new(polls: Vec<Poll>, shutdown: CancellationToken) -> Self {
        Self {
            polls: Mutex::new(polls.into()),
            failing_handles: Vec::new(),
            delete_attempts: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            receive_times: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    fn failing_delete(mut self, handle: &str) -> Self {
        self.failing_handles.push(handle.to_string());
        self
    }

    fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn delete_attempts(&self) -> Vec<String> {
        self.delete_attempts.lock().unwrap().clone()
    }

    fn receive_count(&self) -> usize {
        self.receive_times.lock().unwrap().len()
    }
}

#[async_trait]
impl QueueSource for ScriptedQueue {
    fn name(&self) -> &str {
        "scripted-queue"
    }

    async fn receive(&self, _max_messages: i32, _wait_seconds: i32) -> Result<Vec<QueueMessage>> {
        self.receive_times.lock().unwrap().push(Instant::now());
        let next = self.polls.lock().unwrap().pop_front();
        match next {
            Some(poll) => poll,
            None => {
                self.shutdown.cancel();
                Ok(Vec::new())
            }
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.delete_attempts.lock().unwrap().push(receipt_handle.to_string());
        if self.failing_handles.iter().any(|h| h == receipt_handle) {
            return Err(ConsumerError::Ack(format!("delete of {} rejected", receipt_handle)));
        }
        self.deleted.lock().unwrap().push(receipt_handle.to_string());
        Ok(())
    }
}

/// Records every call; fails payloads starting with "fail".
#[derive(Default)]
struct RecordingProcessor {
    calls: Mutex<Vec<String>>,
}

impl RecordingProcessor {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageProcessor for RecordingProcessor {
    fn name(&self) -> &str {
        "recording"
    }

    async fn process(&self, message: &QueueMessage) -> Result<()> {
        self.calls.lock().unwrap().push(message.receipt_handle.clone());
        if message.body.starts_with("fail") {
            return Err(ConsumerError::Processing(format!("cannot handle {}", message.body)));
        }
        Ok(())
    }
}

/// Upserts shipments keyed by order id, so a redelivery changes nothing.
#[derive(Default)]
struct ShipmentLedger {
    shipments: Mutex<HashMap<String, String>>,
    calls: Mutex<usize>,
}

#[async_trait]
impl MessageProcessor for ShipmentLedger {
    fn name(&self) -> &str {
        "ledger"
    }

    async fn process(&self, message: &QueueMessage) -> Result<()> {
        *self.calls.lock().unwrap() += 1;
        let (order, status) = message
            .body
            .split_once(':')
            .ok_or_else(|| ConsumerError::Processing("malformed shipment".into()))?;
        self.shipments
            .lock()
            .unwrap()
            .insert(order.to_string(), status.to_string());
        Ok(())
    }
}

fn settings(poll_interval: Duration) -> ConsumerSettings {
    ConsumerSettings {
        poll_interval,
        processing_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(1),
        ..Default::default()
    }
}

fn msg(handle: &str, body: &str) -> QueueMessage {
    QueueMessage::new(handle, body)
}

#[tokio::test]
async fn test_empty_poll_processes_nothing() {
    let shutdown = CancellationToken::new();
    let queue = Arc::new(ScriptedQueue::new(vec![Ok(vec![])], shutdown.clone()));
    let processor = Arc::new(RecordingProcessor::default());
    let consumer = Consumer::new(
        queue.clone(),
        processor.clone(),
        CycleTracer::new("scripted-queue"),
        settings(Duration::from_millis(5)),
    );

    let stats = consumer.run(shutdown).await;

    assert!(processor.calls().is_empty());
    assert!(queue.delete_attempts().is_empty());
    assert_eq!(stats.received, 0);
}

#[tokio::test]
async fn test_single_success_deletes_once() {
    let shutdown = CancellationToken::new();
    let queue = Arc::new(ScriptedQueue::new(vec![Ok(vec![msg("rh-1", "order-1")])], shutdown.clone()));
    let processor = Arc::new(RecordingProcessor::default());
    let consumer = Consumer::new(
        queue.clone(),
        processor.clone(),
        CycleTracer::new("scripted-queue"),
        settings(Duration::from_millis(5)),
    );

    let stats = consumer.run(shutdown).await;

    assert_eq!(processor.calls(), vec!["rh-1".to_string()]);
    assert_eq!(queue.delete_attempts(), vec!["rh-1".to_string()]);
    assert_eq!(stats.acknowledged, 1);
}

#[tokio::test]
async fn test_single_failure_is_never_deleted() {
    let shutdown = CancellationToken::new();
    let queue = Arc::new(ScriptedQueue::new(vec![Ok(vec![msg("rh-1", "fail-1")])], shutdown.clone()));
    let processor = Arc::new(RecordingProcessor::default());
    let consumer = Consumer::new(
        queue.clone(),
        processor.clone(),
        CycleTracer::new("scripted-queue"),
        settings(Duration::from_millis(5)),
    );

    let stats = consumer.run(shutdown).await;

    assert_eq!(processor.calls(), vec!["rh-1".to_string()]);
    assert!(queue.delete_attempts().is_empty());
    assert_eq!(stats.processing_failed, 1);
}

#[tokio::test]
async fn test_receive_failure_continues_with_next_cycle() {
    let shutdown = CancellationToken::new();
    let queue = Arc::new(ScriptedQueue::new(
        vec![
            Err(ConsumerError::Receive("connection reset".into())),
            Ok(vec![msg("rh-2", "order-2")]),
        ],
        shutdown.clone(),
    ));
    let processor = Arc::new(RecordingProcessor::default());
    let consumer = Consumer::new(
        queue.clone(),
        processor.clone(),
        CycleTracer::new("scripted-queue"),
        settings(Duration::from_millis(5)),
    );

    let stats = consumer.run(shutdown).await;

    assert_eq!(stats.receive_failures, 1);
    assert_eq!(processor.calls(), vec!["rh-2".to_string()]);
    assert_eq!(queue.deleted(), vec!["rh-2".to_string()]);
}

#[tokio::test]
async fn test_mixed_sequence_deletes_only_successes_in_order() {
    let shutdown = CancellationToken::new();
    let queue = Arc::new(ScriptedQueue::new(
        vec![
            Ok(vec![]),
            Ok(vec![msg("rh-1", "order-1"), msg("rh-2", "fail-2"), msg("rh-3", "order-3")]),
            Err(ConsumerError::Receive("throttled".into())),
            Ok(vec![msg("rh-4", "fail-4")]),
            Ok(vec![msg("rh-5", "order-5")]),
        ],
        shutdown.clone(),
    ));
    let processor = Arc::new(RecordingProcessor::default());
    let consumer = Consumer::new(
        queue.clone(),
        processor.clone(),
        CycleTracer::new("scripted-queue"),
        settings(Duration::from_millis(2)),
    );

    let stats = consumer.run(shutdown).await;

    assert_eq!(
        processor.calls(),
        vec!["rh-1", "rh-2", "rh-3", "rh-4", "rh-5"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
    assert_eq!(
        queue.delete_attempts(),
        vec!["rh-1".to_string(), "rh-3".to_string(), "rh-5".to_string()]
    );
    assert_eq!(stats.received, 5);
    assert_eq!(stats.acknowledged, 3);
    assert_eq!(stats.processing_failed, 2);
    assert_eq!(stats.receive_failures, 1);
}

#[tokio::test]
async fn test_ack_failure_redelivery_is_harmless() {
    let shutdown = CancellationToken::new();
    let queue = Arc::new(
        ScriptedQueue::new(
            vec![
                Ok(vec![msg("rh-1", "order-7:shipped")]),
                // the broker hands the same payload back under a new handle
                Ok(vec![msg("rh-1b", "order-7:shipped")]),
            ],
            shutdown.clone(),
        )
        .failing_delete("rh-1"),
    );
    let ledger = Arc::new(ShipmentLedger::default());
    let consumer = Consumer::new(
        queue.clone(),
        ledger.clone(),
        CycleTracer::new("scripted-queue"),
        settings(Duration::from_millis(2)),
    );

    let stats = consumer.run(shutdown).await;

    assert_eq!(*ledger.calls.lock().unwrap(), 2);
    let shipments = ledger.shipments.lock().unwrap();
    assert_eq!(shipments.len(), 1);
    assert_eq!(shipments.get("order-7").map(String::as_str), Some("shipped"));

    assert_eq!(
        queue.delete_attempts(),
        vec!["rh-1".to_string(), "rh-1b".to_string()]
    );
    assert_eq!(queue.deleted(), vec!["rh-1b".to_string()]);
    assert_eq!(stats.ack_failed, 1);
    assert_eq!(stats.acknowledged, 1);
}

#[tokio::test]
async fn test_cycles_are_spaced_by_poll_interval() {
    let interval = Duration::from_millis(30);
    let shutdown = CancellationToken::new();
    let queue = Arc::new(ScriptedQueue::new(
        vec![Ok(vec![]), Err(ConsumerError::Receive("down".into())), Ok(vec![])],
        shutdown.clone(),
    ));
    let consumer = Consumer::new(
        queue.clone(),
        Arc::new(RecordingProcessor::default()),
        CycleTracer::new("scripted-queue"),
        settings(interval),
    );

    consumer.run(shutdown).await;

    let times = queue.receive_times.lock().unwrap().clone();
    assert_eq!(times.len(), 4);
    for pair in times.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= interval);
    }
}

#[tokio::test]
async fn test_shutdown_during_idle_delay_stops_promptly() {
    let shutdown = CancellationToken::new();
    let queue = Arc::new(ScriptedQueue::new(
        (0..100).map(|_| Ok(Vec::new())).collect(),
        shutdown.clone(),
    ));
    let consumer = Consumer::new(
        queue.clone(),
        Arc::new(RecordingProcessor::default()),
        CycleTracer::new("scripted-queue"),
        settings(Duration::from_secs(60)),
    );

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let stats = consumer.run(shutdown).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(stats.cycles, 1);
    assert_eq!(queue.receive_count(), 1);
}

/// Cancels the token as soon as the first message is being processed.
struct CancelOnFirst {
    shutdown: CancellationToken,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl MessageProcessor for CancelOnFirst {
    fn name(&self) -> &str {
        "cancel-on-first"
    }

    async fn process(&self, message: &QueueMessage) -> Result<()> {
        self.calls.lock().unwrap().push(message.receipt_handle.clone());
        self.shutdown.cancel();
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_and_leaves_rest() {
    let shutdown = CancellationToken::new();
    let queue = Arc::new(ScriptedQueue::new(
        vec![Ok(vec![msg("rh-1", "a"), msg("rh-2", "b"), msg("rh-3", "c")])],
        shutdown.clone(),
    ));
    let processor = Arc::new(CancelOnFirst {
        shutdown: shutdown.clone(),
        calls: Mutex::new(Vec::new()),
    });
    let consumer = Consumer::new(
        queue.clone(),
        processor.clone(),
        CycleTracer::new("scripted-queue"),
        settings(Duration::from_millis(2)),
    );

    let stats = consumer.run(shutdown).await;

    assert_eq!(*processor.calls.lock().unwrap(), vec!["rh-1".to_string()]);
    assert_eq!(queue.deleted(), vec!["rh-1".to_string()]);
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.abandoned, 2);
}

/// Long poll that only returns after a minute, like a quiet queue with a large wait bound.
#[derive(Default)]
struct HangingQueue {
    receive_calls: Mutex<usize>,
    delete_attempts: Mutex<Vec<String>>,
}

#[async_trait]
impl QueueSource for HangingQueue {
    fn name(&self) -> &str {
        "hanging-queue"
    }

    async fn receive(&self, _max_messages: i32, _wait_seconds: i32) -> Result<Vec<QueueMessage>> {
        *self.receive_calls.lock().unwrap() += 1;
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(vec![msg("rh-late", "late")])
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.delete_attempts.lock().unwrap().push(receipt_handle.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_interrupts_blocking_poll() {
    let shutdown = CancellationToken::new();
    let queue = Arc::new(HangingQueue::default());
    let processor = Arc::new(RecordingProcessor::default());
    let consumer = Consumer::new(
        queue.clone(),
        processor.clone(),
        CycleTracer::new("hanging-queue"),
        settings(Duration::from_millis(5)),
    );

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let stats = consumer.run(shutdown).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(*queue.receive_calls.lock().unwrap(), 1);
    assert!(processor.calls().is_empty());
    assert!(queue.delete_attempts.lock().unwrap().is_empty());
    assert_eq!(stats.received, 0);
    assert_eq!(stats.acknowledged, 0);
}
