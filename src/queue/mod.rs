pub mod consumer;
pub mod source;
pub mod sqs;

pub use consumer::{Consumer, ConsumerSettings, ConsumerStats, CycleReport, MessageOutcome};
pub use source::{QueueMessage, QueueSource};
pub use sqs::SqsSource;
