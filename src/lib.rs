//! Long-polling SQS consumer with at-least-once acknowledgment and per-cycle
//! trace propagation.
//!
//! The [`queue::Consumer`] drives a [`queue::QueueSource`] and a
//! [`processor::MessageProcessor`]: one receive per cycle, every returned
//! message processed in order, and a delete only after the processor
//! succeeded for that delivery.

pub mod error;
pub mod processor;
pub mod queue;
pub mod telemetry;
pub mod utils;

pub use error::ConsumerError;
