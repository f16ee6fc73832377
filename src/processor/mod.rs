pub mod logging;

use async_trait::async_trait;

use crate::error::Result;
use crate::queue::QueueMessage;

pub use logging::LogProcessor;

/// The unit of work run for every delivered message.
///
/// Delivery is at-least-once: a message is redelivered after its visibility
/// timeout whenever processing fails or the delete after a success fails. An
/// implementation must therefore be safe to run more than once for the same
/// payload and must not keep state between calls that assumes otherwise.
///
/// Returning `Ok(())` is the only way a message gets deleted.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, message: &QueueMessage) -> Result<()>;
}
