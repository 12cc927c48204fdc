pub mod consumer;
pub mod pool;

pub use consumer::{JobOutcome, JobProcessor, ProcessingOutput, QueueConsumer, SkipReason};
pub use pool::ConsumerPool;
