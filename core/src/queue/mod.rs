//! Message model and the per-queue message buffer.

pub mod buffer;
pub mod message;

pub use buffer::{MessageReader, QueueBuffer};
pub use message::{Message, MessageData, Metadata};
