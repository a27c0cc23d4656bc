//! Event buffering between enqueue and delivery.

mod file;
mod memory;

pub use file::FileQueue;
pub use memory::MemoryQueue;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Message;

/// Storage trait for buffered analytics messages.
///
/// Messages leave in insertion order. A bounded queue drops its oldest
/// message to make room for a new one.
///
/// A returned `Ok` means the in-memory state changed. Implementations that
/// mirror to durable storage log a failed write instead of failing the call,
/// so callers never see an error for a change that did take effect.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Append a message. Returns the queue length afterwards.
    async fn push(&self, message: Message) -> Result<usize>;

    /// Copy up to `limit` messages from the front without removing them
    async fn peek(&self, limit: usize) -> Result<Vec<Message>>;

    /// Remove the messages with the given ids. Returns how many were removed.
    async fn remove(&self, message_ids: &[String]) -> Result<usize>;

    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    async fn clear(&self) -> Result<()>;
}
