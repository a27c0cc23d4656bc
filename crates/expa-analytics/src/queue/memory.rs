use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use super::EventQueue;
use crate::error::{AnalyticsError, Result};
use crate::types::Message;

/// Bounded in-memory queue
#[derive(Debug)]
pub struct MemoryQueue {
    messages: Mutex<VecDeque<Message>>,
    max_size: usize,
}

impl MemoryQueue {
    pub fn new(max_size: usize) -> Result<Self> {
        Self::with_messages(max_size, Vec::new())
    }

    /// Create a queue pre-filled with `messages`, keeping the newest `max_size`.
    pub fn with_messages(max_size: usize, messages: Vec<Message>) -> Result<Self> {
        if max_size == 0 {
            return Err(AnalyticsError::queue("max_size must be > 0"));
        }
        let mut deque: VecDeque<Message> = messages.into();
        while deque.len() > max_size {
            deque.pop_front();
        }
        Ok(Self {
            messages: Mutex::new(deque),
            max_size,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// All buffered messages, oldest first
    pub async fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn push(&self, message: Message) -> Result<usize> {
        let mut messages = self.messages.lock().await;
        if messages.len() >= self.max_size
            && let Some(dropped) = messages.pop_front()
        {
            warn!(
                message_id = %dropped.message_id,
                max_size = self.max_size,
                "Event queue full, dropping oldest event"
            );
        }
        messages.push_back(message);
        Ok(messages.len())
    }

    async fn peek(&self, limit: usize) -> Result<Vec<Message>> {
        let messages = self.messages.lock().await;
        Ok(messages.iter().take(limit).cloned().collect())
    }

    async fn remove(&self, message_ids: &[String]) -> Result<usize> {
        let ids: HashSet<&str> = message_ids.iter().map(String::as_str).collect();
        let mut messages = self.messages.lock().await;
        let before = messages.len();
        messages.retain(|m| !ids.contains(m.message_id.as_str()));
        Ok(before - messages.len())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.messages.lock().await.len())
    }

    async fn clear(&self) -> Result<()> {
        self.messages.lock().await.clear();
        Ok(())
    }
}
