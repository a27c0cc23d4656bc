//! Queue persisted to a JSON file.
//!
//! The whole queue is rewritten after every mutation: serialized to
//! `<path>.tmp`, then renamed over `<path>`. The in-memory queue is the
//! source of truth; a failed write is logged and retried on the next
//! mutation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{EventQueue, MemoryQueue};
use crate::error::Result;
use crate::types::Message;

#[derive(Debug)]
pub struct FileQueue {
    inner: MemoryQueue,
    path: PathBuf,
    // Serializes file writes so an older snapshot never overwrites a newer one
    write_lock: Mutex<()>,
}

impl FileQueue {
    /// Open the queue stored at `path`, creating its directory if needed.
    ///
    /// A missing file yields an empty queue. A file that cannot be parsed is
    /// logged and replaced on the next write.
    pub async fn open(path: impl Into<PathBuf>, max_size: usize) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let messages = read_messages(&path).await?;
        debug!(path = ?path, count = messages.len(), "Opened event queue file");

        Ok(Self {
            inner: MemoryQueue::with_messages(max_size, messages)?,
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.inner.snapshot().await;
        let content = serde_json::to_vec(&snapshot)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn persist_or_warn(&self) {
        if let Err(e) = self.persist().await {
            warn!(path = ?self.path, error = %e, "Failed to persist event queue");
        }
    }
}

async fn read_messages(path: &Path) -> Result<Vec<Message>> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice(&content) {
        Ok(messages) => Ok(messages),
        Err(e) => {
            warn!(path = ?path, error = %e, "Discarding unreadable event queue file");
            Ok(Vec::new())
        }
    }
}

#[async_trait]
impl EventQueue for FileQueue {
    async fn push(&self, message: Message) -> Result<usize> {
        let len = self.inner.push(message).await?;
        self.persist_or_warn().await;
        Ok(len)
    }

    async fn peek(&self, limit: usize) -> Result<Vec<Message>> {
        self.inner.peek(limit).await
    }

    async fn remove(&self, message_ids: &[String]) -> Result<usize> {
        let removed = self.inner.remove(message_ids).await?;
        if removed > 0 {
            self.persist_or_warn().await;
        }
        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await?;
        self.persist_or_warn().await;
        Ok(())
    }
}
