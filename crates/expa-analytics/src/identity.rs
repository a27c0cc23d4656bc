use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::types::Identity;

/// Keeps the identity across restarts in a small JSON file.
///
/// Without a path the store is a no-op.
#[derive(Debug, Default)]
pub struct IdentityStore {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl IdentityStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read the stored identity. Missing or unreadable files give the default.
    pub async fn load(&self) -> Identity {
        let Some(path) = &self.path else {
            return Identity::default();
        };
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Identity::default(),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read identity file");
                return Identity::default();
            }
        };
        serde_json::from_slice(&content).unwrap_or_else(|e| {
            warn!(path = ?path, error = %e, "Discarding unreadable identity file");
            Identity::default()
        })
    }

    /// Write `identity` to `<path>.tmp`, then rename it over `<path>`.
    pub async fn save(&self, identity: &Identity) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_vec(identity)?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let store = IdentityStore::new(Some(dir.path().join("identity.json")));
        assert_eq!(store.load().await, Identity::default());

        let identity = Identity::new(Some("anon".into()), Some("user-7".into()));
        store.save(&identity).await.unwrap();
        assert_eq!(store.load().await, identity);
    }

    #[tokio::test]
    async fn test_in_memory_store_is_noop() {
        let store = IdentityStore::in_memory();
        store
            .save(&Identity::new(Some("anon".into()), None))
            .await
            .unwrap();
        assert_eq!(store.load().await, Identity::default());
        assert!(store.path().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_gives_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");
        tokio::fs::write(&path, b"{ nope").await.unwrap();

        let store = IdentityStore::new(Some(path));
        assert_eq!(store.load().await, Identity::default());
    }
}
