//! Namespaced byte key/value store with prefix listing.
//!
//! A single trait generalizing "whole-file JSON rewrite" and "JSONL append"
//! persistence idioms, so the session store and share registry don't each
//! hand-roll their own file layout. Keys are forward-slash namespaced
//! (`session/info/<id>`) and map directly onto nested paths under a storage
//! root.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use sa_domain::error::{Error, Result};

use crate::event_bus::{BusEvent, EventBus};

#[async_trait]
pub trait Storage: Send + Sync {
    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn remove(&self, key: &str) -> Result<()>;
    /// All keys starting with `prefix`, in lexicographic (= ID) order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Blanket JSON helpers built on top of the byte contract above.
#[async_trait]
pub trait StorageJsonExt: Storage {
    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::FormatError(format!("{key}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn write_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| Error::FormatError(format!("{key}: {e}")))?;
        self.write(key, bytes).await
    }
}

impl<T: Storage + ?Sized> StorageJsonExt for T {}

/// Validate that a key is a safe relative namespace path: no leading slash,
/// no `..` components.
fn key_to_path(root: &Path, key: &str) -> Result<PathBuf> {
    if key.is_empty() || key.starts_with('/') {
        return Err(Error::Other(format!("invalid storage key: {key:?}")));
    }
    let rel = Path::new(key);
    for component in rel.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(Error::Other(format!("invalid storage key: {key:?}")));
        }
    }
    Ok(root.join(rel))
}

/// Filesystem-backed [`Storage`]: one file per key under a root directory.
pub struct FsStorage {
    root: PathBuf,
    events: std::sync::Arc<EventBus>,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>, events: std::sync::Arc<EventBus>) -> Self {
        Self {
            root: root.into(),
            events,
        }
    }

    fn publish(&self, key: &str, op: &str) {
        self.events.publish(BusEvent::new(
            "storage.updated",
            serde_json::json!({ "key": key, "op": op }),
        ));
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = key_to_path(&self.root, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write to a temp file then rename, so a crash never leaves a
        // partially-written value behind (per-key write atomicity, §9).
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        self.publish(key, "write");
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = key_to_path(&self.root, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = key_to_path(&self.root, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.publish(key, "remove");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let base = key_to_path(&self.root, prefix).unwrap_or_else(|_| self.root.clone());
        // Walk from the root so we return *keys* (relative, forward-slash),
        // not filesystem paths; a prefix may name a partial path segment.
        let search_root = if base.is_dir() {
            base
        } else {
            base.parent().map(Path::to_path_buf).unwrap_or(self.root.clone())
        };
        if !search_root.exists() {
            return Ok(keys);
        }
        walk(&self.root, &search_root, &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

fn walk<'a>(
    root: &'a Path,
    dir: &'a Path,
    out: &'a mut Vec<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                continue;
            }
            if path.is_dir() {
                walk(root, &path, out).await?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"));
            }
        }
        Ok(())
    })
}

/// Helper so callers don't need `serde_json::Value` imports just to probe
/// whether a key round-trips as valid JSON (used by a couple of admin
/// surfaces, not the hot path).
pub async fn read_value(storage: &dyn Storage, key: &str) -> Result<Option<Value>> {
    storage.read_json(key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        n: u32,
    }

    fn storage() -> (FsStorage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = std::sync::Arc::new(EventBus::new(16));
        (FsStorage::new(dir.path(), bus), dir)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (s, _dir) = storage();
        s.write("session/info/ses_1", b"hello".to_vec()).await.unwrap();
        let back = s.read("session/info/ses_1").await.unwrap();
        assert_eq!(back, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn read_missing_key_is_none() {
        let (s, _dir) = storage();
        assert_eq!(s.read("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_helpers_round_trip() {
        let (s, _dir) = storage();
        let sample = Sample { n: 42 };
        s.write_json("a/b", &sample).await.unwrap();
        let back: Option<Sample> = s.read_json("a/b").await.unwrap();
        assert_eq!(back, Some(sample));
    }

    #[tokio::test]
    async fn list_returns_keys_under_prefix_in_order() {
        let (s, _dir) = storage();
        s.write("session/info/ses_2", b"b".to_vec()).await.unwrap();
        s.write("session/info/ses_1", b"a".to_vec()).await.unwrap();
        s.write("share/shr_1", b"c".to_vec()).await.unwrap();
        let keys = s.list("session/info/").await.unwrap();
        assert_eq!(keys, vec!["session/info/ses_1", "session/info/ses_2"]);
    }

    #[tokio::test]
    async fn remove_then_read_is_none() {
        let (s, _dir) = storage();
        s.write("k", b"v".to_vec()).await.unwrap();
        s.remove("k").await.unwrap();
        assert_eq!(s.read("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_publishes_storage_updated_event() {
        let dir = tempfile::tempdir().unwrap();
        let bus = std::sync::Arc::new(EventBus::new(16));
        let mut sub = bus.subscribe("storage.updated");
        let s = FsStorage::new(dir.path(), bus);
        s.write("k", b"v".to_vec()).await.unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, "storage.updated");
        assert_eq!(event.properties["key"], "k");
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let (s, _dir) = storage();
        let err = s.write("../escape", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }

    #[tokio::test]
    async fn corrupt_json_is_format_error() {
        let (s, _dir) = storage();
        s.write("bad", b"not json".to_vec()).await.unwrap();
        let err = s.read_json::<Sample>("bad").await.unwrap_err();
        assert!(matches!(err, Error::FormatError(_)));
    }
}
