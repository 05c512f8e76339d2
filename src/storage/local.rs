use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{ByteStore, ByteStream, ObjectMeta, StoreError, Usage, validate_key};

const TEMP_DIR: &str = ".tmp";

/// Byte store backed by a directory tree. Objects are written to a temporary
/// file and renamed into place, so a key is either absent or complete.
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    async fn write_temp(
        &self,
        key: &str,
        mut file: tokio::fs::File,
        mut body: ByteStream,
    ) -> Result<u64, StoreError> {
        let mut written = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(StoreError::io(self.name(), key))?
        {
            file.write_all(&chunk)
                .await
                .map_err(StoreError::io(self.name(), key))?;
            written += chunk.len() as u64;
        }

        file.sync_all()
            .await
            .map_err(StoreError::io(self.name(), key))?;

        Ok(written)
    }

    async fn walk(&self, dir: PathBuf) -> Result<Vec<(String, std::fs::Metadata)>, StoreError> {
        let mut found = vec![];
        let mut pending = vec![dir];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(StoreError::Io {
                        engine: self.name(),
                        key: dir.to_string_lossy().into_owned(),
                        source: err,
                    });
                }
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(StoreError::io(self.name(), &dir.to_string_lossy()))?
            {
                let path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    // Raced with a delete
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        return Err(StoreError::Io {
                            engine: self.name(),
                            key: path.to_string_lossy().into_owned(),
                            source: err,
                        });
                    }
                };

                if metadata.is_dir() {
                    if path != self.root.join(TEMP_DIR) {
                        pending.push(path);
                    }
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                found.push((key, metadata));
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    /// Directory to start walking from for a key prefix.
    fn walk_root(&self, prefix: &str) -> PathBuf {
        match prefix.rsplit_once('/') {
            Some((dir, _)) => self.path(dir),
            None => self.root.clone(),
        }
    }
}

fn created(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait::async_trait]
impl ByteStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &str, body: ByteStream, size: Option<u64>) -> Result<u64, StoreError> {
        validate_key(self.name(), key)?;

        let temp_dir = self.root.join(TEMP_DIR);
        tokio::fs::create_dir_all(&temp_dir)
            .await
            .map_err(StoreError::io(self.name(), key))?;

        // The temp file is removed when `temp` drops: on every early return
        // and when the caller abandons this future mid-stream.
        let (file, temp) = tempfile::Builder::new()
            .tempfile_in(&temp_dir)
            .map_err(StoreError::io(self.name(), key))?
            .into_parts();

        let written = self
            .write_temp(key, tokio::fs::File::from_std(file), body)
            .await?;

        if let Some(declared) = size
            && declared != written
        {
            return Err(StoreError::SizeMismatch {
                engine: self.name(),
                key: key.to_string(),
                declared,
                received: written,
            });
        }

        let destination = self.path(key);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StoreError::io(self.name(), key))?;
        }

        temp.persist(&destination)
            .map_err(|err| StoreError::io(self.name(), key)(err.error))?;

        debug!(key, written, "Stored object");

        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<(ByteStream, u64), StoreError> {
        validate_key(self.name(), key)?;

        let file = tokio::fs::File::open(self.path(key))
            .await
            .map_err(StoreError::io(self.name(), key))?;
        let size = file
            .metadata()
            .await
            .map_err(StoreError::io(self.name(), key))?
            .len();

        Ok((Box::pin(ReaderStream::new(file)), size))
    }

    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        validate_key(self.name(), key)?;

        let metadata = tokio::fs::metadata(self.path(key))
            .await
            .map_err(StoreError::io(self.name(), key))?;

        Ok(ObjectMeta {
            size: metadata.len(),
            created: created(&metadata),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(self.name(), key)?;

        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StoreError::io(self.name(), key)(err)),
        }

        // Prune now-empty parents, stopping at the first one that still has entries
        let mut dir = self.path(key);
        while dir.pop() && dir != self.root {
            if tokio::fs::remove_dir(&dir).await.is_err() {
                break;
            }
        }

        Ok(())
    }

    async fn purge_temp(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let temp_dir = self.root.join(TEMP_DIR);
        let mut entries = match tokio::fs::read_dir(&temp_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(StoreError::io(self.name(), TEMP_DIR)(err)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StoreError::io(self.name(), TEMP_DIR))?
        {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            if !metadata.is_file() || modified >= older_than {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::io(self.name(), TEMP_DIR)(err)),
            }
        }

        if removed > 0 {
            debug!(removed, "Removed abandoned temporary files");
        }

        Ok(removed)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .walk(self.walk_root(prefix))
            .await?
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect())
    }

    async fn usage(&self, prefix: &str) -> Result<Usage, StoreError> {
        Ok(self
            .walk(self.walk_root(prefix))
            .await?
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .fold(Usage::default(), |usage, (_, metadata)| Usage {
                bytes: usage.bytes + metadata.len(),
                count: usage.count + 1,
            }))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use bytes::Bytes;
    use futures::{StreamExt, stream};
    use tempfile::tempdir;

    use super::*;
    use crate::storage::{once, read_all};

    #[tokio::test]
    async fn put_get_delete() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        store
            .put("blobs/sha256/ab/abcd", once("hello world"), Some(11))
            .await
            .unwrap();

        let meta = store.stat("blobs/sha256/ab/abcd").await.unwrap();
        assert_eq!(meta.size, 11);

        let (body, size) = store.get("blobs/sha256/ab/abcd").await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(read_all(body).await.unwrap(), "hello world");

        store.delete("blobs/sha256/ab/abcd").await.unwrap();
        assert!(!store.exists("blobs/sha256/ab/abcd").await.unwrap());
        assert!(!dir.path().join("blobs").exists());

        store.delete("blobs/sha256/ab/abcd").await.unwrap();
    }

    #[tokio::test]
    async fn interrupted_put_leaves_nothing() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        let body: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(std::io::Error::other("client went away")),
        ]));

        assert!(store.put("uploads/s/0", body, None).await.is_err());
        assert!(!store.exists("uploads/s/0").await.unwrap());
        assert_eq!(store.list("").await.unwrap(), Vec::<String>::new());
    }

    fn temp_files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir.join(TEMP_DIR))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn abandoned_put_removes_its_temp_file() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));

        // One chunk, then a client that never sends the rest.
        let body: ByteStream = Box::pin(
            stream::iter(vec![Ok(Bytes::from_static(b"abc"))]).chain(stream::pending()),
        );
        let put = tokio::spawn({
            let store = store.clone();
            async move { store.put("uploads/s/0", body, None).await }
        });

        while temp_files(dir.path()) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        put.abort();
        assert!(put.await.unwrap_err().is_cancelled());

        assert_eq!(temp_files(dir.path()), 0);
        assert!(!store.exists("uploads/s/0").await.unwrap());
    }

    #[tokio::test]
    async fn blocked_destination_removes_temp_file() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        // A file where the key needs a directory.
        store.put("blobs/x", once("a"), None).await.unwrap();
        assert!(store.put("blobs/x/y", once("b"), None).await.is_err());

        assert_eq!(temp_files(dir.path()), 0);
        assert_eq!(store.list("").await.unwrap(), vec!["blobs/x"]);
    }

    #[tokio::test]
    async fn purges_old_temp_files() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        std::fs::create_dir_all(dir.path().join(TEMP_DIR)).unwrap();
        std::fs::write(dir.path().join(TEMP_DIR).join("left-by-a-crash"), b"abc").unwrap();

        assert_eq!(store.purge_temp(Utc::now() - chrono::Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(temp_files(dir.path()), 1);

        assert_eq!(store.purge_temp(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn size_mismatch() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(matches!(
            store.put("a", once("abc"), Some(4)).await,
            Err(StoreError::SizeMismatch {
                declared: 4,
                received: 3,
                ..
            })
        ));
        assert!(!store.exists("a").await.unwrap());
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn list_and_usage() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        store.put("uploads/x/1", once("ab"), None).await.unwrap();
        store.put("uploads/x/2", once("cde"), None).await.unwrap();
        store.put("uploads/y/1", once("f"), None).await.unwrap();
        store.put("blobs/z", once("ghij"), None).await.unwrap();

        assert_eq!(
            store.list("uploads/").await.unwrap(),
            vec!["uploads/x/1", "uploads/x/2", "uploads/y/1"]
        );
        assert_eq!(store.list("uploads/x/").await.unwrap().len(), 2);
        assert_eq!(
            store.usage("").await.unwrap(),
            Usage {
                bytes: 10,
                count: 4
            }
        );
        assert_eq!(store.list("missing/").await.unwrap(), Vec::<String>::new());
    }
}
