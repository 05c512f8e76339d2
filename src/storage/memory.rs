use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tokio::sync::RwLock;

use super::{ByteStore, ByteStream, ObjectMeta, StoreError, Usage, validate_key};

#[derive(Debug)]
struct MemoryObject {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<&MemoryObject> for ObjectMeta {
    fn from(value: &MemoryObject) -> Self {
        Self {
            size: value.data.len() as u64,
            created: value.created,
        }
    }
}

/// Byte store that keeps every object in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, MemoryObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the creation time of an object, so tests can age it.
    #[cfg(test)]
    pub(crate) async fn backdate(&self, key: &str, created: DateTime<Utc>) {
        if let Some(object) = self.objects.write().await.get_mut(key) {
            object.created = created;
        }
    }
}

#[async_trait::async_trait]
impl ByteStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(
        &self,
        key: &str,
        mut body: ByteStream,
        size: Option<u64>,
    ) -> Result<u64, StoreError> {
        validate_key(self.name(), key)?;

        let mut buf = BytesMut::new();
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(StoreError::io(self.name(), key))?
        {
            buf.extend_from_slice(&chunk);
        }

        let received = buf.len() as u64;
        if let Some(declared) = size {
            if declared != received {
                return Err(StoreError::SizeMismatch {
                    engine: self.name(),
                    key: key.to_string(),
                    declared,
                    received,
                });
            }
        }

        self.objects.write().await.insert(
            key.to_string(),
            MemoryObject {
                created: Utc::now(),
                data: buf.freeze(),
            },
        );

        Ok(received)
    }

    async fn get(&self, key: &str) -> Result<(ByteStream, u64), StoreError> {
        let objects = self.objects.read().await;
        let object = objects.get(key).ok_or_else(|| StoreError::NotFound {
            engine: self.name(),
            key: key.to_string(),
        })?;

        let data = object.data.clone();
        let size = data.len() as u64;
        Ok((super::once(data), size))
    }

    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        let objects = self.objects.read().await;
        objects
            .get(key)
            .map(ObjectMeta::from)
            .ok_or_else(|| StoreError::NotFound {
                engine: self.name(),
                key: key.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn usage(&self, prefix: &str) -> Result<Usage, StoreError> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .fold(Usage::default(), |usage, (_, object)| Usage {
                bytes: usage.bytes + object.data.len() as u64,
                count: usage.count + 1,
            }))
    }
}
