//! Key to bytes storage. The registry only ever addresses the store by key;
//! it knows nothing about images.

use std::{fmt, io, pin::Pin};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use thiserror::Error;

pub use local::LocalStore;
pub use memory::MemoryStore;

mod local;
mod memory;

/// A stream of object contents.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// Object metadata common to every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub created: DateTime<Utc>,
}

/// Space consumed under a prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub bytes: u64,
    pub count: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{engine}: object {key} not found")]
    NotFound { engine: &'static str, key: String },
    #[error("{engine}: invalid key {key:?}")]
    InvalidKey { engine: &'static str, key: String },
    #[error("{engine}: object {key} declared {declared} bytes but received {received}")]
    SizeMismatch {
        engine: &'static str,
        key: String,
        declared: u64,
        received: u64,
    },
    #[error("{engine}: i/o error on {key}")]
    Io {
        engine: &'static str,
        key: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn io(engine: &'static str, key: &str) -> impl FnOnce(io::Error) -> StoreError {
        let key = key.to_string();
        move |source| match source.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound { engine, key },
            _ => StoreError::Io {
                engine,
                key,
                source,
            },
        }
    }
}

#[async_trait::async_trait]
pub trait ByteStore: fmt::Debug + Send + Sync {
    /// The name of the backend, used in errors and logs.
    fn name(&self) -> &'static str;

    /// Write an object. The object becomes visible only once the whole stream
    /// has been written. When `size` is given, a stream of any other length is
    /// rejected and nothing is stored. Returns the number of bytes written.
    async fn put(&self, key: &str, body: ByteStream, size: Option<u64>) -> Result<u64, StoreError>;

    async fn get(&self, key: &str) -> Result<(ByteStream, u64), StoreError>;

    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.stat(key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remove an object. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn usage(&self, prefix: &str) -> Result<Usage, StoreError>;

    /// Remove partial writes last touched before `older_than` that an
    /// interrupted process left behind. Returns how many were removed.
    async fn purge_temp(&self, _older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(0)
    }
}

/// Keys are relative, `/` separated and never escape the store.
pub(crate) fn validate_key(engine: &'static str, key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey {
            engine,
            key: key.to_string(),
        })
    }
}

/// Key of one chunk of an upload session. The nonce keeps two writers that
/// race for the same offset from clobbering each other's object.
pub(crate) fn chunk_key(session: &str, offset: u64, nonce: &uuid::Uuid) -> String {
    format!("uploads/{session}/{offset:020}-{nonce}")
}

/// Prefix owning every chunk of an upload session.
pub(crate) fn session_prefix(session: &str) -> String {
    format!("uploads/{session}/")
}

/// Collect a stream into memory. Only used for small objects and tests.
pub async fn read_all(mut stream: ByteStream) -> io::Result<Bytes> {
    use futures::TryStreamExt;

    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = stream.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// A stream yielding a single buffer.
pub fn once(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}
