//! Storage backend abstraction for object storage.
//!
//! Every durable effect in Strata (table snapshots, replay markers) goes
//! through this contract:
//! - Conditional writes with preconditions (the only coordination primitive)
//! - Object metadata including an opaque version token
//! - Prefix listing
//!
//! The version token is an opaque `String` so that GCS generations, S3 `ETag`s
//! and the in-memory counter all fit the same shape.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true when the write landed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Opaque object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for object storage.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads entire object.
    ///
    /// Returns `Error::NotFound` if object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if precondition not met.
    /// Never returns error for precondition failure - that's a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object.
    ///
    /// Succeeds even if object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// **Ordering**: arbitrary. Callers requiring deterministic order sort by
    /// `path`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// JSON convenience layer over any [`StorageBackend`].
#[async_trait]
pub trait JsonStore {
    /// Reads and decodes a JSON object along with its version token.
    ///
    /// Returns `None` when the object does not exist.
    async fn read_json<T>(&self, path: &str) -> Result<Option<(T, String)>>
    where
        T: DeserializeOwned + Send;

    /// Encodes `value` as JSON and writes it under `precondition`.
    async fn write_json<T>(
        &self,
        path: &str,
        value: &T,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>
    where
        T: Serialize + Sync;
}

#[async_trait]
impl<S> JsonStore for S
where
    S: StorageBackend + ?Sized,
{
    async fn read_json<T>(&self, path: &str) -> Result<Option<(T, String)>>
    where
        T: DeserializeOwned + Send,
    {
        let Some(meta) = self.head(path).await? else {
            return Ok(None);
        };

        let bytes = match self.get(path).await {
            Ok(bytes) => bytes,
            // Deleted between head and get.
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::serialization(format!("failed to decode {path}: {e}")))?;
        Ok(Some((value, meta.version)))
    }

    async fn write_json<T>(
        &self,
        path: &str,
        value: &T,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>
    where
        T: Serialize + Sync,
    {
        let json = serde_json::to_vec(value)
            .map_err(|e| Error::serialization(format!("failed to encode {path}: {e}")))?;
        self.put(path, Bytes::from(json), precondition).await
    }
}

/// In-memory storage backend.
///
/// Thread-safe via `RwLock`; used by tests and single-process runs.
/// Versions are a per-object counter exposed as strings.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

fn poisoned() -> Error {
    Error::internal("lock poisoned")
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn object_count(&self) -> Result<usize> {
        Ok(self.objects.read().map_err(|_| poisoned())?.len())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Marker {
        signature: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_precondition_does_not_exist() {
        let backend = MemoryBackend::new();

        let result = backend
            .put(
                "new.json",
                Bytes::from("data"),
                WritePrecondition::DoesNotExist,
            )
            .await
            .expect("should succeed");
        assert!(result.is_success());

        let result = backend
            .put(
                "new.json",
                Bytes::from("data2"),
                WritePrecondition::DoesNotExist,
            )
            .await
            .expect("should succeed");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
        assert_eq!(
            backend.get("new.json").await.expect("get"),
            Bytes::from("data")
        );
    }

    #[tokio::test]
    async fn test_precondition_matches_version() {
        let backend = MemoryBackend::new();

        let WriteResult::Success { version: first } = backend
            .put("gen.json", Bytes::from("v1"), WritePrecondition::None)
            .await
            .expect("put")
        else {
            panic!("expected success");
        };

        let result = backend
            .put(
                "gen.json",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion(first.clone()),
            )
            .await
            .expect("put");
        assert!(result.is_success());

        let result = backend
            .put(
                "gen.json",
                Bytes::from("v3"),
                WritePrecondition::MatchesVersion(first),
            )
            .await
            .expect("put");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_list_with_prefix_and_delete() {
        let backend = MemoryBackend::new();
        for path in ["a/1.json", "a/2.json", "b/1.json"] {
            backend
                .put(path, Bytes::from("x"), WritePrecondition::None)
                .await
                .expect("put");
        }

        assert_eq!(backend.list("a/").await.expect("list").len(), 2);
        assert_eq!(backend.list("b/").await.expect("list").len(), 1);

        backend.delete("a/1.json").await.expect("delete");
        backend.delete("a/1.json").await.expect("delete is idempotent");
        assert_eq!(backend.list("a/").await.expect("list").len(), 1);
        assert_eq!(backend.object_count().expect("count"), 2);
    }

    #[tokio::test]
    async fn test_json_roundtrip_with_version() {
        let backend = MemoryBackend::new();
        let marker = Marker {
            signature: "abc".into(),
            count: 3,
        };

        backend
            .write_json("m.json", &marker, WritePrecondition::DoesNotExist)
            .await
            .expect("write");

        let (loaded, version): (Marker, String) = backend
            .read_json("m.json")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(loaded, marker);
        assert_eq!(version, "1");

        let missing: Option<(Marker, String)> =
            backend.read_json("absent.json").await.expect("read");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_json_decode_failure_is_serialization_error() {
        let backend = MemoryBackend::new();
        backend
            .put("bad.json", Bytes::from("{not json"), WritePrecondition::None)
            .await
            .expect("put");

        let err = backend
            .read_json::<Marker>("bad.json")
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
