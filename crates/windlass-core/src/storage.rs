//! Object storage contract for staging and control-plane documents.
//!
//! The contract is cloud object storage semantics:
//! - Conditional writes with preconditions (the CAS primitive everything
//!   else is built on)
//! - Opaque version tokens (`ETag` on S3, generation on GCS)
//! - Prefix listing and random-access reads
//! - Bounded-memory multipart uploads with an explicit abort hook
//!
//! Two backends ship in-tree: [`MemoryBackend`] for tests and
//! [`ObjectStoreBackend`] wrapping any [`object_store::ObjectStore`]
//! implementation (S3, GCS, Azure, local filesystem).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;

use crate::error::{Error, Result};

/// Precondition for conditional writes.
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if the object does not exist.
    DoesNotExist,
    /// Write only if the object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
///
/// A failed precondition is a normal result, never an error: callers use it
/// to detect lost races.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded; carries the new version token.
    Success {
        /// The object's version after the write.
        version: String,
    },
    /// Precondition was not met; carries the version that beat us.
    PreconditionFailed {
        /// The current version that caused the failure.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
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
    /// Opaque version token for CAS operations.
    pub version: String,
    /// Last modification timestamp, if the backend reports one.
    pub last_modified: Option<DateTime<Utc>>,
}

/// An in-flight multipart upload.
///
/// The upload is not visible at its path until [`complete`](Self::complete)
/// succeeds. Call [`abort`](Self::abort) on any failure path; cleanup is an
/// explicit hook, never a drop side effect.
#[async_trait]
pub trait MultipartUpload: Send {
    /// Uploads the next part. Parts are applied in call order.
    async fn write_part(&mut self, data: Bytes) -> Result<()>;

    /// Finalizes the upload, making the object visible.
    async fn complete(self: Box<Self>) -> Result<()>;

    /// Abandons the upload and releases any staged parts.
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Storage backend trait for object storage.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with an optional precondition.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object. Idempotent: succeeds if the object is absent.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects under a prefix. Order is backend-defined; callers
    /// requiring determinism must sort.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Reads object metadata without content. `None` if absent.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Starts a multipart upload to `path`.
    async fn start_multipart(&self, path: &str) -> Result<Box<dyn MultipartUpload>>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Versions are numeric, stored as strings, to
/// simulate generation-style CAS tokens.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
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
        self.objects
            .write()
            .map_err(|_| poisoned())?
            .remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| ObjectMeta {
                path: path.clone(),
                size: obj.data.len() as u64,
                version: obj.version.to_string(),
                last_modified: Some(obj.last_modified),
            })
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|obj| ObjectMeta {
            path: path.to_string(),
            size: obj.data.len() as u64,
            version: obj.version.to_string(),
            last_modified: Some(obj.last_modified),
        }))
    }

    async fn start_multipart(&self, path: &str) -> Result<Box<dyn MultipartUpload>> {
        Ok(Box::new(MemoryMultipart {
            objects: Arc::clone(&self.objects),
            path: path.to_string(),
            parts: BytesMut::new(),
        }))
    }
}

struct MemoryMultipart {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    path: String,
    parts: BytesMut,
}

#[async_trait]
impl MultipartUpload for MemoryMultipart {
    async fn write_part(&mut self, data: Bytes) -> Result<()> {
        self.parts.extend_from_slice(&data);
        Ok(())
    }

    async fn complete(self: Box<Self>) -> Result<()> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        let new_version = objects.get(&self.path).map_or(1, |o| o.version + 1);
        objects.insert(
            self.path,
            StoredObject {
                data: self.parts.freeze(),
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// object_store backend
// ---------------------------------------------------------------------------

/// Storage backend over any [`object_store::ObjectStore`] implementation.
///
/// The version token is the object's `ETag`; backends without conditional
/// put support will reject preconditioned writes, which surfaces as a
/// storage error rather than silent last-writer-wins.
pub struct ObjectStoreBackend {
    store: Arc<dyn object_store::ObjectStore>,
}

impl ObjectStoreBackend {
    /// Wraps an `object_store` implementation.
    #[must_use]
    pub fn new(store: Arc<dyn object_store::ObjectStore>) -> Self {
        Self { store }
    }

    fn map_err(path: &str, err: object_store::Error) -> Error {
        match err {
            object_store::Error::NotFound { .. } => {
                Error::NotFound(format!("object not found: {path}"))
            }
            other => Error::storage_with_source(format!("object store error at {path}"), other),
        }
    }

    fn version_of(meta: &object_store::ObjectMeta) -> String {
        meta.e_tag
            .clone()
            .or_else(|| meta.version.clone())
            .unwrap_or_default()
    }

    async fn current_version(&self, path: &object_store::path::Path) -> String {
        match self.store.head(path).await {
            Ok(meta) => Self::version_of(&meta),
            Err(_) => "0".to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let location = object_store::path::Path::from(path);
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| Self::map_err(path, e))?;
        result.bytes().await.map_err(|e| Self::map_err(path, e))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let location = object_store::path::Path::from(path);
        let mode = match &precondition {
            WritePrecondition::DoesNotExist => object_store::PutMode::Create,
            WritePrecondition::MatchesVersion(token) => {
                object_store::PutMode::Update(object_store::UpdateVersion {
                    e_tag: Some(token.clone()),
                    version: None,
                })
            }
            WritePrecondition::None => object_store::PutMode::Overwrite,
        };

        let options = object_store::PutOptions::from(mode);
        match self
            .store
            .put_opts(&location, object_store::PutPayload::from(data), options)
            .await
        {
            Ok(result) => Ok(WriteResult::Success {
                version: result.e_tag.or(result.version).unwrap_or_default(),
            }),
            Err(
                object_store::Error::AlreadyExists { .. }
                | object_store::Error::Precondition { .. },
            ) => Ok(WriteResult::PreconditionFailed {
                current_version: self.current_version(&location).await,
            }),
            Err(e) => Err(Self::map_err(path, e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let location = object_store::path::Path::from(path);
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Self::map_err(path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let location = object_store::path::Path::from(prefix);
        let metas: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&location))
            .try_collect()
            .await
            .map_err(|e| Self::map_err(prefix, e))?;

        Ok(metas
            .into_iter()
            .map(|meta| ObjectMeta {
                path: meta.location.to_string(),
                size: u64::try_from(meta.size).unwrap_or(u64::MAX),
                version: Self::version_of(&meta),
                last_modified: Some(meta.last_modified),
            })
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let location = object_store::path::Path::from(path);
        match self.store.head(&location).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                path: path.to_string(),
                size: u64::try_from(meta.size).unwrap_or(u64::MAX),
                version: Self::version_of(&meta),
                last_modified: Some(meta.last_modified),
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(Self::map_err(path, e)),
        }
    }

    async fn start_multipart(&self, path: &str) -> Result<Box<dyn MultipartUpload>> {
        let location = object_store::path::Path::from(path);
        let upload = self
            .store
            .put_multipart(&location)
            .await
            .map_err(|e| Self::map_err(path, e))?;
        Ok(Box::new(ObjectStoreMultipart {
            path: path.to_string(),
            upload,
        }))
    }
}

struct ObjectStoreMultipart {
    path: String,
    upload: Box<dyn object_store::MultipartUpload>,
}

#[async_trait]
impl MultipartUpload for ObjectStoreMultipart {
    async fn write_part(&mut self, data: Bytes) -> Result<()> {
        self.upload
            .put_part(object_store::PutPayload::from(data))
            .await
            .map_err(|e| ObjectStoreBackend::map_err(&self.path, e))
    }

    async fn complete(mut self: Box<Self>) -> Result<()> {
        self.upload
            .complete()
            .await
            .map(|_| ())
            .map_err(|e| ObjectStoreBackend::map_err(&self.path, e))
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.upload
            .abort()
            .await
            .map_err(|e| ObjectStoreBackend::map_err(&self.path, e))
    }
}
