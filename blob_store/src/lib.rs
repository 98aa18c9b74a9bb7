//! Blob store access for the bucket browser.
//!
//! [`BlobStore`] is the narrow capability the rest of the service depends on:
//! a delimiter-style prefix listing and a streamed object read. [`BlobStorage`]
//! implements it on top of S3 or the local filesystem through `object_store`,
//! and [`memory::MemoryBlobStore`] is an in-memory implementation used as a
//! test double.

use std::{fmt, io, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use object_store::{aws::AmazonS3Builder, local::LocalFileSystem, path::Path, ObjectStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod memory;

/// Separator that turns a key into a "folder".
pub const FOLDER_SEPARATOR: char = '/';

/// Returns true when the key denotes a folder rather than an object.
pub fn is_folder_key(key: &str) -> bool {
    key.ends_with(FOLDER_SEPARATOR)
}

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("blob store request failed")]
    Transport(#[source] anyhow::Error),
}

impl BlobStoreError {
    pub fn transport(e: impl Into<anyhow::Error>) -> Self {
        Self::Transport(e.into())
    }

    fn from_object_store(key: &str, e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { .. } => Self::NotFound(key.to_string()),
            other => Self::Transport(anyhow::Error::new(other).context(format!("key {key:?}"))),
        }
    }
}

impl From<BlobStoreError> for io::Error {
    fn from(e: BlobStoreError) -> Self {
        io::Error::other(e)
    }
}

/// One entry of a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub is_folder: bool,
    pub size: u64,
}

impl ObjectEntry {
    pub fn object(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            is_folder: false,
            size,
        }
    }

    pub fn folder(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_folder: true,
            size: 0,
        }
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, BlobStoreError>>;

/// An opened object. Dropping it closes the underlying connection.
pub struct ObjectStream {
    pub key: String,
    pub size: u64,
    /// Seconds since the unix epoch, when the backend reports it.
    pub last_modified: Option<u64>,
    pub body: ByteStream,
}

impl fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStream")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("last_modified", &self.last_modified)
            .field("body", &"<hidden>")
            .finish()
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Lists the direct children of `prefix`. Folders are returned as keys
    /// ending with [`FOLDER_SEPARATOR`]; a folder marker equal to `prefix`
    /// itself may be part of the result.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BlobStoreError>;

    /// Opens a byte stream over the content of `key`.
    async fn get_object_stream(&self, key: &str) -> Result<ObjectStream, BlobStoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskStorageConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    pub s3: Option<S3Config>,
    pub disk: Option<DiskStorageConfig>,
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        BlobStorageConfig {
            s3: None,
            disk: Some(DiskStorageConfig {
                path: "blobs".to_string(),
            }),
        }
    }
}

fn s3_storage(s3: &S3Config) -> anyhow::Result<impl ObjectStore> {
    // AmazonS3Builder::from_env picks up AWS_* credentials and
    // AWS_ENDPOINT_URL for localstack/minio.
    AmazonS3Builder::from_env()
        .with_region(s3.region.as_str())
        .with_allow_http(true)
        .with_bucket_name(s3.bucket.clone())
        .build()
        .context("unable to build S3 client")
}

fn file_storage(disk: &DiskStorageConfig) -> anyhow::Result<impl ObjectStore> {
    std::fs::create_dir_all(&disk.path)
        .with_context(|| format!("unable to create blob directory {}", disk.path))?;
    LocalFileSystem::new_with_prefix(&disk.path)
        .with_context(|| format!("unable to open blob directory {}", disk.path))
}

/// [`BlobStore`] backed by an `object_store` implementation.
#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
}

impl BlobStorage {
    pub fn new(config: &BlobStorageConfig) -> anyhow::Result<Self> {
        let object_store: Arc<dyn ObjectStore> = if let Some(s3) = config.s3.as_ref() {
            info!(bucket = %s3.bucket, region = %s3.region, "using s3 blob storage");
            Arc::new(s3_storage(s3)?)
        } else {
            let disk = config.disk.clone().unwrap_or_else(|| DiskStorageConfig {
                path: "blobs".to_string(),
            });
            info!(path = %disk.path, "using disk blob storage");
            Arc::new(file_storage(&disk)?)
        };
        Ok(Self { object_store })
    }
}

fn parse_location(key: &str) -> Result<Path, BlobStoreError> {
    Path::parse(key).map_err(|e| BlobStoreError::InvalidKey {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl BlobStore for BlobStorage {
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BlobStoreError> {
        let location = if prefix.is_empty() {
            None
        } else {
            Some(parse_location(prefix)?)
        };
        let listing = self
            .object_store
            .list_with_delimiter(location.as_ref())
            .await
            .map_err(|e| BlobStoreError::from_object_store(prefix, e))?;
        debug!(
            prefix,
            folders = listing.common_prefixes.len(),
            objects = listing.objects.len(),
            "listed prefix"
        );

        let folders = listing
            .common_prefixes
            .into_iter()
            .map(|p| ObjectEntry::folder(format!("{p}{FOLDER_SEPARATOR}")));
        let objects = listing
            .objects
            .into_iter()
            .map(|meta| ObjectEntry::object(meta.location.to_string(), meta.size as u64));
        Ok(folders.chain(objects).collect())
    }

    async fn get_object_stream(&self, key: &str) -> Result<ObjectStream, BlobStoreError> {
        if key.is_empty() || is_folder_key(key) {
            return Err(BlobStoreError::InvalidKey {
                key: key.to_string(),
                reason: "not an object key".to_string(),
            });
        }
        let location = parse_location(key)?;
        let result = self
            .object_store
            .get(&location)
            .await
            .map_err(|e| BlobStoreError::from_object_store(key, e))?;
        let size = result.meta.size as u64;
        let last_modified = u64::try_from(result.meta.last_modified.timestamp()).ok();

        let stream_key = key.to_string();
        let body = result
            .into_stream()
            .map_err(move |e| BlobStoreError::from_object_store(&stream_key, e))
            .boxed();

        Ok(ObjectStream {
            key: key.to_string(),
            size,
            last_modified,
            body,
        })
    }
}
