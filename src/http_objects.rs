use archiver::ArchiveError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use blob_store::{BlobStoreError, ObjectEntry};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: &str) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn not_implemented() -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED, "not implemented")
    }

    /// The details only go to the log; clients get a generic message.
    pub fn internal_error(e: anyhow::Error) -> Self {
        error!("internal error: {:?}", e);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<BlobStoreError> for ApiError {
    fn from(e: BlobStoreError) -> Self {
        match &e {
            BlobStoreError::NotFound(key) => Self::not_found(&format!("object not found: {key}")),
            BlobStoreError::InvalidKey { .. } => Self::bad_request(&e.to_string()),
            BlobStoreError::Transport(_) => Self::internal_error(e.into()),
        }
    }
}

impl From<ArchiveError> for ApiError {
    fn from(e: ArchiveError) -> Self {
        match &e {
            ArchiveError::NotFound(prefix) => {
                Self::not_found(&format!("no objects found under {prefix}"))
            }
            ArchiveError::Transport {
                source: BlobStoreError::InvalidKey { .. },
                ..
            } => Self::bad_request(&e.to_string()),
            ArchiveError::DuplicateEntry(_) => Self::conflict(&e.to_string()),
            _ => Self::internal_error(e.into()),
        }
    }
}

/// One child of a listed prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ObjectInfo {
    /// Full key; folders end with `/`.
    pub key: String,
    pub is_folder: bool,
    /// Size in bytes, 0 for folders.
    pub size: u64,
}

impl From<ObjectEntry> for ObjectInfo {
    fn from(entry: ObjectEntry) -> Self {
        Self {
            key: entry.key,
            is_folder: entry.is_folder,
            size: entry.size,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, IntoParams)]
pub struct ListParams {
    /// Folder to list; the bucket root when omitted.
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, IntoParams)]
pub struct DownloadParams {
    /// Object key, or a folder key ending with `/` to download the folder as
    /// an archive.
    pub key: Option<String>,
}
