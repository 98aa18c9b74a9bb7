use std::{io, sync::Mutex};

use blob_store::BlobStoreError;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("no objects found under prefix {0:?}")]
    NotFound(String),

    #[error("blob store error for {key:?}")]
    Transport {
        key: String,
        #[source]
        source: BlobStoreError,
    },

    #[error("archive codec error")]
    Codec(#[source] io::Error),

    #[error("duplicate archive entry {0:?}")]
    DuplicateEntry(String),

    #[error("archive session cancelled")]
    Cancelled,
}

impl ArchiveError {
    pub fn transport(key: impl Into<String>, source: BlobStoreError) -> Self {
        Self::Transport {
            key: key.into(),
            source,
        }
    }

    /// Re-attributes a codec error raised while copying `key` to the blob
    /// store when the I/O error was produced by the object stream itself.
    pub(crate) fn attribute_to(self, key: &str) -> Self {
        match self {
            Self::Codec(e) if carries_blob_store_error(&e) => {
                let source = e
                    .into_inner()
                    .and_then(|inner| inner.downcast::<BlobStoreError>().ok());
                match source {
                    Some(source) => Self::transport(key, *source),
                    None => Self::Codec(io::Error::other("object stream failed")),
                }
            }
            other => other,
        }
    }
}

fn carries_blob_store_error(e: &io::Error) -> bool {
    e.get_ref()
        .is_some_and(|inner| inner.is::<BlobStoreError>())
}

impl From<io::Error> for ArchiveError {
    fn from(e: io::Error) -> Self {
        Self::Codec(e)
    }
}

/// Holds the first failure of an archive session. Later failures are only
/// logged.
#[derive(Debug, Default)]
pub struct FailureRecord {
    first: Mutex<Option<ArchiveError>>,
}

impl FailureRecord {
    /// Records `err` if nothing was recorded yet. Returns true when `err` is
    /// the session's first failure.
    pub fn record(&self, err: ArchiveError) -> bool {
        let mut first = self.first.lock().unwrap_or_else(|p| p.into_inner());
        if first.is_some() {
            debug!(error = ?err, "suppressing secondary archive failure");
            return false;
        }
        *first = Some(err);
        true
    }

    pub fn is_failed(&self) -> bool {
        self.first
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    pub fn take(&self) -> Option<ArchiveError> {
        self.first.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}
