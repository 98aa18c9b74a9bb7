use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
        MutexGuard,
    },
};

use anyhow::anyhow;
use async_trait::async_trait;
use bucket_utils::GuardStreamExt;
use bytes::Bytes;
use futures::{stream, StreamExt};

use crate::{is_folder_key, BlobStore, BlobStoreError, ObjectEntry, ObjectStream};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Failure injected into a [`MemoryBlobStore`] for a given key or prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Listing the prefix fails.
    List,
    /// Opening the object fails.
    Get,
    /// The object opens, yields its first chunk, then errors.
    Read,
    /// The object opens, yields its first chunk, then never makes progress.
    Stall,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Bytes>,
    faults: HashMap<String, Fault>,
}

/// In-memory [`BlobStore`] with S3-style delimiter listing.
///
/// Keeps track of how many object streams are currently open so callers can
/// assert that nothing was leaked.
pub struct MemoryBlobStore {
    state: Mutex<State>,
    chunk_size: usize,
    open_streams: Arc<AtomicUsize>,
    opened_streams: AtomicUsize,
    list_calls: AtomicUsize,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            chunk_size: chunk_size.max(1),
            open_streams: Arc::new(AtomicUsize::new(0)),
            opened_streams: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the store from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.state().objects.insert(key.into(), data.into());
    }

    /// Adds an empty folder marker object, e.g. `empty/`.
    pub fn insert_folder(&self, key: impl Into<String>) {
        let key = key.into();
        debug_assert!(is_folder_key(&key));
        self.state().objects.insert(key, Bytes::new());
    }

    pub fn inject(&self, key: impl Into<String>, fault: Fault) {
        self.state().faults.insert(key.into(), fault);
    }

    /// Streams handed out and not dropped yet.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Streams handed out since the store was created.
    pub fn opened_streams(&self) -> usize {
        self.opened_streams.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn fault(&self, key: &str) -> Option<Fault> {
        self.state().faults.get(key).copied()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BlobStoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fault(prefix) == Some(Fault::List) {
            return Err(BlobStoreError::transport(anyhow!(
                "injected listing failure for {prefix:?}"
            )));
        }

        let state = self.state();
        let mut folders = BTreeSet::new();
        let mut entries = Vec::new();
        for (key, data) in state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            let rest = &key[prefix.len()..];
            match rest.find('/') {
                // the prefix's own marker
                _ if rest.is_empty() => entries.push(ObjectEntry {
                    key: key.clone(),
                    is_folder: is_folder_key(key),
                    size: data.len() as u64,
                }),
                Some(idx) => {
                    folders.insert(format!("{prefix}{}", &rest[..=idx]));
                }
                None => entries.push(ObjectEntry::object(key.clone(), data.len() as u64)),
            }
        }
        entries.extend(folders.into_iter().map(ObjectEntry::folder));
        Ok(entries)
    }

    async fn get_object_stream(&self, key: &str) -> Result<ObjectStream, BlobStoreError> {
        let fault = self.fault(key);
        if fault == Some(Fault::Get) {
            return Err(BlobStoreError::transport(anyhow!(
                "injected get failure for {key:?}"
            )));
        }
        let data = self
            .state()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound(key.to_string()))?;
        let size = data.len() as u64;

        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.chunk_size).min(data.len());
            chunks.push(data.slice(offset..end));
            offset = end;
        }

        let body = match fault {
            Some(Fault::Read) => {
                let failing_key = key.to_string();
                stream::iter(chunks.into_iter().take(1).map(Ok))
                    .chain(stream::once(async move {
                        Err(BlobStoreError::transport(anyhow!(
                            "injected read failure for {failing_key:?}"
                        )))
                    }))
                    .boxed()
            }
            Some(Fault::Stall) => stream::iter(chunks.into_iter().take(1).map(Ok))
                .chain(stream::pending())
                .boxed(),
            _ => stream::iter(chunks.into_iter().map(Ok)).boxed(),
        };

        self.opened_streams.fetch_add(1, Ordering::SeqCst);
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let open_streams = self.open_streams.clone();
        let body = body
            .guard(move || {
                open_streams.fetch_sub(1, Ordering::SeqCst);
            })
            .boxed();

        Ok(ObjectStream {
            key: key.to_string(),
            size,
            last_modified: None,
            body,
        })
    }
}
