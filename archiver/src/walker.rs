use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use async_stream::stream;
use blob_store::{is_folder_key, BlobStore, BlobStoreError};
use futures::{stream::FuturesUnordered, Stream, StreamExt};
use tracing::{debug, trace};

use crate::ArchiveError;

/// An object that holds content and becomes one archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafObject {
    pub key: String,
    /// `key` with the walk's root prefix stripped. Never empty.
    pub relative_path: String,
    pub size: u64,
}

/// Expands a root prefix into every leaf object below it.
///
/// Folders are expanded breadth-first from an explicit work queue with at
/// most `max_concurrent_listings` listing calls in flight.
pub struct KeyTreeWalker {
    store: Arc<dyn BlobStore>,
    root: String,
    max_concurrent_listings: usize,
}

impl KeyTreeWalker {
    pub fn new(
        store: Arc<dyn BlobStore>,
        root: impl Into<String>,
        max_concurrent_listings: usize,
    ) -> Self {
        Self {
            store,
            root: root.into(),
            max_concurrent_listings: max_concurrent_listings.max(1),
        }
    }

    /// Lazily walks the tree. The stream ends with the first listing error,
    /// or with [`ArchiveError::NotFound`] when a non-empty root lists nothing.
    pub fn walk(self) -> impl Stream<Item = Result<LeafObject, ArchiveError>> + Send + 'static {
        let KeyTreeWalker {
            store,
            root,
            max_concurrent_listings,
        } = self;

        stream! {
            let mut queue = VecDeque::from([root.clone()]);
            let mut listed = HashSet::from([root.clone()]);
            let mut yielded = HashSet::new();
            let mut in_flight = FuturesUnordered::new();

            loop {
                while in_flight.len() < max_concurrent_listings {
                    let Some(prefix) = queue.pop_front() else {
                        break;
                    };
                    let store = store.clone();
                    in_flight.push(async move {
                        let listing = store.list_objects(&prefix).await;
                        (prefix, listing)
                    });
                }

                let Some((prefix, listing)) = in_flight.next().await else {
                    break;
                };
                let entries = match listing {
                    Ok(entries) => entries,
                    Err(BlobStoreError::NotFound(_)) => Vec::new(),
                    Err(e) => {
                        yield Err(ArchiveError::transport(prefix, e));
                        return;
                    }
                };
                trace!(prefix = %prefix, entries = entries.len(), "listed prefix");

                if entries.is_empty() && prefix == root && !root.is_empty() {
                    yield Err(ArchiveError::NotFound(root));
                    return;
                }

                for entry in entries {
                    // The listed prefix's own marker, or a store answering
                    // outside of what was asked.
                    if entry.key.len() <= prefix.len() || !entry.key.starts_with(prefix.as_str()) {
                        continue;
                    }
                    if entry.is_folder || is_folder_key(&entry.key) {
                        if listed.insert(entry.key.clone()) {
                            queue.push_back(entry.key);
                        }
                        continue;
                    }
                    if !yielded.insert(entry.key.clone()) {
                        continue;
                    }
                    let relative_path = entry.key[root.len()..].to_string();
                    yield Ok(LeafObject {
                        key: entry.key,
                        relative_path,
                        size: entry.size,
                    });
                }
            }
            debug!(root = %root, leaves = yielded.len(), folders = listed.len(), "walk complete");
        }
    }
}
