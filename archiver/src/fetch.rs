use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{ready, Context, Poll},
};

use blob_store::{BlobStore, BlobStoreError, ByteStream, ObjectStream};
use bytes::Bytes;
use futures::{
    pin_mut,
    stream::{AbortHandle, Abortable},
    Stream,
    StreamExt,
};
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tracing::{debug, trace, warn};

use crate::{session::SessionContext, walker::LeafObject, ArchiveError, SessionState};

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    open: HashMap<u64, AbortHandle>,
    closed: bool,
}

/// Every object stream opened by a session and not yet released.
#[derive(Default)]
pub struct FetchRegistry {
    inner: Mutex<RegistryInner>,
}

impl FetchRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn register(&self, handle: AbortHandle) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.closed {
            handle.abort();
        } else {
            inner.open.insert(id, handle);
        }
        id
    }

    fn deregister(&self, id: u64) {
        self.lock().open.remove(&id);
    }

    /// Aborts every registered stream and refuses new ones. Returns how many
    /// streams were still open.
    pub fn destroy_all(&self) -> usize {
        let handles: Vec<AbortHandle> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.open.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }

    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// An opened object stream owned by an archive session.
///
/// Holds its registry slot and a fetch permit; dropping it closes the stream,
/// deregisters it and lets the coordinator open the next one. Read as a
/// [`Stream`] of chunks; a stream destroyed through the registry yields a
/// `ConnectionAborted` error.
pub struct PendingFetch {
    leaf: LeafObject,
    size: u64,
    last_modified: Option<u64>,
    body: Abortable<ByteStream>,
    id: u64,
    registry: Arc<FetchRegistry>,
    _permit: OwnedSemaphorePermit,
}

impl PendingFetch {
    fn open(
        leaf: LeafObject,
        object: ObjectStream,
        permit: OwnedSemaphorePermit,
        registry: Arc<FetchRegistry>,
    ) -> Self {
        let (handle, registration) = AbortHandle::new_pair();
        let id = registry.register(handle);
        Self {
            leaf,
            size: object.size,
            last_modified: object.last_modified,
            body: Abortable::new(object.body, registration),
            id,
            registry,
            _permit: permit,
        }
    }

    pub fn leaf(&self) -> &LeafObject {
        &self.leaf
    }

    /// Size reported by the store when the object was opened.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn last_modified(&self) -> Option<u64> {
        self.last_modified
    }
}

impl Stream for PendingFetch {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = ready!(self.body.poll_next_unpin(cx));
        Poll::Ready(match next {
            Some(chunk) => Some(chunk.map_err(io::Error::from)),
            None if self.body.is_aborted() => Some(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("stream for {:?} was destroyed", self.leaf.key),
            ))),
            None => None,
        })
    }
}

impl Drop for PendingFetch {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

/// Opens one stream per leaf with bounded concurrency and hands the opened
/// streams to the assembler in completion order.
pub(crate) struct FetchCoordinator {
    store: Arc<dyn BlobStore>,
    ctx: Arc<SessionContext>,
    permits: Arc<Semaphore>,
}

impl FetchCoordinator {
    pub(crate) fn new(
        store: Arc<dyn BlobStore>,
        ctx: Arc<SessionContext>,
        max_concurrent_fetches: usize,
    ) -> Self {
        Self {
            store,
            ctx,
            permits: Arc::new(Semaphore::new(max_concurrent_fetches.max(1))),
        }
    }

    /// Drives `leaves` to completion or to the first failure. Returns once
    /// every spawned fetch has either handed its stream to `sink` or given
    /// up, so a closed `sink` means no more entries will ever arrive.
    pub(crate) async fn fetch_all<L>(&self, leaves: L, sink: mpsc::Sender<PendingFetch>) -> usize
    where
        L: Stream<Item = Result<LeafObject, ArchiveError>>,
    {
        pin_mut!(leaves);
        let mut tasks = JoinSet::new();
        let mut issued = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => break,
                next = leaves.next() => next,
            };
            let leaf = match next {
                Some(Ok(leaf)) => leaf,
                Some(Err(e)) => {
                    self.ctx.fail(e);
                    break;
                }
                None => break,
            };
            if issued == 0 {
                self.ctx.set_state(SessionState::FetchingAndAssembling);
            }

            let permit = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            issued += 1;
            tasks.spawn(fetch_one(
                self.store.clone(),
                leaf,
                permit,
                self.ctx.clone(),
                sink.clone(),
            ));

            while let Some(joined) = tasks.try_join_next() {
                reap(joined);
            }
        }

        drop(sink);
        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }
        debug!(issued, "all fetches settled");
        issued
    }
}

fn reap(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            std::panic::resume_unwind(e.into_panic());
        }
    }
}

async fn fetch_one(
    store: Arc<dyn BlobStore>,
    leaf: LeafObject,
    permit: OwnedSemaphorePermit,
    ctx: Arc<SessionContext>,
    sink: mpsc::Sender<PendingFetch>,
) {
    let opened = tokio::select! {
        biased;
        _ = ctx.cancelled() => return,
        opened = store.get_object_stream(&leaf.key) => opened,
    };
    let object = match opened {
        Ok(object) => object,
        Err(BlobStoreError::NotFound(_)) => {
            warn!(key = %leaf.key, "object disappeared after listing, leaving it out of the archive");
            return;
        }
        Err(e) => {
            ctx.fail(ArchiveError::transport(leaf.key, e));
            return;
        }
    };

    trace!(key = %object.key, size = object.size, "opened object stream");
    let fetch = PendingFetch::open(leaf, object, permit, ctx.registry.clone());
    if ctx.is_cancelled() {
        return;
    }
    tokio::select! {
        biased;
        _ = ctx.cancelled() => {}
        sent = sink.send(fetch) => {
            if sent.is_err() {
                debug!("assembler went away, dropping fetched stream");
            }
        }
    }
}
