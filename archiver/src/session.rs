use std::{
    fs::File,
    io::{self, BufWriter},
    path::{Path, PathBuf},
    sync::Arc,
};

use blob_store::BlobStore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::{
    io::{StreamReader, SyncIoBridge},
    sync::CancellationToken,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    assembler::{ArchiveAssembler, DEFAULT_COMPRESSION_LEVEL},
    error::FailureRecord,
    fetch::{FetchCoordinator, FetchRegistry, PendingFetch},
    walker::KeyTreeWalker,
    ArchiveError,
};

pub const ARCHIVE_EXTENSION: &str = "tar.zst";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Walking,
    FetchingAndAssembling,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory holding archives while they are built and served.
    pub temp_dir: PathBuf,
    pub max_concurrent_fetches: usize,
    pub max_concurrent_listings: usize,
    pub compression_level: i32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("bucket-browser"),
            max_concurrent_fetches: 16,
            max_concurrent_listings: 4,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// State shared by every task of one session.
pub(crate) struct SessionContext {
    pub(crate) failure: FailureRecord,
    pub(crate) registry: Arc<FetchRegistry>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl SessionContext {
    pub(crate) fn new(cancel: CancellationToken, state: watch::Sender<SessionState>) -> Self {
        Self {
            failure: FailureRecord::default(),
            registry: FetchRegistry::new(),
            cancel,
            state,
        }
    }

    /// Records the session's first failure and tears down everything in
    /// flight. Later failures, and errors caused by the teardown of a
    /// cancelled session, are logged and dropped.
    pub(crate) fn fail(&self, err: ArchiveError) {
        if self.is_cancelled() {
            debug!(error = ?err, "ignoring failure of a cancelled archive session");
            return;
        }
        if self.failure.record(err) {
            self.shutdown();
        }
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        let destroyed = self.registry.destroy_all();
        if destroyed > 0 {
            debug!(destroyed, "destroyed open object streams");
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session is cancelled, with every open stream
    /// destroyed.
    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await;
        self.registry.destroy_all();
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "archive session state changed");
        }
    }

    fn take_failure(&self) -> Option<ArchiveError> {
        self.failure
            .take()
            .or_else(|| self.is_cancelled().then_some(ArchiveError::Cancelled))
    }
}

/// Cancels the session and destroys its streams when the driving future goes
/// away, e.g. because the client disconnected.
struct ShutdownOnDrop(Arc<SessionContext>);

impl Drop for ShutdownOnDrop {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Archive file on local disk, deleted on drop.
#[derive(Debug)]
struct TempArtifact {
    path: PathBuf,
}

impl TempArtifact {
    async fn create(dir: &Path) -> io::Result<(Self, File)> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.{ARCHIVE_EXTENSION}", nanoid::nanoid!()));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?
            .into_std()
            .await;
        Ok((Self { path }, file))
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed archive file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove archive file"),
        }
    }
}

/// A finished archive on local disk. The file is removed when this is
/// dropped.
#[derive(Debug)]
pub struct ArchiveArtifact {
    temp: TempArtifact,
    size: u64,
    entry_count: usize,
}

impl ArchiveArtifact {
    pub fn path(&self) -> &Path {
        &self.temp.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

struct Assembled {
    size: u64,
    entry_count: usize,
}

/// Builds one archive of everything below a prefix.
///
/// Walking, fetching and assembling run concurrently. The first failure
/// anywhere cancels the rest, destroys every open object stream and removes
/// the partial file.
pub struct ArchiveSession {
    store: Arc<dyn BlobStore>,
    config: ArchiveConfig,
    state: watch::Sender<SessionState>,
}

impl ArchiveSession {
    pub fn new(store: Arc<dyn BlobStore>, config: ArchiveConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Walking);
        Self {
            store,
            config,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub async fn run(self, root_prefix: &str) -> Result<ArchiveArtifact, ArchiveError> {
        self.run_with_cancellation(root_prefix, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), giving up with [`ArchiveError::Cancelled`]
    /// once `cancel` fires.
    #[instrument(skip_all, fields(root = %root_prefix))]
    pub async fn run_with_cancellation(
        self,
        root_prefix: &str,
        cancel: CancellationToken,
    ) -> Result<ArchiveArtifact, ArchiveError> {
        let ArchiveSession {
            store,
            config,
            state,
        } = self;
        let ctx = Arc::new(SessionContext::new(cancel.child_token(), state));
        let _shutdown = ShutdownOnDrop(ctx.clone());

        match build(&ctx, store, &config, root_prefix).await {
            Ok(artifact) => {
                ctx.set_state(SessionState::Done);
                info!(
                    entries = artifact.entry_count,
                    size = artifact.size,
                    "archive ready"
                );
                Ok(artifact)
            }
            Err(err) => {
                ctx.set_state(SessionState::Failed);
                warn!(error = ?err, "archive session failed");
                Err(err)
            }
        }
    }
}

async fn build(
    ctx: &Arc<SessionContext>,
    store: Arc<dyn BlobStore>,
    config: &ArchiveConfig,
    root_prefix: &str,
) -> Result<ArchiveArtifact, ArchiveError> {
    let (temp, file) = TempArtifact::create(&config.temp_dir).await?;
    let assembler = ArchiveAssembler::begin(BufWriter::new(file), config.compression_level)?;

    let (tx, rx) = mpsc::channel(config.max_concurrent_fetches.max(1));
    let mut assembling = tokio::task::spawn_blocking({
        let ctx = ctx.clone();
        move || assemble(assembler, rx, &ctx)
    });

    let walker = KeyTreeWalker::new(store.clone(), root_prefix, config.max_concurrent_listings);
    let coordinator = FetchCoordinator::new(store, ctx.clone(), config.max_concurrent_fetches);
    let issued = coordinator.fetch_all(walker.walk(), tx).await;
    debug!(issued, "walk and fetch finished");

    // Destroy streams on cancellation so a stalled read cannot pin the
    // assembler thread.
    let joined = tokio::select! {
        joined = &mut assembling => Some(joined),
        _ = ctx.cancelled() => None,
    };
    let joined = match joined {
        Some(joined) => joined,
        None => assembling.await,
    };
    let assembled = match joined {
        Ok(assembled) => assembled,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => None,
    };

    if let Some(err) = ctx.take_failure() {
        return Err(err);
    }
    let Assembled { size, entry_count } = assembled.ok_or(ArchiveError::Cancelled)?;
    Ok(ArchiveArtifact {
        temp,
        size,
        entry_count,
    })
}

/// Appends entries as their streams arrive. Runs on a blocking thread since
/// the codec is synchronous.
fn assemble(
    mut assembler: ArchiveAssembler<BufWriter<File>>,
    mut entries: mpsc::Receiver<PendingFetch>,
    ctx: &SessionContext,
) -> Option<Assembled> {
    while let Some(fetch) = entries.blocking_recv() {
        if ctx.is_cancelled() {
            break;
        }
        let key = fetch.leaf().key.clone();
        let relative_path = fetch.leaf().relative_path.clone();
        let (size, mtime) = (fetch.size(), fetch.last_modified());
        let reader = SyncIoBridge::new(StreamReader::new(fetch));
        if let Err(e) = assembler.append_entry(&relative_path, size, mtime, reader) {
            ctx.fail(e.attribute_to(&key));
            break;
        }
    }
    // Queued streams are closed along with the channel.
    drop(entries);

    if ctx.is_cancelled() {
        assembler.abort();
        return None;
    }

    ctx.set_state(SessionState::Finalizing);
    let entry_count = assembler.entry_count();
    let finished = assembler.finalize().and_then(|sink| {
        let file = sink
            .into_inner()
            .map_err(|e| ArchiveError::Codec(e.into_error()))?;
        Ok(file.metadata()?.len())
    });
    match finished {
        Ok(size) => Some(Assembled { size, entry_count }),
        Err(e) => {
            ctx.fail(e);
            None
        }
    }
}
