use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use archiver::ARCHIVE_EXTENSION;
use axum_server::Handle;
use blob_store::{BlobStorage, BlobStore};
use tokio::signal;
use tracing::{error, info, warn};

use crate::{
    config::ServerConfig,
    routes::{create_routes, RouteState},
};

const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub blob_store: Arc<dyn BlobStore>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let blob_store = Arc::new(
            BlobStorage::new(&config.blob_storage).context("error initializing blob storage")?,
        );
        Self::with_blob_store(config, blob_store).await
    }

    pub async fn with_blob_store(config: ServerConfig, blob_store: Arc<dyn BlobStore>) -> Result<Self> {
        let temp_dir = &config.archive.temp_dir;
        tokio::fs::create_dir_all(temp_dir)
            .await
            .with_context(|| format!("unable to create archive directory {}", temp_dir.display()))?;
        let removed = remove_stale_archives(temp_dir).await?;
        if removed > 0 {
            info!(removed, dir = %temp_dir.display(), "removed archives left over by a previous run");
        }
        Ok(Self { config, blob_store })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            blob_store: self.blob_store.clone(),
            archive: self.config.archive.clone(),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(self.route_state(), self.config.static_dir.as_deref());
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

/// Archives only live while they are being built or served, so anything in
/// the directory at start-up belongs to a process that died.
async fn remove_stale_archives(dir: &Path) -> Result<usize> {
    let suffix = format!(".{ARCHIVE_EXTENSION}");
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(&suffix) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "unable to remove stale archive"),
        }
    }
    Ok(removed)
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
    info!("signal received, shutting down server gracefully");
}
