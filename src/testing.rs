use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use archiver::ArchiveConfig;
use axum::Router;
use blob_store::memory::MemoryBlobStore;
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, routes::create_routes, service::Service};

pub struct TestService {
    pub service: Service,
    pub blob_store: Arc<MemoryBlobStore>,
    temp_dir: TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let cfg = ServerConfig {
            archive: ArchiveConfig {
                temp_dir: temp_dir.path().join("archives"),
                compression_level: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        let blob_store = Arc::new(MemoryBlobStore::new());
        let service = Service::with_blob_store(cfg, blob_store.clone()).await?;

        Ok(Self {
            service,
            blob_store,
            temp_dir,
        })
    }

    pub fn router(&self) -> Router {
        create_routes(self.service.route_state(), None)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.temp_dir.path().join("archives")
    }

    /// Archive files currently on disk.
    pub fn archive_files(&self) -> usize {
        std::fs::read_dir(self.archive_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}
