use std::{
    fmt::Debug,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use archiver::ArchiveConfig;
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Environment variables with this prefix override the config file, e.g.
/// `BUCKET_BROWSER_ARCHIVE__MAX_CONCURRENT_FETCHES=8`.
pub const ENV_PREFIX: &str = "BUCKET_BROWSER_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub blob_storage: BlobStorageConfig,
    pub archive: ArchiveConfig,
    pub structured_logging: bool,
    /// Served as the router fallback when set.
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:8900".to_string(),
            blob_storage: Default::default(),
            archive: Default::default(),
            structured_logging: false,
            static_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &Path) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        Self::extract(Figment::new().merge(Yaml::string(&config_str)))
    }

    /// Defaults overridden by the environment only.
    pub fn from_env() -> Result<ServerConfig> {
        Self::extract(Figment::new())
    }

    fn extract(figment: Figment) -> Result<ServerConfig> {
        let config: ServerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.blob_storage.s3.is_some() && self.blob_storage.disk.is_some() {
            return Err(anyhow!("cannot specify both s3 and disk blob storage"));
        }
        if self.blob_storage.s3.is_none() && self.blob_storage.disk.is_none() {
            return Err(anyhow!("must specify one of s3 or disk blob storage"));
        }
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.archive.max_concurrent_fetches == 0 {
            return Err(anyhow!("archive.max_concurrent_fetches must be at least 1"));
        }
        if self.archive.max_concurrent_listings == 0 {
            return Err(anyhow!("archive.max_concurrent_listings must be at least 1"));
        }
        if !(1..=22).contains(&self.archive.compression_level) {
            return Err(anyhow!(
                "archive.compression_level must be between 1 and 22, got {}",
                self.archive.compression_level
            ));
        }
        if let Some(static_dir) = &self.static_dir {
            if !static_dir.is_dir() {
                return Err(anyhow!(
                    "static_dir {} is not a directory",
                    static_dir.display()
                ));
            }
        }
        Ok(())
    }
}
