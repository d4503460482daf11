//! Bulk-byte storage backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where version
//! content physically lives. Implementations cover the local
//! filesystem, bucket-routed Amazon S3, and a read-through overlay
//! composing two backends for migration.

pub mod backend;
pub mod filesystem;
pub mod overlay;
pub mod s3;

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use backend::StorageBackend;

/// Construct the configured storage backend, including overlay
/// composition of the two base kinds.
pub async fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    async fn base(config: &Config, kind: &str) -> anyhow::Result<Arc<dyn StorageBackend>> {
        match kind {
            "amazons3" => {
                let s3_config = config.s3_config.as_ref().ok_or_else(|| {
                    anyhow::anyhow!("storage backend 'amazons3' requires an s3_config section")
                })?;
                let backend = s3::S3Backend::new(s3_config).await?;
                info!("S3 storage backend initialized");
                Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
            }
            "filesystem" => {
                let backend = filesystem::FilesystemBackend::new(&config.storage_path)?;
                info!(
                    "Filesystem storage backend initialized at {}",
                    config.storage_path
                );
                Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
            }
            other => anyhow::bail!("unknown storage backend {other:?}"),
        }
    }

    match config.storage_backend.as_str() {
        "overlay" => {
            let layers = config.overlay.as_ref().ok_or_else(|| {
                anyhow::anyhow!("storage backend 'overlay' requires an overlay section")
            })?;
            let primary = base(config, &layers.primary).await?;
            let secondary = base(config, &layers.secondary).await?;
            info!(
                "Overlay storage backend initialized: {} over {}",
                layers.primary, layers.secondary
            );
            Ok(Arc::new(overlay::OverlayBackend::new(primary, secondary)))
        }
        kind => base(config, kind).await,
    }
}
