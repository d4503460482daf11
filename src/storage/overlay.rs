//! Overlay storage backend.
//!
//! Composes two backends for gradual migration: reads try the primary
//! and fall through to the secondary when the content is absent; all
//! writes and uploads go to the primary; deletes reach both so retired
//! content does not linger in the layer being migrated away from.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use super::backend::{ByteStream, ContentStream, StorageBackend, StoredVersion};
use crate::directory::records::VersionMetadata;

/// Read-through composition of a primary over a secondary backend.
pub struct OverlayBackend {
    primary: Arc<dyn StorageBackend>,
    secondary: Arc<dyn StorageBackend>,
}

impl OverlayBackend {
    pub fn new(primary: Arc<dyn StorageBackend>, secondary: Arc<dyn StorageBackend>) -> Self {
        Self { primary, secondary }
    }
}

impl StorageBackend for OverlayBackend {
    fn create_from_stream(
        &self,
        name: &str,
        stream: ByteStream,
        size: u64,
        metadata: &VersionMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredVersion>> + Send + '_>> {
        self.primary.create_from_stream(name, stream, size, metadata)
    }

    fn get_stream(
        &self,
        name: &str,
        version: &str,
        backend_version: Option<&str>,
        range: Option<(u64, u64)>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ContentStream>> + Send + '_>> {
        let name = name.to_string();
        let version = version.to_string();
        let backend_version = backend_version.map(|s| s.to_string());
        Box::pin(async move {
            match self
                .primary
                .get_stream(&name, &version, backend_version.as_deref(), range)
                .await
            {
                Ok(content) => Ok(content),
                Err(primary_err) => {
                    debug!(
                        "overlay read falling through for {name}:{version}: {primary_err}"
                    );
                    self.secondary
                        .get_stream(&name, &version, backend_version.as_deref(), range)
                        .await
                }
            }
        })
    }

    fn delete(
        &self,
        name: &str,
        version: &str,
        backend_version: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let name = name.to_string();
        let version = version.to_string();
        let backend_version = backend_version.map(|s| s.to_string());
        Box::pin(async move {
            self.primary
                .delete(&name, &version, backend_version.as_deref())
                .await?;
            // Secondary cleanup is best-effort; the layer may never have
            // held this content.
            if let Err(e) = self
                .secondary
                .delete(&name, &version, backend_version.as_deref())
                .await
            {
                debug!("overlay secondary delete for {name}:{version}: {e}");
            }
            Ok(())
        })
    }

    fn create_upload(
        &self,
        name: &str,
        size: u64,
        chunk_length: u64,
        metadata: &VersionMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        self.primary.create_upload(name, size, chunk_length, metadata)
    }

    fn upload_chunk(
        &self,
        name: &str,
        handle: &str,
        position: u64,
        chunk_length: u64,
        size: u64,
        stream: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send + '_>> {
        self.primary
            .upload_chunk(name, handle, position, chunk_length, size, stream)
    }

    fn finalize_upload(
        &self,
        name: &str,
        handle: &str,
        chunks: &BTreeMap<u64, serde_json::Value>,
        size: u64,
        metadata: &VersionMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredVersion>> + Send + '_>> {
        self.primary.finalize_upload(name, handle, chunks, size, metadata)
    }

    fn cancel_upload(
        &self,
        name: &str,
        handle: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.primary.cancel_upload(name, handle)
    }

    fn address(&self, name: &str, version: &str) -> String {
        self.primary.address(name, version)
    }

    fn presigned_get(
        &self,
        name: &str,
        version: &str,
        backend_version: Option<&str>,
        size: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        self.primary.presigned_get(name, version, backend_version, size)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
