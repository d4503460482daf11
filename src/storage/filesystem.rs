//! Filesystem storage backend.
//!
//! Content lives under a hash-prefixed two-level tree: the SHA-256 of
//! the object name picks `<root>/<h0h1>/<h2h3>/<hash>/`, and each
//! version is one file named by its version key. Writes land in a temp
//! file and publish by atomic rename.
//!
//! Chunked uploads pre-allocate a sparse file of the declared size under
//! `<root>/.uploads/<handle>`; chunk writes seek to `position ×
//! chunk-length`; finalize re-reads the assembled file to compute its
//! digests, then renames it into place.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::backend::{
    generate_version_key, ByteStream, ContentStream, DigestSink, StorageBackend, StoredVersion,
};
use crate::directory::records::VersionMetadata;

/// Stores version content on the local filesystem.
pub struct FilesystemBackend {
    /// Root directory for all stored content.
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new backend rooted at `root`.
    ///
    /// The root, temp, and upload staging directories are created if
    /// they do not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(".tmp"))?;
        std::fs::create_dir_all(root.join(".uploads"))?;
        Ok(Self { root })
    }

    /// Relative storage key for `(name, version)`.
    fn relative_key(name: &str, version: &str) -> String {
        let hash = hex::encode(Sha256::digest(name.as_bytes()));
        format!("{}/{}/{}/{}", &hash[0..2], &hash[2..4], hash, version)
    }

    /// Absolute path of a version file.
    fn version_path(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(Self::relative_key(name, version))
    }

    /// Fresh temp file path under `.tmp/`.
    fn temp_path(&self) -> PathBuf {
        self.root.join(".tmp").join(format!("tmp-{}", uuid::Uuid::new_v4()))
    }

    /// Staging file of a chunked upload.
    fn upload_path(&self, handle: &str) -> PathBuf {
        self.root.join(".uploads").join(handle)
    }

    /// Drain `stream` into `file`, tracking digests and enforcing the
    /// declared size.
    async fn spool(
        file: &mut tokio::fs::File,
        mut stream: ByteStream,
        declared: u64,
    ) -> anyhow::Result<DigestSink> {
        let mut sink = DigestSink::new();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = chunk?;
            written += chunk.len() as u64;
            if written > declared {
                anyhow::bail!("request body exceeds declared size {declared}");
            }
            sink.update(&chunk);
            file.write_all(&chunk).await?;
        }
        if written != declared {
            anyhow::bail!("request body ended at {written} of declared {declared} bytes");
        }
        Ok(sink)
    }
}

impl StorageBackend for FilesystemBackend {
    fn create_from_stream(
        &self,
        name: &str,
        stream: ByteStream,
        size: u64,
        _metadata: &VersionMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredVersion>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let version_key = generate_version_key();
            let final_path = self.version_path(&name, &version_key);
            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let tmp_path = self.temp_path();
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            let sink = match Self::spool(&mut file, stream, size).await {
                Ok(sink) => sink,
                Err(err) => {
                    // Aborted stream: drop the partial temp file.
                    drop(file);
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            };
            file.sync_all().await?;
            drop(file);

            tokio::fs::rename(&tmp_path, &final_path).await?;
            debug!("filesystem wrote {} ({} bytes)", final_path.display(), size);

            Ok(StoredVersion {
                version_key,
                digests: Some(sink.finish()),
                backend_version: None,
            })
        })
    }

    fn get_stream(
        &self,
        name: &str,
        version: &str,
        _backend_version: Option<&str>,
        range: Option<(u64, u64)>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ContentStream>> + Send + '_>> {
        let path = self.version_path(name, version);
        Box::pin(async move {
            let mut file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| anyhow::anyhow!("content missing at {}: {e}", path.display()))?;
            let total = file.metadata().await?.len();

            let len = match range {
                Some((start, end)) => {
                    file.seek(SeekFrom::Start(start)).await?;
                    end - start + 1
                }
                None => total,
            };

            let reader = file.take(len);
            let stream: ByteStream = Box::pin(ReaderStream::new(reader));
            Ok(ContentStream { stream, len })
        })
    }

    fn delete(
        &self,
        name: &str,
        version: &str,
        _backend_version: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let path = self.version_path(name, version);
        Box::pin(async move {
            // Idempotent: a missing file is fine.
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn create_upload(
        &self,
        _name: &str,
        size: u64,
        _chunk_length: u64,
        _metadata: &VersionMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        Box::pin(async move {
            let handle = uuid::Uuid::new_v4().to_string();
            let path = self.upload_path(&handle);
            let file = tokio::fs::File::create(&path).await?;
            // Sparse pre-allocation at the declared size; chunk writes
            // fill it in at their offsets.
            file.set_len(size).await?;
            file.sync_all().await?;
            Ok(handle)
        })
    }

    fn upload_chunk(
        &self,
        _name: &str,
        handle: &str,
        position: u64,
        chunk_length: u64,
        size: u64,
        stream: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send + '_>> {
        let path = self.upload_path(handle);
        Box::pin(async move {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| anyhow::anyhow!("upload staging missing: {e}"))?;
            file.seek(SeekFrom::Start(position * chunk_length)).await?;
            let sink = Self::spool(&mut file, stream, size).await?;
            file.sync_all().await?;

            let digests = sink.finish();
            Ok(serde_json::json!({ "md5": digests.md5 }))
        })
    }

    fn finalize_upload(
        &self,
        name: &str,
        handle: &str,
        _chunks: &BTreeMap<u64, serde_json::Value>,
        size: u64,
        _metadata: &VersionMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredVersion>> + Send + '_>> {
        let name = name.to_string();
        let staging = self.upload_path(handle);
        Box::pin(async move {
            let actual = tokio::fs::metadata(&staging)
                .await
                .map_err(|e| anyhow::anyhow!("upload staging missing: {e}"))?
                .len();
            if actual != size {
                anyhow::bail!("assembled upload is {actual} bytes, expected {size}");
            }

            // Re-read the assembled file to compute end-to-end digests.
            let mut file = tokio::fs::File::open(&staging).await?;
            let mut sink = DigestSink::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                sink.update(&buf[..n]);
            }
            drop(file);

            let version_key = generate_version_key();
            let final_path = self.version_path(&name, &version_key);
            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&staging, &final_path).await?;
            debug!(
                "filesystem assembled {} ({} bytes)",
                final_path.display(),
                size
            );

            Ok(StoredVersion {
                version_key,
                digests: Some(sink.finish()),
                backend_version: None,
            })
        })
    }

    fn cancel_upload(
        &self,
        _name: &str,
        handle: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let path = self.upload_path(handle);
        Box::pin(async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn address(&self, name: &str, version: &str) -> String {
        Self::relative_key(name, version)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
