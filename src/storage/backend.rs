//! Abstract storage backend trait.
//!
//! Every bulk-byte backend implements [`StorageBackend`]. The trait
//! works in terms of opaque byte streams with declared sizes so large
//! payloads are never materialized in memory; the directory remains
//! authoritative for structure while backends only hold bytes.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;
use md5::Digest as Md5Digest;

use crate::directory::records::VersionMetadata;

/// A boxed byte stream with I/O errors.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// A readable slice of stored content.
pub struct ContentStream {
    /// The bytes to serve (already narrowed to any requested range).
    pub stream: ByteStream,
    /// Number of bytes the stream will yield.
    pub len: u64,
}

/// Digests computed while persisting a stream, base64-encoded as they
/// appear in `Content-MD5` / `Content-SHA256` headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigests {
    pub md5: String,
    pub sha256: String,
}

/// Result of persisting new content.
#[derive(Debug, Clone)]
pub struct StoredVersion {
    /// Opaque URL-safe version id minted for this content.
    pub version_key: String,
    /// Digests of the persisted bytes, when the backend observed the
    /// full stream (multipart assembly on S3 does not).
    pub digests: Option<ContentDigests>,
    /// Backend-level version id (S3 versioned buckets) destined for the
    /// aux record.
    pub backend_version: Option<String>,
}

/// Incremental MD5 + SHA-256 over a stream of chunks.
pub struct DigestSink {
    md5: md5::Md5,
    sha256: sha2::Sha256,
}

impl DigestSink {
    pub fn new() -> Self {
        Self {
            md5: md5::Md5::new(),
            sha256: sha2::Sha256::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        sha2::Digest::update(&mut self.sha256, chunk);
    }

    pub fn finish(self) -> ContentDigests {
        use base64::Engine;
        let engine = base64::engine::general_purpose::STANDARD;
        ContentDigests {
            md5: engine.encode(self.md5.finalize()),
            sha256: engine.encode(sha2::Digest::finalize(self.sha256)),
        }
    }
}

impl Default for DigestSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Mint an opaque URL-safe version id: 12 random bytes, base64url.
pub fn generate_version_key() -> String {
    use base64::Engine;
    let bytes: [u8; 12] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Async bulk-storage contract.
///
/// `name` is the decoded hierarchical object path; `version` is the
/// version key. Aux-record `hname` / `hversion` overrides are applied by
/// the caller before these methods are reached, and `backend_version`
/// carries the aux `version` field for versioned buckets.
pub trait StorageBackend: Send + Sync + 'static {
    /// Persist `stream` (`size` bytes) as new content for `name`,
    /// returning the minted version key, observed digests, and any
    /// backend-level version id.
    fn create_from_stream(
        &self,
        name: &str,
        stream: ByteStream,
        size: u64,
        metadata: &VersionMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredVersion>> + Send + '_>>;

    /// Read stored content, optionally narrowed to an inclusive byte
    /// range resolved by the caller.
    fn get_stream(
        &self,
        name: &str,
        version: &str,
        backend_version: Option<&str>,
        range: Option<(u64, u64)>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ContentStream>> + Send + '_>>;

    /// Delete stored content. Idempotent.
    fn delete(
        &self,
        name: &str,
        version: &str,
        backend_version: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Reserve backend state for a chunked upload of `size` bytes in
    /// `chunk_length`-sized chunks. Returns an opaque handle.
    fn create_upload(
        &self,
        name: &str,
        size: u64,
        chunk_length: u64,
        metadata: &VersionMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Write one chunk at `position`. Retransmission of a position
    /// replaces the earlier bytes. Returns the chunk's aux value
    /// (backend bookkeeping needed at finalize).
    fn upload_chunk(
        &self,
        name: &str,
        handle: &str,
        position: u64,
        chunk_length: u64,
        size: u64,
        stream: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send + '_>>;

    /// Assemble the recorded chunks into final content of `size` bytes.
    fn finalize_upload(
        &self,
        name: &str,
        handle: &str,
        chunks: &BTreeMap<u64, serde_json::Value>,
        size: u64,
        metadata: &VersionMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredVersion>> + Send + '_>>;

    /// Release backend state held by an unfinished upload. Idempotent.
    fn cancel_upload(
        &self,
        name: &str,
        handle: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// The backend-internal key content for `(name, version)` is stored
    /// under, for diagnostics and migration.
    fn address(&self, name: &str, version: &str) -> String;

    /// A time-limited URL a client can fetch the bytes from directly,
    /// when the backend supports it and `size` crosses its redirect
    /// threshold. `None` keeps the proxy path.
    fn presigned_get(
        &self,
        _name: &str,
        _version: &str,
        _backend_version: Option<&str>,
        _size: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        Box::pin(async { Ok(None) })
    }
}

/// Collect a byte stream into memory. Test and small-payload helper.
pub async fn collect_stream(mut stream: ByteStream) -> std::io::Result<Vec<u8>> {
    use futures_util::StreamExt;
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Wrap an in-memory buffer as a [`ByteStream`].
pub fn stream_from_bytes(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures_util::stream::once(async move { Ok(data) }))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_sink_matches_known_values() {
        // The canonical 14-byte round-trip body.
        let mut sink = DigestSink::new();
        sink.update(b"hello, ");
        sink.update(b"world!\n");
        let digests = sink.finish();
        assert_eq!(digests.md5, "ZXS/CYPMeEBJpBYNGYhyjA==");
        assert_eq!(digests.sha256, "5+aEMqzlEZxe9xPaDUZ0GyBvTUaZf4s0yMpPgV/0yt0=");
    }

    #[test]
    fn version_keys_are_urlsafe_and_distinct() {
        let a = generate_version_key();
        let b = generate_version_key();
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let stream = stream_from_bytes(&b"some bytes"[..]);
        let collected = collect_stream(stream).await.unwrap();
        assert_eq!(collected, b"some bytes");
    }
}
