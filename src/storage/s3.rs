//! Amazon S3 storage backend.
//!
//! Names route to buckets by longest configured prefix. Object keys are
//! produced by the per-bucket naming scheme (`hname` or `hname:hver`)
//! under an optional key prefix. Chunked uploads map onto S3 multipart
//! uploads with part ETags carried as chunk aux values; versioned
//! buckets record the S3 version id of each write so later reads address
//! the exact historical object. Reads above a configured size threshold
//! can redirect through presigned URLs instead of proxying.
//!
//! Incoming streams are spooled to a temp file and handed to the SDK via
//! `ByteStream::from_path`, which keeps memory bounded and lets digests
//! be computed on the way through.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use aws_sdk_s3::Client;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::backend::{
    generate_version_key, ByteStream, ContentDigests, ContentStream, DigestSink, StorageBackend,
    StoredVersion,
};
use crate::config::{S3BucketConfig, S3Config, S3SessionConfig};
use crate::directory::records::VersionMetadata;
use crate::name::{SegmentClass, DEFAULT_CHAR_CLASS};

/// One routed bucket: a name prefix, its configuration, and a client.
struct S3Route {
    /// Decoded name prefix this bucket serves (`/` catches everything).
    prefix: String,
    config: S3BucketConfig,
    client: Client,
}

/// Bucket-routed S3 backend.
pub struct S3Backend {
    /// Routes sorted by descending prefix length (longest match wins).
    routes: Vec<S3Route>,
    /// Segment class used to re-encode keys when quoting is kept.
    class: SegmentClass,
}

impl S3Backend {
    /// Build clients for every configured bucket route.
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let mut routes = Vec::new();
        for (prefix, bucket) in &config.buckets {
            let session = bucket
                .session_config
                .clone()
                .or_else(|| config.default_session.clone())
                .unwrap_or_default();
            let client = build_client(&session).await;
            info!(
                "S3 route {} -> bucket {} (prefix '{}', method {})",
                prefix, bucket.bucket_name, bucket.bucket_path_prefix, bucket.hatrac_s3_method
            );
            routes.push(S3Route {
                prefix: prefix.clone(),
                config: bucket.clone(),
                client,
            });
        }
        if routes.is_empty() {
            anyhow::bail!("s3_config.buckets must define at least one route");
        }
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        let class = SegmentClass::parse(DEFAULT_CHAR_CLASS)
            .map_err(|_| anyhow::anyhow!("default URL character class must parse"))?;

        Ok(Self { routes, class })
    }

    /// Longest-prefix route for a name.
    fn route(&self, name: &str) -> anyhow::Result<&S3Route> {
        self.routes
            .iter()
            .find(|r| {
                r.prefix == "/"
                    || name == r.prefix
                    || name.starts_with(&format!("{}/", r.prefix.trim_end_matches('/')))
            })
            .ok_or_else(|| anyhow::anyhow!("no S3 bucket route matches {name}"))
    }

    /// Object key for `(name, version)` under a route's naming scheme.
    fn object_key(&self, route: &S3Route, name: &str, version: &str) -> String {
        let relative = name.trim_start_matches('/');
        let relative = if route.config.unquote_object_keys {
            relative.to_string()
        } else {
            relative
                .split('/')
                .map(|seg| self.class.encode(seg))
                .collect::<Vec<_>>()
                .join("/")
        };

        let prefix = route.config.bucket_path_prefix.trim_matches('/');
        let base = if prefix.is_empty() {
            relative
        } else {
            format!("{prefix}/{relative}")
        };

        match route.config.hatrac_s3_method.as_str() {
            "hname" => base,
            // Default scheme keys each version independently.
            _ => format!("{base}:{version}"),
        }
    }

    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("S3 {context}: {err}")
    }

    /// Spool a stream to a temp file, computing digests on the way.
    async fn spool_to_temp(
        stream: ByteStream,
        declared: u64,
    ) -> anyhow::Result<(tempfile::NamedTempFile, ContentDigests)> {
        let temp = tempfile::NamedTempFile::new()?;
        let mut file = tokio::fs::File::create(temp.path()).await?;
        let mut sink = DigestSink::new();
        let mut written: u64 = 0;
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
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
        file.sync_all().await?;
        drop(file);
        Ok((temp, sink.finish()))
    }
}

/// Build an SDK client from session settings, falling back to the
/// standard credential/region chain.
async fn build_client(session: &S3SessionConfig) -> Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(ref region) = session.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    if let Some(ref endpoint) = session.endpoint_url {
        loader = loader.endpoint_url(endpoint.clone());
    }
    let sdk_config = loader.load().await;
    let builder =
        aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(session.use_path_style);
    Client::from_conf(builder.build())
}

/// Chunked-upload handles carry the minted version key alongside the S3
/// multipart upload id, since the final key must be fixed at initiation.
fn encode_handle(version_key: &str, upload_id: &str) -> String {
    format!("{version_key}:{upload_id}")
}

fn decode_handle(handle: &str) -> anyhow::Result<(&str, &str)> {
    handle
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("malformed S3 upload handle"))
}

impl StorageBackend for S3Backend {
    fn create_from_stream(
        &self,
        name: &str,
        stream: ByteStream,
        size: u64,
        metadata: &VersionMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredVersion>> + Send + '_>> {
        let name = name.to_string();
        let content_type = metadata.content_type.clone();
        Box::pin(async move {
            let route = self.route(&name)?;
            let version_key = generate_version_key();
            let key = self.object_key(route, &name, &version_key);

            let (temp, digests) = Self::spool_to_temp(stream, size).await?;
            let body = aws_sdk_s3::primitives::ByteStream::from_path(temp.path())
                .await
                .map_err(|e| Self::map_sdk_error("stage body", e))?;

            debug!(
                "S3 put_object: bucket={} key={}",
                route.config.bucket_name, key
            );
            let resp = route
                .client
                .put_object()
                .bucket(&route.config.bucket_name)
                .key(&key)
                .set_content_type(content_type)
                .body(body)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e))?;

            let backend_version = if route.config.versioned {
                resp.version_id().map(|v| v.to_string())
            } else {
                None
            };

            Ok(StoredVersion {
                version_key,
                digests: Some(digests),
                backend_version,
            })
        })
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
            let route = self.route(&name)?;
            let key = self.object_key(route, &name, &version);

            debug!(
                "S3 get_object: bucket={} key={} range={:?}",
                route.config.bucket_name, key, range
            );
            let resp = route
                .client
                .get_object()
                .bucket(&route.config.bucket_name)
                .key(&key)
                .set_version_id(backend_version)
                .set_range(range.map(|(start, end)| format!("bytes={start}-{end}")))
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_key() {
                        anyhow::anyhow!("content missing at {key}")
                    } else {
                        Self::map_sdk_error("get_object", service_err)
                    }
                })?;

            let len = match range {
                Some((start, end)) => end - start + 1,
                None => resp
                    .content_length()
                    .map(|l| l as u64)
                    .ok_or_else(|| anyhow::anyhow!("S3 response missing content length"))?,
            };

            let reader = resp.body.into_async_read();
            let stream: ByteStream = Box::pin(ReaderStream::new(reader));
            Ok(ContentStream { stream, len })
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
            let route = self.route(&name)?;
            let key = self.object_key(route, &name, &version);

            debug!(
                "S3 delete_object: bucket={} key={}",
                route.config.bucket_name, key
            );
            route
                .client
                .delete_object()
                .bucket(&route.config.bucket_name)
                .key(&key)
                .set_version_id(backend_version)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e))?;
            Ok(())
        })
    }

    fn create_upload(
        &self,
        name: &str,
        _size: u64,
        _chunk_length: u64,
        metadata: &VersionMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let name = name.to_string();
        let content_type = metadata.content_type.clone();
        Box::pin(async move {
            let route = self.route(&name)?;
            let version_key = generate_version_key();
            let key = self.object_key(route, &name, &version_key);

            let resp = route
                .client
                .create_multipart_upload()
                .bucket(&route.config.bucket_name)
                .key(&key)
                .set_content_type(content_type)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("create_multipart_upload", e))?;

            let upload_id = resp
                .upload_id()
                .ok_or_else(|| anyhow::anyhow!("S3 did not return an upload id"))?;
            Ok(encode_handle(&version_key, upload_id))
        })
    }

    fn upload_chunk(
        &self,
        name: &str,
        handle: &str,
        position: u64,
        _chunk_length: u64,
        size: u64,
        stream: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send + '_>> {
        let name = name.to_string();
        let handle = handle.to_string();
        Box::pin(async move {
            let route = self.route(&name)?;
            let (version_key, upload_id) = decode_handle(&handle)?;
            let key = self.object_key(route, &name, version_key);

            let (temp, digests) = Self::spool_to_temp(stream, size).await?;
            let body = aws_sdk_s3::primitives::ByteStream::from_path(temp.path())
                .await
                .map_err(|e| Self::map_sdk_error("stage chunk", e))?;

            // S3 part numbers are 1-based.
            let part_number = (position + 1) as i32;
            debug!(
                "S3 upload_part: bucket={} key={} part={}",
                route.config.bucket_name, key, part_number
            );
            let resp = route
                .client
                .upload_part()
                .bucket(&route.config.bucket_name)
                .key(&key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("upload_part", e))?;

            let etag = resp
                .e_tag()
                .ok_or_else(|| anyhow::anyhow!("S3 did not return a part ETag"))?;
            Ok(serde_json::json!({ "etag": etag, "md5": digests.md5 }))
        })
    }

    fn finalize_upload(
        &self,
        name: &str,
        handle: &str,
        chunks: &BTreeMap<u64, serde_json::Value>,
        _size: u64,
        _metadata: &VersionMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredVersion>> + Send + '_>> {
        use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};

        let name = name.to_string();
        let handle = handle.to_string();
        let chunks = chunks.clone();
        Box::pin(async move {
            let route = self.route(&name)?;
            let (version_key, upload_id) = decode_handle(&handle)?;
            let key = self.object_key(route, &name, version_key);

            let mut parts = Vec::with_capacity(chunks.len());
            for (position, aux) in &chunks {
                let etag = aux
                    .get("etag")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("chunk {position} is missing its part ETag"))?;
                parts.push(
                    CompletedPart::builder()
                        .e_tag(etag)
                        .part_number((*position + 1) as i32)
                        .build(),
                );
            }

            let completed = CompletedMultipartUpload::builder()
                .set_parts(Some(parts))
                .build();

            debug!(
                "S3 complete_multipart_upload: bucket={} key={} parts={}",
                route.config.bucket_name,
                key,
                chunks.len()
            );
            let resp = route
                .client
                .complete_multipart_upload()
                .bucket(&route.config.bucket_name)
                .key(&key)
                .upload_id(upload_id)
                .multipart_upload(completed)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("complete_multipart_upload", e))?;

            let backend_version = if route.config.versioned {
                resp.version_id().map(|v| v.to_string())
            } else {
                None
            };

            // Multipart ETags are not raw digests; assembled content is
            // not re-hashed here.
            Ok(StoredVersion {
                version_key: version_key.to_string(),
                digests: None,
                backend_version,
            })
        })
    }

    fn cancel_upload(
        &self,
        name: &str,
        handle: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let name = name.to_string();
        let handle = handle.to_string();
        Box::pin(async move {
            let route = self.route(&name)?;
            let (version_key, upload_id) = decode_handle(&handle)?;
            let key = self.object_key(route, &name, version_key);

            if let Err(e) = route
                .client
                .abort_multipart_upload()
                .bucket(&route.config.bucket_name)
                .key(&key)
                .upload_id(upload_id)
                .send()
                .await
            {
                // An already-aborted upload is not an error for callers.
                warn!("S3 abort_multipart_upload for {key}: {e}");
            }
            Ok(())
        })
    }

    fn address(&self, name: &str, version: &str) -> String {
        match self.route(name) {
            Ok(route) => format!(
                "{}/{}",
                route.config.bucket_name,
                self.object_key(route, name, version)
            ),
            Err(_) => format!("<unrouted>{name}:{version}"),
        }
    }

    fn presigned_get(
        &self,
        name: &str,
        version: &str,
        backend_version: Option<&str>,
        size: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        use aws_sdk_s3::presigning::PresigningConfig;

        let name = name.to_string();
        let version = version.to_string();
        let backend_version = backend_version.map(|s| s.to_string());
        Box::pin(async move {
            let route = self.route(&name)?;
            match route.config.presigned_url_threshold {
                Some(threshold) if size >= threshold => {}
                _ => return Ok(None),
            }

            let key = self.object_key(route, &name, &version);
            let expires = Duration::from_secs(route.config.presigned_url_expiration_secs);
            let presigning = PresigningConfig::expires_in(expires)
                .map_err(|e| Self::map_sdk_error("presigning config", e))?;

            let presigned = route
                .client
                .get_object()
                .bucket(&route.config.bucket_name)
                .key(&key)
                .set_version_id(backend_version)
                .presigned(presigning)
                .await
                .map_err(|e| Self::map_sdk_error("presign get_object", e))?;

            Ok(Some(presigned.uri().to_string()))
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(prefix: &str, method: &str, unquote: bool) -> S3BucketConfig {
        serde_json::from_str(&format!(
            r#"{{
                "bucket_name": "test-bucket",
                "bucket_path_prefix": "{prefix}",
                "hatrac_s3_method": "{method}",
                "unquote_object_keys": {unquote}
            }}"#
        ))
        .unwrap()
    }

    fn route(prefix: &str, config: S3BucketConfig) -> S3Route {
        // Client construction requires async config loading; routing and
        // key mapping are pure and tested against a placeholder client.
        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .build();
        S3Route {
            prefix: prefix.to_string(),
            config,
            client: Client::from_conf(sdk_config),
        }
    }

    fn backend(routes: Vec<S3Route>) -> S3Backend {
        let mut routes = routes;
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        S3Backend {
            routes,
            class: SegmentClass::parse(DEFAULT_CHAR_CLASS).unwrap(),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let b = backend(vec![
            route("/", bucket("", "hname:hver", false)),
            route("/ns-X", bucket("special", "hname:hver", false)),
        ]);
        let r = b.route("/ns-X/obj").unwrap();
        assert_eq!(r.config.bucket_path_prefix, "special");
        let r = b.route("/other/obj").unwrap();
        assert_eq!(r.config.bucket_path_prefix, "");
    }

    #[test]
    fn prefix_matches_whole_segments_only() {
        let b = backend(vec![
            route("/", bucket("root", "hname:hver", false)),
            route("/ns", bucket("ns", "hname:hver", false)),
        ]);
        // `/ns-other` must not match the `/ns` route.
        let r = b.route("/ns-other/obj").unwrap();
        assert_eq!(r.config.bucket_path_prefix, "root");
        let r = b.route("/ns/obj").unwrap();
        assert_eq!(r.config.bucket_path_prefix, "ns");
    }

    #[test]
    fn key_includes_version_suffix_by_default() {
        let b = backend(vec![route("/", bucket("pref", "hname:hver", false))]);
        let r = b.route("/ns/obj").unwrap();
        assert_eq!(b.object_key(r, "/ns/obj", "v1"), "pref/ns/obj:v1");
    }

    #[test]
    fn hname_method_omits_version() {
        let b = backend(vec![route("/", bucket("", "hname", false))]);
        let r = b.route("/ns/obj").unwrap();
        assert_eq!(b.object_key(r, "/ns/obj", "v1"), "ns/obj");
    }

    #[test]
    fn quoting_follows_unquote_flag() {
        let b = backend(vec![route("/", bucket("", "hname", false))]);
        let r = b.route("/ns/caf é").unwrap();
        // Quoted by default.
        assert_eq!(b.object_key(r, "/ns/caf é", "v1"), "ns/caf%20%C3%A9");

        let b = backend(vec![route("/", bucket("", "hname", true))]);
        let r = b.route("/ns/caf é").unwrap();
        assert_eq!(b.object_key(r, "/ns/caf é", "v1"), "ns/caf é");
    }

    #[test]
    fn handle_round_trip() {
        let handle = encode_handle("vKEY", "upload:id:with:colons");
        let (v, u) = decode_handle(&handle).unwrap();
        assert_eq!(v, "vKEY");
        assert_eq!(u, "upload:id:with:colons");
        assert!(decode_handle("no-separator").is_err());
    }
}
