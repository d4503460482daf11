//! Version resource handlers: GET/HEAD a specific version, DELETE a
//! version, and the `;versions` listing.
//!
//! Serving honors the version's aux record in priority order: a
//! `rename_to` pair transparently serves the referenced version (with
//! authorization against the target and a `Content-Location` pointing at
//! it), a `url` issues an HTTP redirect, and `hname` / `hversion` /
//! `version` override the addressing handed to the storage backend.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::authz::{self, ResourceAction};
use crate::conditional::{self, quote_etag, RangeSpec};
use crate::directory::records::{Binding, ObjectRecord, ResolvedName, VersionRecord};
use crate::errors::HatracError;
use crate::storage::backend::StorageBackend;
use crate::AppState;

use super::{client_context, listing_response, name_from_stored, resource_url, strip_body};

/// Bound on transparent `rename_to` hops; a longer chain is treated as a
/// broken graph.
const RENAME_HOP_LIMIT: usize = 8;

/// `GET`/`HEAD` on `name:version`.
pub async fn get(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    version_key: &str,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response, HatracError> {
    let record = state
        .directory
        .get_version(object.id, version_key)?
        .filter(|v| v.deleted_at.is_none())
        .ok_or_else(|| HatracError::NotFound(format!("no such version {version_key:?}")))?;

    let ctx = client_context(&state, headers);
    let mut chain = resolved.acl_chain();
    chain.push(&record.acls);
    if !authz::authorized(&state.config, &ctx.effective_roles(), ResourceAction::Read, &chain) {
        return Err(authz::denial(ctx.is_anonymous(), "read this version"));
    }

    conditional::evaluate_preconditions(headers, Some(record.etag_token()), true)?;

    serve(state, headers, record, head).await
}

/// `DELETE` on `name:version`. When the deleted version was current, the
/// most recent remaining live version takes over.
pub async fn delete(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    version_key: &str,
    headers: &HeaderMap,
) -> Result<Response, HatracError> {
    let record = state
        .directory
        .get_version(object.id, version_key)?
        .filter(|v| v.deleted_at.is_none())
        .ok_or_else(|| HatracError::NotFound(format!("no such version {version_key:?}")))?;

    let ctx = client_context(&state, headers);
    let mut chain = resolved.acl_chain();
    chain.push(&record.acls);
    if !authz::authorized(&state.config, &ctx.effective_roles(), ResourceAction::Delete, &chain) {
        return Err(authz::denial(ctx.is_anonymous(), "delete this version"));
    }

    conditional::evaluate_preconditions(headers, Some(record.etag_token()), false)?;

    state.directory.delete_version(record.id)?;

    // A renamed version never owned its storage; the rename target does.
    if record.aux.rename_to.is_none() {
        let (name, version, backend_version) = backend_address(&record);
        if let Err(e) = state
            .storage
            .delete(&name, &version, backend_version.as_deref())
            .await
        {
            tracing::warn!("backend delete for {name}:{version} failed: {e}");
        }
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET`/`HEAD` on `name;versions` — list live versions.
pub async fn list(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response, HatracError> {
    let ctx = client_context(&state, headers);
    let chain = resolved.acl_chain();
    if !authz::authorized(&state.config, &ctx.effective_roles(), ResourceAction::Read, &chain) {
        return Err(authz::denial(ctx.is_anonymous(), "list versions"));
    }

    let etag = object.etag_token();
    conditional::evaluate_preconditions(headers, Some(etag.as_str()), true)?;

    let path = name_from_stored(&object.name);
    let entries: Vec<String> = state
        .directory
        .enumerate_versions(object.id)?
        .iter()
        .map(|v| resource_url(&state, &path, Some(&v.version_key)))
        .collect();

    let response = listing_response(headers, entries, Some(etag.as_str()));
    Ok(if head { strip_body(response) } else { response })
}

/// Backend addressing for a version, with aux overrides applied.
fn backend_address(record: &VersionRecord) -> (String, String, Option<String>) {
    let name = record
        .aux
        .hname
        .clone()
        .unwrap_or_else(|| record.object_name.clone());
    let version = record
        .aux
        .hversion
        .clone()
        .unwrap_or_else(|| record.version_key.clone());
    (name, version, record.aux.version.clone())
}

/// Serve a version's content, honoring its aux record.
///
/// The caller has already evaluated preconditions and authorized the
/// addressed version; rename targets are authorized here as they are
/// resolved. The response keeps the addressed version's identity — its
/// ETag and its own metadata row — while rename indirection only
/// redirects where the bytes come from.
pub async fn serve(
    state: Arc<AppState>,
    headers: &HeaderMap,
    record: VersionRecord,
    head: bool,
) -> Result<Response, HatracError> {
    let ctx = client_context(&state, headers);
    let roles = ctx.effective_roles();

    // Follow rename_to indirection with a bounded hop count. The graph
    // is expected to be a short DAG; anything longer is data corruption.
    let requested_etag = quote_etag(record.etag_token());
    let requested_metadata = record.metadata.clone();
    let mut serving = record;
    let mut content_location: Option<String> = None;
    let mut hops = 0;
    while let Some((target_name, target_version)) = serving.aux.rename_to.clone() {
        hops += 1;
        if hops > RENAME_HOP_LIMIT {
            return Err(HatracError::Internal(anyhow::anyhow!(
                "rename chain exceeds {RENAME_HOP_LIMIT} hops at {}",
                serving.object_name
            )));
        }

        let target_path = name_from_stored(&target_name);
        let target_resolved = state.directory.resolve(&target_path)?;
        let target_object = match &target_resolved.binding {
            Binding::Object(obj) => obj.clone(),
            _ => {
                return Err(HatracError::Conflict(format!(
                    "rename target {target_name} is not an object"
                )))
            }
        };
        let target_record = state
            .directory
            .get_version(target_object.id, &target_version)?
            .ok_or_else(|| {
                HatracError::Conflict(format!(
                    "rename target {target_name}:{target_version} does not exist"
                ))
            })?;
        if target_record.deleted_at.is_some() {
            // The target owned the bytes and is gone; only metadata of
            // the source remains readable.
            return Err(HatracError::Conflict(format!(
                "content of {target_name}:{target_version} has been deleted"
            )));
        }

        let mut chain = target_resolved.acl_chain();
        chain.push(&target_record.acls);
        if !authz::authorized(&state.config, &roles, ResourceAction::Read, &chain) {
            return Err(authz::denial(ctx.is_anonymous(), "read the renamed version"));
        }

        content_location = Some(resource_url(
            &state,
            &target_path,
            Some(&target_record.version_key),
        ));
        serving = target_record;
    }

    // Remote equivalent content: redirect rather than proxy.
    if let Some(ref url) = serving.aux.url {
        let mut response = StatusCode::TEMPORARY_REDIRECT.into_response();
        response.headers_mut().insert(
            "location",
            HeaderValue::from_str(url)
                .map_err(|_| HatracError::Internal(anyhow::anyhow!("malformed aux url")))?,
        );
        return Ok(response);
    }

    let size = serving.size.unwrap_or(0) as u64;
    let (name, version, backend_version) = backend_address(&serving);

    // Presigned direct fetch for large content, when the backend offers it.
    if !head {
        if let Some(url) = state
            .storage
            .presigned_get(&name, &version, backend_version.as_deref(), size)
            .await
            .map_err(HatracError::Internal)?
        {
            let mut response = StatusCode::TEMPORARY_REDIRECT.into_response();
            response.headers_mut().insert(
                "location",
                HeaderValue::from_str(&url)
                    .map_err(|_| HatracError::Internal(anyhow::anyhow!("malformed presigned url")))?,
            );
            return Ok(response);
        }
    }

    // Range handling: single range or nothing; multi-range is declined,
    // a malformed header serves the full representation.
    let mut range: Option<(u64, u64)> = None;
    if !head {
        if let Some(value) = headers.get("range").and_then(|v| v.to_str().ok()) {
            match conditional::parse_range(value) {
                RangeSpec::Single(byte_range) => {
                    range = Some(
                        conditional::resolve_range(&byte_range, size)
                            .ok_or(HatracError::RangeNotSatisfiable { total: size })?,
                    );
                }
                RangeSpec::Multi => {
                    return Err(HatracError::NotImplemented(
                        "multi-range requests are not supported".to_string(),
                    ))
                }
                RangeSpec::Malformed => {}
            }
        }
    }

    let (status, body, content_length) = if head {
        (StatusCode::OK, axum::body::Body::empty(), size)
    } else {
        let content = state
            .storage
            .get_stream(&name, &version, backend_version.as_deref(), range)
            .await
            .map_err(HatracError::Internal)?;
        let status = if range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        (status, axum::body::Body::from_stream(content.stream), content.len)
    };

    let mut response = (status, body).into_response();
    let hdrs = response.headers_mut();

    let content_type = requested_metadata
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    hdrs.insert(
        "content-type",
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    hdrs.insert(
        "content-length",
        HeaderValue::from_str(&content_length.to_string()).expect("numeric header"),
    );
    if let Ok(v) = HeaderValue::from_str(&requested_etag) {
        hdrs.insert("etag", v);
    }
    hdrs.insert("accept-ranges", HeaderValue::from_static("bytes"));

    if let Some((start, end)) = range {
        if let Ok(v) = HeaderValue::from_str(&format!("bytes {start}-{end}/{size}")) {
            hdrs.insert("content-range", v);
        }
    }
    if let Some(ref location) = content_location {
        if let Ok(v) = HeaderValue::from_str(location) {
            hdrs.insert("content-location", v);
        }
    }
    if let Some(ref md5) = requested_metadata.content_md5 {
        if let Ok(v) = HeaderValue::from_str(md5) {
            hdrs.insert("content-md5", v);
        }
    }
    if let Some(ref sha256) = requested_metadata.content_sha256 {
        if let Ok(v) = HeaderValue::from_str(sha256) {
            hdrs.insert("content-sha256", v);
        }
    }
    if let Some(ref disposition) = requested_metadata.content_disposition {
        if let Ok(v) = HeaderValue::from_str(disposition) {
            hdrs.insert("content-disposition", v);
        }
    }

    Ok(response)
}
