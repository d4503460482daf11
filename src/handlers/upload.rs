//! `;upload` sub-resource handlers: the chunked-upload job lifecycle.
//!
//! A job is created by POST with declared chunk and content lengths,
//! fed by PUT of numbered chunks, and closed by POST (finalize, minting
//! a new version) or DELETE (cancel). Deleting the target object
//! implicitly cancels its open jobs.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::authz::{self, ResourceAction};
use crate::directory::records::{
    AuxRecord, Binding, NameKind, ObjectRecord, ResolvedName, UploadRecord,
};
use crate::errors::HatracError;
use crate::name::NamePath;
use crate::storage::backend::StorageBackend;
use crate::AppState;

use super::{
    body_stream, client_context, listing_response, name_from_stored, parse_digest,
    require_content_length, resource_url, strip_body, validate_content_disposition,
};

/// Upload-job creation request. Canonical field names use dashes; the
/// underscore forms are legacy aliases kept for compatibility.
#[derive(Debug, Deserialize)]
struct CreateUploadRequest {
    #[serde(rename = "chunk-length", alias = "chunk_bytes")]
    chunk_length: i64,

    #[serde(rename = "content-length", alias = "total_bytes")]
    content_length: i64,

    #[serde(rename = "content-type", alias = "content_type", default)]
    content_type: Option<String>,

    #[serde(rename = "content-md5", alias = "content_md5", default)]
    content_md5: Option<String>,

    #[serde(rename = "content-sha256", alias = "content_sha256", default)]
    content_sha256: Option<String>,

    #[serde(rename = "content-disposition", alias = "content_disposition", default)]
    content_disposition: Option<String>,
}

/// Service-relative URL of an upload job.
fn job_url(state: &AppState, object_name: &str, job_key: &str) -> String {
    format!(
        "{};upload/{}",
        resource_url(state, &name_from_stored(object_name), None),
        state.class.encode(job_key)
    )
}

/// Whether the caller may operate on a job: job ownership or object
/// chain ownership.
fn job_authorized(
    state: &AppState,
    headers: &HeaderMap,
    resolved: &ResolvedName,
    job: &UploadRecord,
) -> Result<(), HatracError> {
    let ctx = client_context(state, headers);
    let roles = ctx.effective_roles();
    if job.owner_roles.iter().any(|role| roles.contains(role)) {
        return Ok(());
    }
    if authz::owns(&roles, &resolved.acl_chain()) {
        return Ok(());
    }
    Err(authz::denial(ctx.is_anonymous(), "operate on this upload job"))
}

/// Fetch a job addressed under a specific object; a job key that exists
/// but targets a different object is not visible here.
fn lookup_job(
    state: &AppState,
    object: &ObjectRecord,
    job_key: &str,
) -> Result<UploadRecord, HatracError> {
    state
        .directory
        .get_upload(job_key)?
        .filter(|job| job.object_id == object.id)
        .ok_or_else(|| HatracError::NotFound(format!("no such upload job {job_key:?}")))
}

/// `POST` on `name;upload` — open a new chunked-upload job.
pub async fn create(
    state: Arc<AppState>,
    path: &NamePath,
    resolved: &ResolvedName,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, HatracError> {
    path.validate_for_creation()?;

    let request: CreateUploadRequest = serde_json::from_slice(body)
        .map_err(|e| HatracError::BadRequest(format!("malformed upload request: {e}")))?;

    if request.chunk_length <= 0 {
        return Err(HatracError::BadRequest(
            "chunk-length must be positive".to_string(),
        ));
    }
    if request.content_length < 0 {
        return Err(HatracError::BadRequest(
            "content-length must be non-negative".to_string(),
        ));
    }

    let mut metadata = crate::directory::records::VersionMetadata {
        content_type: request.content_type,
        content_md5: request.content_md5,
        content_sha256: request.content_sha256,
        content_disposition: request.content_disposition,
    };
    if let Some(md5) = metadata.content_md5.take() {
        metadata.content_md5 = Some(parse_digest(&md5, 16, "content-md5")?);
    }
    if let Some(sha256) = metadata.content_sha256.take() {
        metadata.content_sha256 = Some(parse_digest(&sha256, 32, "content-sha256")?);
    }
    if let Some(ref disposition) = metadata.content_disposition {
        validate_content_disposition(disposition)?;
    }

    let ctx = client_context(&state, headers);
    let roles = ctx.effective_roles();

    // The target may be an existing object or an unbound name; either
    // way the job defines the object binding before any version exists.
    let existing = match &resolved.binding {
        Binding::Object(obj) => Some(obj.clone()),
        Binding::Namespace(_) | Binding::Tombstone(NameKind::Namespace) => {
            return Err(HatracError::Conflict(format!(
                "{path} is bound as a namespace"
            )))
        }
        Binding::Tombstone(NameKind::Object) | Binding::Undefined => None,
    };

    match &existing {
        Some(obj) => {
            let mut chain = resolved.ancestor_chain();
            chain.push(&obj.acls);
            if !authz::authorized(&state.config, &roles, ResourceAction::Update, &chain) {
                return Err(authz::denial(ctx.is_anonymous(), "update this object"));
            }
        }
        None => {
            if resolved.ancestors.len() != path.depth() {
                return Err(HatracError::NotFound(format!(
                    "parent of {path} is not a namespace"
                )));
            }
            let chain = resolved.ancestor_chain();
            if !authz::authorized(&state.config, &roles, ResourceAction::CreateChild, &chain) {
                return Err(authz::denial(ctx.is_anonymous(), "create this object"));
            }
        }
    }

    let owner_roles = ctx.ownership_roles();
    let object = match existing {
        Some(obj) => obj,
        None => state.directory.create_object(path, &owner_roles)?.0,
    };

    let name = path.to_string_lossless();
    let handle = state
        .storage
        .create_upload(
            &name,
            request.content_length as u64,
            request.chunk_length as u64,
            &metadata,
        )
        .await
        .map_err(HatracError::Internal)?;

    let job_key = uuid::Uuid::new_v4().to_string();
    let job = state.directory.create_upload(
        object.id,
        &job_key,
        request.chunk_length,
        request.content_length,
        &metadata,
        &owner_roles,
        Some(&handle),
    )?;

    let url = job_url(&state, &job.object_name, &job.job_key);
    let mut response = (
        StatusCode::CREATED,
        [("content-type", "text/uri-list".to_string())],
        format!("{url}\r\n"),
    )
        .into_response();
    if let Ok(v) = HeaderValue::from_str(&url) {
        response.headers_mut().insert("location", v);
    }
    Ok(response)
}

/// `GET`/`HEAD` on `name;upload` — list open jobs. Owners of the object
/// chain see every job; other callers see only their own.
pub async fn list(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response, HatracError> {
    let ctx = client_context(&state, headers);
    let roles = ctx.effective_roles();
    let owner = authz::owns(&roles, &resolved.acl_chain());

    let jobs = state.directory.list_uploads(object.id)?;
    let entries: Vec<String> = jobs
        .iter()
        .filter(|job| owner || job.owner_roles.iter().any(|role| roles.contains(role)))
        .map(|job| job_url(&state, &job.object_name, &job.job_key))
        .collect();

    let response = listing_response(headers, entries, None);
    Ok(if head { strip_body(response) } else { response })
}

/// `GET`/`HEAD` on `name;upload/<job>` — job status.
pub async fn status(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    job_key: &str,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response, HatracError> {
    let job = lookup_job(&state, object, job_key)?;
    job_authorized(&state, headers, resolved, &job)?;

    let body = serde_json::json!({
        "url": job_url(&state, &job.object_name, &job.job_key),
        "target": resource_url(&state, &name_from_stored(&job.object_name), None),
        "owner": job.owner_roles,
        "chunk-length": job.chunk_length,
        "content-length": job.content_length,
        "chunks-received": job.chunk_aux.len(),
    });
    let response = (
        StatusCode::OK,
        [("content-type", "application/json".to_string())],
        body.to_string(),
    )
        .into_response();
    Ok(if head { strip_body(response) } else { response })
}

/// `PUT` on `name;upload/<job>/<position>` — store one chunk.
pub async fn put_chunk(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    job_key: &str,
    position: u64,
    headers: &HeaderMap,
    body: axum::body::Body,
) -> Result<Response, HatracError> {
    let job = lookup_job(&state, object, job_key)?;
    job_authorized(&state, headers, resolved, &job)?;

    // Positions beyond the declared layout are state conflicts, not
    // syntax errors (negative positions never parse).
    if position >= job.total_chunks() {
        return Err(HatracError::Conflict(format!(
            "chunk position {position} is outside the declared {} chunks",
            job.total_chunks()
        )));
    }

    let size = require_content_length(&state, headers)?;
    let expected = job.expected_chunk_size(position);
    if size != expected {
        return Err(HatracError::BadRequest(format!(
            "chunk {position} must be {expected} bytes, got {size}"
        )));
    }

    let handle = job
        .backend_handle
        .clone()
        .ok_or_else(|| HatracError::Internal(anyhow::anyhow!("upload job has no handle")))?;
    let aux = state
        .storage
        .upload_chunk(
            &job.object_name,
            &handle,
            position,
            job.chunk_length as u64,
            size,
            body_stream(body),
        )
        .await
        .map_err(HatracError::Internal)?;

    state.directory.record_chunk(job.id, position, &aux)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `POST` on `name;upload/<job>` — finalize: assemble chunks, verify
/// declared digests, and mint the new version.
pub async fn finalize(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    job_key: &str,
    headers: &HeaderMap,
) -> Result<Response, HatracError> {
    let job = lookup_job(&state, object, job_key)?;
    job_authorized(&state, headers, resolved, &job)?;

    // Every declared chunk must have been received.
    let total = job.total_chunks();
    for position in 0..total {
        if !job.chunk_aux.contains_key(&position) {
            return Err(HatracError::Conflict(format!(
                "chunk {position} has not been uploaded"
            )));
        }
    }

    let handle = job
        .backend_handle
        .clone()
        .ok_or_else(|| HatracError::Internal(anyhow::anyhow!("upload job has no handle")))?;
    let stored = state
        .storage
        .finalize_upload(
            &job.object_name,
            &handle,
            &job.chunk_aux,
            job.content_length as u64,
            &job.metadata,
        )
        .await
        .map_err(HatracError::Internal)?;

    // Declared digests are verified against assembled content where the
    // backend observed it; a mismatch at this stage is a conflict.
    let mut metadata = job.metadata.clone();
    if let Err(err) = super::object::verify_declared_digests(&mut metadata, &stored, true) {
        // The assembly landed but no version row will reference it.
        let _ = state
            .storage
            .delete(&job.object_name, &stored.version_key, None)
            .await;
        return Err(err);
    }

    let acls = super::object::next_version_acls(&state, object, &job.owner_roles)?;
    let aux = AuxRecord {
        version: stored.backend_version.clone(),
        ..Default::default()
    };

    let record = state.directory.finalize_upload(
        job_key,
        &stored.version_key,
        job.content_length,
        &metadata,
        &acls,
        &aux,
    )?;

    let path = name_from_stored(&object.name);
    super::object::created_response(&state, &path, &record.version_key)
}

/// `DELETE` on `name;upload/<job>` — cancel the job and release backend
/// state.
pub async fn cancel(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    job_key: &str,
    headers: &HeaderMap,
) -> Result<Response, HatracError> {
    let job = lookup_job(&state, object, job_key)?;
    job_authorized(&state, headers, resolved, &job)?;

    let cancelled = state.directory.cancel_upload(job_key)?;
    if let Some(job) = cancelled {
        if let Some(ref handle) = job.backend_handle {
            if let Err(e) = state.storage.cancel_upload(&job.object_name, handle).await {
                tracing::warn!("backend cancel for upload {} failed: {e}", job.job_key);
            }
        }
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Tests ───────────────────────────────────────────────────────────
