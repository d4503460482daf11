//! Object resource handlers: streaming PUT, GET of the current version,
//! and DELETE of the object with all its versions.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::authz::{self, AclSet, ResourceAction};
use crate::conditional;
use crate::directory::records::{
    AuxRecord, Binding, NameKind, ObjectRecord, ResolvedName, VersionMetadata,
};
use crate::errors::HatracError;
use crate::name::NamePath;
use crate::storage::backend::{StorageBackend, StoredVersion};
use crate::AppState;

use super::{
    body_stream, client_context, parse_digest, require_content_length, resource_url,
    validate_content_disposition, version,
};

/// Pull declared content metadata out of PUT headers, validating digest
/// encodings and the disposition grammar.
pub fn metadata_from_headers(headers: &HeaderMap) -> Result<VersionMetadata, HatracError> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let content_md5 = headers
        .get("content-md5")
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_digest(v, 16, "Content-MD5"))
        .transpose()?;

    let content_sha256 = headers
        .get("content-sha256")
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_digest(v, 32, "Content-SHA256"))
        .transpose()?;

    let content_disposition = headers
        .get("content-disposition")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    if let Some(ref disposition) = content_disposition {
        validate_content_disposition(disposition)?;
    }

    Ok(VersionMetadata {
        content_type,
        content_md5,
        content_sha256,
        content_disposition,
    })
}

/// Check declared digests against what the backend observed. With
/// `conflict` the mismatch is a state conflict (upload finalize);
/// otherwise it is a malformed request (simple PUT).
pub fn verify_declared_digests(
    declared: &mut VersionMetadata,
    stored: &StoredVersion,
    conflict: bool,
) -> Result<(), HatracError> {
    let Some(ref digests) = stored.digests else {
        return Ok(());
    };
    let fail = |what: &str| {
        if conflict {
            HatracError::Conflict(format!("{what} does not match the received content"))
        } else {
            HatracError::BadRequest(format!("{what} does not match the received content"))
        }
    };
    match declared.content_md5 {
        Some(ref declared_md5) if declared_md5 != &digests.md5 => {
            return Err(fail("Content-MD5"))
        }
        _ => declared.content_md5 = Some(digests.md5.clone()),
    }
    match declared.content_sha256 {
        Some(ref declared_sha) if declared_sha != &digests.sha256 => {
            return Err(fail("Content-SHA256"))
        }
        _ => declared.content_sha256 = Some(digests.sha256.clone()),
    }
    Ok(())
}

/// ACLs for a fresh version: copied from the previous current version,
/// defaulting to creator ownership for a first version.
pub fn next_version_acls(
    state: &AppState,
    object: &ObjectRecord,
    creator_roles: &[String],
) -> Result<AclSet, HatracError> {
    if let Some(current_id) = object.current_version_id {
        if let Some(current) = state.directory.get_version_by_id(current_id)? {
            return Ok(current.acls);
        }
    }
    Ok(AclSet::initial_owner(creator_roles))
}

/// `PUT` content on an object path: create or update.
///
/// An existing object path always takes content, even when the request
/// carries the namespace content type.
pub async fn put(
    state: Arc<AppState>,
    path: &NamePath,
    resolved: &ResolvedName,
    headers: &HeaderMap,
    body: axum::body::Body,
) -> Result<Response, HatracError> {
    path.validate_for_creation()?;
    let size = require_content_length(&state, headers)?;
    let mut metadata = metadata_from_headers(headers)?;

    let ctx = client_context(&state, headers);
    let roles = ctx.effective_roles();

    let existing = match &resolved.binding {
        Binding::Object(obj) => Some(obj.clone()),
        Binding::Namespace(_) | Binding::Tombstone(NameKind::Namespace) => {
            return Err(HatracError::Conflict(format!(
                "{path} is bound as a namespace"
            )))
        }
        Binding::Tombstone(NameKind::Object) | Binding::Undefined => None,
    };

    let current_etag = match &existing {
        Some(obj) => match obj.current_version_id {
            Some(id) => state
                .directory
                .get_version_by_id(id)?
                .map(|v| v.version_key),
            None => None,
        },
        None => None,
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
            // Creation authorizes against the parent namespace chain.
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
    conditional::evaluate_preconditions(headers, current_etag.as_deref(), false)?;

    // Stream the payload into the backend before touching the directory;
    // a failed write leaves no metadata behind.
    let name = path.to_string_lossless();
    let stored = state
        .storage
        .create_from_stream(&name, body_stream(body), size, &metadata)
        .await
        .map_err(HatracError::Internal)?;
    if let Err(err) = verify_declared_digests(&mut metadata, &stored, false) {
        // The bytes landed but no version row will reference them.
        let _ = state.storage.delete(&name, &stored.version_key, None).await;
        return Err(err);
    }

    let owner_roles = ctx.ownership_roles();
    let object = match existing {
        Some(obj) => obj,
        None => state.directory.create_object(path, &owner_roles)?.0,
    };

    let acls = next_version_acls(&state, &object, &owner_roles)?;
    let aux = AuxRecord {
        version: stored.backend_version.clone(),
        ..Default::default()
    };
    let record = state.directory.create_version(
        object.id,
        &stored.version_key,
        size as i64,
        &metadata,
        &acls,
        &aux,
    )?;

    created_response(&state, path, &record.version_key)
}

/// `201 Created` carrying the new versioned URL.
pub fn created_response(
    state: &AppState,
    path: &NamePath,
    version_key: &str,
) -> Result<Response, HatracError> {
    let url = resource_url(state, path, Some(version_key));
    let mut response = (
        StatusCode::CREATED,
        [("content-type", "text/uri-list".to_string())],
        format!("{url}\r\n"),
    )
        .into_response();
    let hdrs = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&url) {
        hdrs.insert("location", v);
    }
    if let Ok(v) = HeaderValue::from_str(&conditional::quote_etag(version_key)) {
        hdrs.insert("etag", v);
    }
    Ok(response)
}

/// `GET`/`HEAD` on an object path: serve the current version.
pub async fn get(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response, HatracError> {
    let current_id = object.current_version_id.ok_or_else(|| {
        HatracError::Conflict(format!("{} has no content version", object.name))
    })?;
    let record = state
        .directory
        .get_version_by_id(current_id)?
        .filter(|v| v.deleted_at.is_none())
        .ok_or_else(|| {
            HatracError::Conflict(format!("{} has no content version", object.name))
        })?;

    let ctx = client_context(&state, headers);
    let mut chain = resolved.acl_chain();
    chain.push(&record.acls);
    if !authz::authorized(&state.config, &ctx.effective_roles(), ResourceAction::Read, &chain) {
        return Err(authz::denial(ctx.is_anonymous(), "read this object"));
    }

    conditional::evaluate_preconditions(headers, Some(record.etag_token()), true)?;

    version::serve(state, headers, record, head).await
}

/// `DELETE` on an object path: tombstone the object and every version,
/// cancel open upload jobs, and reclaim backend storage.
pub async fn delete(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    headers: &HeaderMap,
) -> Result<Response, HatracError> {
    let current_etag = match object.current_version_id {
        Some(id) => state
            .directory
            .get_version_by_id(id)?
            .map(|v| v.version_key),
        None => None,
    };

    let ctx = client_context(&state, headers);
    let chain = resolved.acl_chain();
    if !authz::authorized(&state.config, &ctx.effective_roles(), ResourceAction::Delete, &chain) {
        return Err(authz::denial(ctx.is_anonymous(), "delete this object"));
    }
    conditional::evaluate_preconditions(headers, current_etag.as_deref(), false)?;

    let (versions, uploads) = state.directory.delete_object(object.id)?;

    // Backend cleanup is best-effort and idempotent; renamed versions
    // never owned their bytes.
    for record in versions {
        if record.aux.rename_to.is_some() {
            continue;
        }
        let name = record
            .aux
            .hname
            .clone()
            .unwrap_or_else(|| record.object_name.clone());
        let version_key = record
            .aux
            .hversion
            .clone()
            .unwrap_or_else(|| record.version_key.clone());
        if let Err(e) = state
            .storage
            .delete(&name, &version_key, record.aux.version.as_deref())
            .await
        {
            tracing::warn!("backend delete for {name}:{version_key} failed: {e}");
        }
    }
    for job in uploads {
        if let Some(ref handle) = job.backend_handle {
            if let Err(e) = state.storage.cancel_upload(&job.object_name, handle).await {
                tracing::warn!("backend cancel for upload {} failed: {e}", job.job_key);
            }
        }
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}
