//! `;metadata` sub-resource handlers.
//!
//! The collection reads as a JSON object of the set fields; single
//! fields read and write as plain text. Digest fields are immutable
//! once set; only `content-type` and `content-disposition` may be
//! rewritten or removed.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::authz::{self, ResourceAction};
use crate::conditional::{self, quote_etag};
use crate::directory::records::{ObjectRecord, ResolvedName, VersionMetadata, VersionRecord};
use crate::errors::HatracError;
use crate::AppState;

use super::{client_context, strip_body, validate_content_disposition};

/// Resolve the version a metadata request addresses: the qualified
/// version, or the object's current version.
pub fn target_version(
    state: &AppState,
    object: &ObjectRecord,
    version_key: Option<&str>,
) -> Result<VersionRecord, HatracError> {
    match version_key {
        Some(key) => state
            .directory
            .get_version(object.id, key)?
            .filter(|v| v.deleted_at.is_none())
            .ok_or_else(|| HatracError::NotFound(format!("no such version {key:?}"))),
        None => {
            let current_id = object.current_version_id.ok_or_else(|| {
                HatracError::Conflict(format!("{} has no content version", object.name))
            })?;
            state
                .directory
                .get_version_by_id(current_id)?
                .filter(|v| v.deleted_at.is_none())
                .ok_or_else(|| {
                    HatracError::Conflict(format!("{} has no content version", object.name))
                })
        }
    }
}

fn known_field(field: &str) -> Result<(), HatracError> {
    if VersionMetadata::FIELDS.contains(&field) {
        Ok(())
    } else {
        Err(HatracError::NotFound(format!(
            "unknown metadata field {field:?}"
        )))
    }
}

/// `GET`/`HEAD` on `;metadata` or `;metadata/<field>`.
pub async fn get(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    version_key: Option<&str>,
    field: Option<&str>,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response, HatracError> {
    let record = target_version(&state, object, version_key)?;

    let ctx = client_context(&state, headers);
    let mut chain = resolved.acl_chain();
    chain.push(&record.acls);
    if !authz::authorized(&state.config, &ctx.effective_roles(), ResourceAction::Read, &chain) {
        return Err(authz::denial(ctx.is_anonymous(), "read this metadata"));
    }

    conditional::evaluate_preconditions(headers, Some(record.etag_token()), true)?;

    let response = match field {
        None => {
            let mut map = serde_json::Map::new();
            for name in VersionMetadata::FIELDS {
                if let Some(value) = record.metadata.field(name) {
                    map.insert(name.to_string(), serde_json::Value::String(value.into()));
                }
            }
            let body = serde_json::Value::Object(map).to_string();
            (
                StatusCode::OK,
                [("content-type", "application/json".to_string())],
                body,
            )
                .into_response()
        }
        Some(field) => {
            known_field(field)?;
            let value = record.metadata.field(field).ok_or_else(|| {
                HatracError::NotFound(format!("{field} is not set on this version"))
            })?;
            (
                StatusCode::OK,
                [("content-type", "text/plain".to_string())],
                format!("{value}\n"),
            )
                .into_response()
        }
    };

    let mut response = response;
    if let Ok(v) = HeaderValue::from_str(&quote_etag(record.etag_token())) {
        response.headers_mut().insert("etag", v);
    }
    Ok(if head { strip_body(response) } else { response })
}

/// `PUT` on `;metadata/<field>` with a plain-text value.
pub async fn put(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    version_key: Option<&str>,
    field: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, HatracError> {
    known_field(field)?;
    let record = target_version(&state, object, version_key)?;

    let ctx = client_context(&state, headers);
    let mut chain = resolved.acl_chain();
    chain.push(&record.acls);
    if !authz::authorized(
        &state.config,
        &ctx.effective_roles(),
        ResourceAction::ManageMetadata,
        &chain,
    ) {
        return Err(authz::denial(ctx.is_anonymous(), "manage this metadata"));
    }

    conditional::evaluate_preconditions(headers, Some(record.etag_token()), false)?;

    let value = std::str::from_utf8(body)
        .map_err(|_| HatracError::BadRequest("metadata value is not valid UTF-8".to_string()))?
        .trim()
        .to_string();
    if value.is_empty() {
        return Err(HatracError::BadRequest(
            "metadata value must not be empty".to_string(),
        ));
    }

    let normalized = match field {
        "content-md5" => super::parse_digest(&value, 16, "content-md5")?,
        "content-sha256" => super::parse_digest(&value, 32, "content-sha256")?,
        "content-disposition" => {
            validate_content_disposition(&value)?;
            value
        }
        _ => {
            if value.chars().any(|c| c.is_control()) {
                return Err(HatracError::BadRequest(
                    "metadata value contains control characters".to_string(),
                ));
            }
            value
        }
    };

    state
        .directory
        .set_metadata_field(record.id, field, &normalized)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `DELETE` on `;metadata/<field>` — mutable fields only.
pub async fn delete(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    object: &ObjectRecord,
    version_key: Option<&str>,
    field: &str,
    headers: &HeaderMap,
) -> Result<Response, HatracError> {
    known_field(field)?;
    let record = target_version(&state, object, version_key)?;

    let ctx = client_context(&state, headers);
    let mut chain = resolved.acl_chain();
    chain.push(&record.acls);
    if !authz::authorized(
        &state.config,
        &ctx.effective_roles(),
        ResourceAction::ManageMetadata,
        &chain,
    ) {
        return Err(authz::denial(ctx.is_anonymous(), "manage this metadata"));
    }

    conditional::evaluate_preconditions(headers, Some(record.etag_token()), false)?;

    state.directory.delete_metadata_field(record.id, field)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
