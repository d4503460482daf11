//! Namespace resource handlers.
//!
//! Namespaces are created by PUT with the dedicated content type,
//! listed shallowly by GET, and deleted only when empty.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::authz::{self, ResourceAction};
use crate::conditional;
use crate::directory::records::{Binding, NamespaceRecord, ResolvedName};
use crate::errors::HatracError;
use crate::name::NamePath;
use crate::AppState;

use super::{client_context, listing_response, name_from_stored, resource_url, strip_body};

/// `PUT` with `Content-Type: application/x-hatrac-namespace`. With
/// `parents=true`, missing ancestors are created along the way.
pub async fn create(
    state: Arc<AppState>,
    path: &NamePath,
    headers: &HeaderMap,
    parents: bool,
) -> Result<Response, HatracError> {
    path.validate_for_creation()?;
    if path.is_root() {
        return Err(HatracError::Conflict(
            "the root namespace already exists".to_string(),
        ));
    }

    let ctx = client_context(&state, headers);
    let roles = ctx.effective_roles();

    // Authorize against the nearest existing live ancestor; with
    // parents=true that may sit several levels up.
    let ancestor = nearest_live_ancestor(&state, path)?;
    let chain = ancestor.acl_chain();
    if !authz::authorized(&state.config, &roles, ResourceAction::CreateChild, &chain) {
        return Err(authz::denial(ctx.is_anonymous(), "create this namespace"));
    }

    let (record, _restored) =
        state
            .directory
            .create_namespace(path, parents, &ctx.ownership_roles())?;

    let url = resource_url(&state, path, None);
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
    if let Ok(v) = HeaderValue::from_str(&conditional::quote_etag(&record.etag_token())) {
        hdrs.insert("etag", v);
    }
    Ok(response)
}

/// Walk up from `path`'s parent to the nearest live namespace.
fn nearest_live_ancestor(
    state: &AppState,
    path: &NamePath,
) -> Result<ResolvedName, HatracError> {
    let mut candidate = path.parent();
    loop {
        match state.directory.resolve(&candidate) {
            Ok(resolved) => match &resolved.binding {
                Binding::Namespace(_) => return Ok(resolved),
                Binding::Object(_) => {
                    return Err(HatracError::Conflict(format!(
                        "{candidate} is an object and cannot hold children"
                    )))
                }
                _ if candidate.is_root() => {
                    return Err(HatracError::Internal(anyhow::anyhow!(
                        "root namespace unresolvable"
                    )))
                }
                _ => candidate = candidate.parent(),
            },
            Err(HatracError::NotFound(_)) if !candidate.is_root() => {
                candidate = candidate.parent();
            }
            Err(err) => return Err(err),
        }
    }
}

/// `GET`/`HEAD` on a namespace: shallow listing of live children as a
/// JSON array (default) or `text/uri-list`.
pub async fn list(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    namespace: &NamespaceRecord,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response, HatracError> {
    let ctx = client_context(&state, headers);
    let chain = resolved.acl_chain();
    if !authz::authorized(&state.config, &ctx.effective_roles(), ResourceAction::Read, &chain) {
        return Err(authz::denial(ctx.is_anonymous(), "list this namespace"));
    }

    let etag = namespace.etag_token();
    conditional::evaluate_preconditions(headers, Some(etag.as_str()), true)?;

    let entries: Vec<String> = state
        .directory
        .enumerate_children(namespace.id)?
        .iter()
        .map(|child| resource_url(&state, &name_from_stored(&child.name), None))
        .collect();

    let response = listing_response(headers, entries, Some(etag.as_str()));
    Ok(if head { strip_body(response) } else { response })
}

/// `DELETE` on a namespace: only an empty namespace may go.
pub async fn delete(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    namespace: &NamespaceRecord,
    headers: &HeaderMap,
) -> Result<Response, HatracError> {
    let ctx = client_context(&state, headers);
    let chain = resolved.acl_chain();
    if !authz::authorized(&state.config, &ctx.effective_roles(), ResourceAction::Delete, &chain) {
        return Err(authz::denial(ctx.is_anonymous(), "delete this namespace"));
    }
    conditional::evaluate_preconditions(headers, Some(namespace.etag_token().as_str()), false)?;

    state.directory.delete_namespace(namespace.id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
