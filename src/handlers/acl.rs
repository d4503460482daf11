//! `;acl` sub-resource handlers.
//!
//! ACLs read and write at three granularities: the whole collection,
//! one access list, and one entry. Only owners see or edit ACLs, and a
//! conditional write is evaluated after authorization so preconditions
//! cannot probe state the caller may not read.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::authz::{self, AclKind, AclSet, ResourceAction};
use crate::conditional::{self, quote_etag};
use crate::directory::records::{Binding, ResolvedName};
use crate::directory::sqlite::AclUpdate;
use crate::errors::HatracError;
use crate::AppState;

use super::{client_context, strip_body};

/// The ACL-bearing resource a request addresses.
pub struct AclTarget {
    pub kind: AclKind,
    pub id: i64,
    pub acls: AclSet,
    /// ETag token of the ACL surface.
    pub etag: String,
    /// ACL chain including the target resource, for authorization.
    pub chain_acls: Vec<AclSet>,
}

/// Resolve the addressed ACL surface: a version's, an object's, or a
/// namespace's.
pub fn target(
    state: &AppState,
    resolved: &ResolvedName,
    version_key: Option<&str>,
) -> Result<AclTarget, HatracError> {
    let mut chain_acls: Vec<AclSet> = resolved.ancestors.iter().map(|n| n.acls.clone()).collect();
    match (&resolved.binding, version_key) {
        (Binding::Object(obj), Some(key)) => {
            let record = state
                .directory
                .get_version(obj.id, key)?
                .filter(|v| v.deleted_at.is_none())
                .ok_or_else(|| HatracError::NotFound(format!("no such version {key:?}")))?;
            chain_acls.push(obj.acls.clone());
            chain_acls.push(record.acls.clone());
            // ACL surfaces need an ETag that moves with ACL edits; the
            // bare version key never would.
            let etag = format!("{}.{}", record.version_key, record.update_seq);
            Ok(AclTarget {
                kind: AclKind::Version,
                id: record.id,
                acls: record.acls.clone(),
                etag,
                chain_acls,
            })
        }
        (Binding::Object(obj), None) => {
            chain_acls.push(obj.acls.clone());
            Ok(AclTarget {
                kind: AclKind::Object,
                id: obj.id,
                acls: obj.acls.clone(),
                etag: obj.etag_token(),
                chain_acls,
            })
        }
        (Binding::Namespace(ns), None) => {
            chain_acls.push(ns.acls.clone());
            Ok(AclTarget {
                kind: AclKind::Namespace,
                id: ns.id,
                acls: ns.acls.clone(),
                etag: ns.etag_token(),
                chain_acls,
            })
        }
        (Binding::Namespace(_), Some(_)) => Err(HatracError::Conflict(
            "namespaces have no versions".to_string(),
        )),
        _ => Err(HatracError::NotFound("no such resource".to_string())),
    }
}

fn require_owner(
    state: &AppState,
    headers: &HeaderMap,
    target: &AclTarget,
) -> Result<(), HatracError> {
    let ctx = client_context(state, headers);
    let chain: Vec<&AclSet> = target.chain_acls.iter().collect();
    if !authz::owns(&ctx.effective_roles(), &chain) {
        return Err(authz::denial(ctx.is_anonymous(), "read these ACLs"));
    }
    Ok(())
}

fn require_manage(
    state: &AppState,
    headers: &HeaderMap,
    target: &AclTarget,
) -> Result<(), HatracError> {
    let ctx = client_context(state, headers);
    let chain: Vec<&AclSet> = target.chain_acls.iter().collect();
    if !authz::authorized(
        &state.config,
        &ctx.effective_roles(),
        ResourceAction::ManageAcls,
        &chain,
    ) {
        return Err(authz::denial(ctx.is_anonymous(), "manage these ACLs"));
    }
    Ok(())
}

fn with_etag(mut response: Response, etag: &str) -> Response {
    if let Ok(v) = HeaderValue::from_str(&quote_etag(etag)) {
        response.headers_mut().insert("etag", v);
    }
    response
}

/// `GET`/`HEAD` on `;acl[/access[/entry]]`.
pub async fn get(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    version_key: Option<&str>,
    access: Option<&str>,
    entry: Option<&str>,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response, HatracError> {
    let target = target(&state, resolved, version_key)?;
    require_owner(&state, headers, &target)?;
    conditional::evaluate_preconditions(headers, Some(target.etag.as_str()), true)?;

    let response = match (access, entry) {
        (None, _) => {
            let mut map = serde_json::Map::new();
            for name in target.kind.access_names() {
                let roles: Vec<&String> = target
                    .acls
                    .get(name)
                    .map(|set| set.iter().collect())
                    .unwrap_or_default();
                map.insert(
                    name.to_string(),
                    serde_json::to_value(roles).unwrap_or_default(),
                );
            }
            (
                StatusCode::OK,
                [("content-type", "application/json".to_string())],
                serde_json::Value::Object(map).to_string(),
            )
                .into_response()
        }
        (Some(access), None) => {
            target.kind.validate_access(access)?;
            let roles: Vec<&String> = target
                .acls
                .get(access)
                .map(|set| set.iter().collect())
                .unwrap_or_default();
            (
                StatusCode::OK,
                [("content-type", "application/json".to_string())],
                serde_json::to_string(&roles).unwrap_or_else(|_| "[]".to_string()),
            )
                .into_response()
        }
        (Some(access), Some(entry)) => {
            target.kind.validate_access(access)?;
            let present = target
                .acls
                .get(access)
                .map(|set| set.contains(entry))
                .unwrap_or(false);
            if !present {
                return Err(HatracError::NotFound(format!(
                    "role {entry:?} is not in the {access} ACL"
                )));
            }
            (
                StatusCode::OK,
                [("content-type", "text/plain".to_string())],
                format!("{entry}\n"),
            )
                .into_response()
        }
    };

    let response = with_etag(response, &target.etag);
    Ok(if head { strip_body(response) } else { response })
}

/// `PUT` on `;acl/<access>` (JSON role list) or `;acl/<access>/<entry>`
/// (no body).
pub async fn put(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    version_key: Option<&str>,
    access: &str,
    entry: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, HatracError> {
    let target = target(&state, resolved, version_key)?;
    target.kind.validate_access(access)?;
    require_manage(&state, headers, &target)?;
    // Conditional after authorization: a 412 must not leak ACL state to
    // callers who may not manage it.
    conditional::evaluate_preconditions(headers, Some(target.etag.as_str()), false)?;

    let update = match entry {
        Some(entry) => {
            if !body.is_empty() {
                return Err(HatracError::BadRequest(
                    "entry insertion takes no request body".to_string(),
                ));
            }
            AclUpdate::InsertEntry(entry.to_string())
        }
        None => {
            let roles: Vec<String> = serde_json::from_slice(body).map_err(|_| {
                HatracError::BadRequest("ACL body must be a JSON array of role strings".to_string())
            })?;
            AclUpdate::ReplaceList(roles.into_iter().collect::<BTreeSet<String>>())
        }
    };

    state
        .directory
        .update_acl(target.kind, target.id, access, &update)?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `DELETE` on `;acl/<access>` (clear the list) or
/// `;acl/<access>/<entry>` (remove one role).
pub async fn delete(
    state: Arc<AppState>,
    resolved: &ResolvedName,
    version_key: Option<&str>,
    access: &str,
    entry: Option<&str>,
    headers: &HeaderMap,
) -> Result<Response, HatracError> {
    let target = target(&state, resolved, version_key)?;
    target.kind.validate_access(access)?;
    require_manage(&state, headers, &target)?;
    conditional::evaluate_preconditions(headers, Some(target.etag.as_str()), false)?;

    let update = match entry {
        Some(entry) => AclUpdate::RemoveEntry(entry.to_string()),
        None => AclUpdate::ClearList,
    };
    state
        .directory
        .update_acl(target.kind, target.id, access, &update)?;

    Ok(StatusCode::NO_CONTENT.into_response())
}
