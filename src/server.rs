//! Axum router construction and request dispatch.
//!
//! Hatrac names nest arbitrarily deep and the meta-syntax (`;`, `:`)
//! lives inside path segments, so routing cannot lean on the framework's
//! pattern matching: every method gets one wildcard route under the
//! service prefix, the raw (still percent-encoded) path is parsed by the
//! name codec, and dispatch selects a handler from the method and the
//! parsed sub-resource. Errors render through the configured templates
//! at this boundary.

use axum::{
    extract::{DefaultBodyLimit, RawQuery, State},
    http::{HeaderMap, HeaderValue, Method, Uri},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::directory::records::Binding;
use crate::errors::{generate_request_id, render_error, HatracError};
use crate::handlers::{self, NAMESPACE_CONTENT_TYPE};
use crate::name::{self, SubResource};
use crate::AppState;

/// Build the axum [`Router`] serving the hatrac path space.
pub fn app(state: Arc<AppState>) -> Router {
    let prefix = state.config.service_prefix.trim_end_matches('/').to_string();
    let root = if prefix.is_empty() {
        "/".to_string()
    } else {
        prefix.clone()
    };
    let wildcard = format!("{prefix}/*path");

    let routes = Router::new()
        .route(
            &root,
            get(handle_get)
                .head(handle_head)
                .put(handle_put)
                .post(handle_post)
                .delete(handle_delete),
        )
        .route(
            &wildcard,
            get(handle_get)
                .head(handle_head)
                .put(handle_put)
                .post(handle_post)
                .delete(handle_delete),
        );

    routes
        .with_state(state)
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        // Streaming payloads are bounded by max_request_payload_size in
        // the handlers, not by the framework default.
        .layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Adds a request id, `Date`, and `Server` to every response.
async fn common_headers_middleware(
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-hatrac-request-id") {
        let request_id = generate_request_id();
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            headers.insert("x-hatrac-request-id", v);
        }
    }
    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(v) = HeaderValue::from_str(&date) {
        headers.insert("date", v);
    }
    headers.insert("server", HeaderValue::from_static("Hatrac"));

    response
}

// -- Query parameter parsing helper ------------------------------------------

/// Parse a raw query string into a map; bare keys get empty values.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                let decoded_k = percent_encoding::percent_decode_str(k)
                    .decode_utf8_lossy()
                    .into_owned();
                let decoded_v = percent_encoding::percent_decode_str(v)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded_k, decoded_v);
            } else if !part.is_empty() {
                let decoded = percent_encoding::percent_decode_str(part)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded, String::new());
            }
        }
    }
    map
}

// -- Method entry points -----------------------------------------------------

async fn handle_get(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    run(
        state,
        Method::GET,
        uri,
        raw_query,
        headers,
        axum::body::Body::empty(),
    )
    .await
}

async fn handle_head(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    run(
        state,
        Method::HEAD,
        uri,
        raw_query,
        headers,
        axum::body::Body::empty(),
    )
    .await
}

async fn handle_put(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Response {
    run(state, Method::PUT, uri, raw_query, headers, body).await
}

async fn handle_post(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Response {
    run(state, Method::POST, uri, raw_query, headers, body).await
}

async fn handle_delete(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    run(
        state,
        Method::DELETE,
        uri,
        raw_query,
        headers,
        axum::body::Body::empty(),
    )
    .await
}

async fn run(
    state: Arc<AppState>,
    method: Method,
    uri: Uri,
    raw_query: Option<String>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Response {
    let query = parse_query(raw_query);
    match dispatch(state.clone(), method, &uri, &query, &headers, body).await {
        Ok(response) => response,
        Err(err) => render_error(&state.config, &headers, err),
    }
}

/// Cap for metadata-only JSON payloads (upload requests, ACL bodies,
/// metadata values); bulk content always streams.
const SMALL_BODY_LIMIT: usize = 1024 * 1024;

async fn small_body(body: axum::body::Body) -> Result<Vec<u8>, HatracError> {
    let bytes = axum::body::to_bytes(body, SMALL_BODY_LIMIT)
        .await
        .map_err(|_| {
            HatracError::PayloadTooLarge("request body exceeds the metadata payload limit".into())
        })?;
    Ok(bytes.to_vec())
}

// -- Dispatch ----------------------------------------------------------------

async fn dispatch(
    state: Arc<AppState>,
    method: Method,
    uri: &Uri,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: axum::body::Body,
) -> Result<Response, HatracError> {
    // Parse the raw path; percent-encoding is meaningful to the codec,
    // so the framework's decoded captures are not used.
    let prefix = state.config.service_prefix.trim_end_matches('/');
    let raw_path = uri.path().strip_prefix(prefix).unwrap_or(uri.path());
    let target = name::parse_path(raw_path, &state.class)?;
    let head = method == Method::HEAD;

    match target.subresource.clone() {
        None => dispatch_name(state, method, target, query, headers, body).await,

        Some(SubResource::Versions) => {
            if !(method == Method::GET || method == Method::HEAD) {
                return Err(HatracError::MethodNotAllowed);
            }
            let resolved = state.directory.resolve(&target.name)?;
            let object = require_object(&resolved, &target.name)?;
            handlers::version::list(state, &resolved, &object, headers, head).await
        }

        Some(SubResource::Metadata { field }) => {
            let resolved = state.directory.resolve(&target.name)?;
            let object = require_object(&resolved, &target.name)?;
            match method.as_str() {
                "GET" | "HEAD" => {
                    handlers::metadata::get(
                        state,
                        &resolved,
                        &object,
                        target.version.as_deref(),
                        field.as_deref(),
                        headers,
                        head,
                    )
                    .await
                }
                "PUT" => {
                    let field = field.ok_or(HatracError::MethodNotAllowed)?;
                    let value = small_body(body).await?;
                    handlers::metadata::put(
                        state,
                        &resolved,
                        &object,
                        target.version.as_deref(),
                        &field,
                        headers,
                        &value,
                    )
                    .await
                }
                "DELETE" => {
                    let field = field.ok_or(HatracError::MethodNotAllowed)?;
                    handlers::metadata::delete(
                        state,
                        &resolved,
                        &object,
                        target.version.as_deref(),
                        &field,
                        headers,
                    )
                    .await
                }
                _ => Err(HatracError::MethodNotAllowed),
            }
        }

        Some(SubResource::Acl { access, entry }) => {
            let resolved = state.directory.resolve(&target.name)?;
            match method.as_str() {
                "GET" | "HEAD" => {
                    handlers::acl::get(
                        state,
                        &resolved,
                        target.version.as_deref(),
                        access.as_deref(),
                        entry.as_deref(),
                        headers,
                        head,
                    )
                    .await
                }
                "PUT" => {
                    let access = access.ok_or(HatracError::MethodNotAllowed)?;
                    let value = small_body(body).await?;
                    handlers::acl::put(
                        state,
                        &resolved,
                        target.version.as_deref(),
                        &access,
                        entry.as_deref(),
                        headers,
                        &value,
                    )
                    .await
                }
                "DELETE" => {
                    let access = access.ok_or(HatracError::MethodNotAllowed)?;
                    handlers::acl::delete(
                        state,
                        &resolved,
                        target.version.as_deref(),
                        &access,
                        entry.as_deref(),
                        headers,
                    )
                    .await
                }
                _ => Err(HatracError::MethodNotAllowed),
            }
        }

        Some(SubResource::Upload { job, chunk }) => {
            if target.version.is_some() {
                return Err(HatracError::BadRequest(
                    "upload jobs attach to objects, not versions".to_string(),
                ));
            }
            dispatch_upload(state, method, target, job, chunk, headers, body).await
        }
    }
}

/// Dispatch for bare names (no sub-resource).
async fn dispatch_name(
    state: Arc<AppState>,
    method: Method,
    target: name::ResourceRef,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: axum::body::Body,
) -> Result<Response, HatracError> {
    let head = method == Method::HEAD;

    // Version-qualified: always a version resource.
    if let Some(ref version_key) = target.version {
        let resolved = state.directory.resolve(&target.name)?;
        let object = require_object(&resolved, &target.name)?;
        return match method.as_str() {
            "GET" | "HEAD" => {
                handlers::version::get(state, &resolved, &object, version_key, headers, head).await
            }
            "DELETE" => {
                handlers::version::delete(state, &resolved, &object, version_key, headers).await
            }
            _ => Err(HatracError::MethodNotAllowed),
        };
    }

    match method.as_str() {
        "PUT" => {
            let namespace_put = headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.split(';').next().unwrap_or("").trim() == NAMESPACE_CONTENT_TYPE)
                .unwrap_or(false);
            let parents = query.get("parents").map(|v| v == "true").unwrap_or(false);

            if namespace_put {
                // An existing object path always takes content, even
                // under the namespace content type.
                let existing_object = matches!(
                    state.directory.resolve(&target.name),
                    Ok(ref resolved) if matches!(resolved.binding, Binding::Object(_))
                );
                if !existing_object {
                    return handlers::namespace::create(state, &target.name, headers, parents)
                        .await;
                }
            }
            let resolved = state.directory.resolve(&target.name)?;
            handlers::object::put(state, &target.name, &resolved, headers, body).await
        }
        "GET" | "HEAD" => {
            let resolved = state.directory.resolve(&target.name)?;
            match resolved.binding.clone() {
                Binding::Namespace(ns) => {
                    handlers::namespace::list(state, &resolved, &ns, headers, head).await
                }
                Binding::Object(obj) => {
                    handlers::object::get(state, &resolved, &obj, headers, head).await
                }
                _ => Err(HatracError::NotFound(format!("{} not found", target.name))),
            }
        }
        "DELETE" => {
            let resolved = state.directory.resolve(&target.name)?;
            match resolved.binding.clone() {
                Binding::Namespace(ns) => {
                    handlers::namespace::delete(state, &resolved, &ns, headers).await
                }
                Binding::Object(obj) => {
                    handlers::object::delete(state, &resolved, &obj, headers).await
                }
                _ => Err(HatracError::NotFound(format!("{} not found", target.name))),
            }
        }
        _ => Err(HatracError::MethodNotAllowed),
    }
}

/// Dispatch for the `;upload` sub-resource.
async fn dispatch_upload(
    state: Arc<AppState>,
    method: Method,
    target: name::ResourceRef,
    job: Option<String>,
    chunk: Option<u64>,
    headers: &HeaderMap,
    body: axum::body::Body,
) -> Result<Response, HatracError> {
    let head = method == Method::HEAD;

    // Job creation may define the object binding; everything else
    // requires a live object.
    if job.is_none() {
        return match method.as_str() {
            "POST" => {
                let resolved = state.directory.resolve(&target.name)?;
                let payload = small_body(body).await?;
                handlers::upload::create(state, &target.name, &resolved, headers, &payload).await
            }
            "GET" | "HEAD" => {
                let resolved = state.directory.resolve(&target.name)?;
                let object = require_object(&resolved, &target.name)?;
                handlers::upload::list(state, &resolved, &object, headers, head).await
            }
            _ => Err(HatracError::MethodNotAllowed),
        };
    }

    let job_key = job.expect("checked above");
    let resolved = state.directory.resolve(&target.name)?;
    let object = require_object(&resolved, &target.name)?;

    match (method.as_str(), chunk) {
        ("PUT", Some(position)) => {
            handlers::upload::put_chunk(
                state, &resolved, &object, &job_key, position, headers, body,
            )
            .await
        }
        ("GET", None) | ("HEAD", None) => {
            handlers::upload::status(state, &resolved, &object, &job_key, headers, head).await
        }
        ("POST", None) => {
            handlers::upload::finalize(state, &resolved, &object, &job_key, headers).await
        }
        ("DELETE", None) => {
            handlers::upload::cancel(state, &resolved, &object, &job_key, headers).await
        }
        _ => Err(HatracError::MethodNotAllowed),
    }
}

/// The resolved binding must be a live object.
fn require_object(
    resolved: &crate::directory::records::ResolvedName,
    path: &name::NamePath,
) -> Result<crate::directory::records::ObjectRecord, HatracError> {
    match &resolved.binding {
        Binding::Object(obj) => Ok(obj.clone()),
        _ => Err(HatracError::NotFound(format!("{path} is not an object"))),
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn::TrustedHeaderProvider;
    use crate::config::Config;
    use crate::directory::sqlite::SqliteDirectory;
    use crate::name::SegmentClass;
    use crate::storage::filesystem::FilesystemBackend;
    use axum::body::Body;
    use http::Request as HttpRequest;
    use tower::ServiceExt;

    /// Router over a temp directory and in-memory database, with the
    /// root owned by `admin`.
    fn test_app() -> (Router, tempfile::TempDir) {
        let tmp = tempfile::tempdir().expect("failed to create temp dir");
        let config = Config::default();
        let class = SegmentClass::parse(&config.allowed_url_char_class).unwrap();

        let directory = SqliteDirectory::open(":memory:", config.database_max_retries)
            .expect("open in-memory directory");
        directory.deploy(&["admin".to_string()]).expect("deploy");

        let storage =
            FilesystemBackend::new(tmp.path().join("storage")).expect("create backend");

        let state = Arc::new(AppState {
            config,
            class,
            directory: Arc::new(directory),
            storage: Arc::new(storage),
            authn: Arc::new(TrustedHeaderProvider::new()),
        });

        (app(state), tmp)
    }

    fn request(method: &str, uri: &str) -> http::request::Builder {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("x-hatrac-client", "admin")
    }

    #[tokio::test]
    async fn root_listing_is_json_array() {
        let (router, _tmp) = test_app();
        let resp = router
            .oneshot(request("GET", "/hatrac").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn namespace_create_then_conflict() {
        let (router, _tmp) = test_app();

        let resp = router
            .clone()
            .oneshot(
                request("PUT", "/hatrac/ns-X")
                    .header("content-type", NAMESPACE_CONTENT_TYPE)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        assert_eq!(
            resp.headers().get("location").unwrap(),
            "/hatrac/ns-X"
        );

        let resp = router
            .oneshot(
                request("PUT", "/hatrac/ns-X")
                    .header("content-type", NAMESPACE_CONTENT_TYPE)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
    }

    #[tokio::test]
    async fn unknown_name_is_404_with_server_headers() {
        let (router, _tmp) = test_app();
        let resp = router
            .oneshot(request("GET", "/hatrac/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.headers().get("server").unwrap(), "Hatrac");
        assert!(resp.headers().contains_key("x-hatrac-request-id"));
        assert!(resp.headers().contains_key("date"));
    }

    #[tokio::test]
    async fn malformed_path_is_400() {
        let (router, _tmp) = test_app();
        let resp = router
            .oneshot(
                request("GET", "/hatrac/bad%2name")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn method_kind_mismatch_is_405() {
        let (router, _tmp) = test_app();
        let resp = router
            .clone()
            .oneshot(
                request("PUT", "/hatrac/ns")
                    .header("content-type", NAMESPACE_CONTENT_TYPE)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);

        let resp = router
            .oneshot(request("POST", "/hatrac/ns").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), 405);
    }

    #[tokio::test]
    async fn uri_list_listing_on_accept() {
        let (router, _tmp) = test_app();
        let resp = router
            .clone()
            .oneshot(
                request("PUT", "/hatrac/ns-a")
                    .header("content-type", NAMESPACE_CONTENT_TYPE)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);

        let resp = router
            .oneshot(
                request("GET", "/hatrac")
                    .header("accept", "text/uri-list")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/uri-list");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"/hatrac/ns-a\r\n");
    }
}
