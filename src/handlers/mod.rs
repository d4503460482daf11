//! Request handlers organized by resource kind.
//!
//! Each handler enforces, in order: method/kind compatibility, content
//! negotiation, authorization, precondition evaluation, validation,
//! directory action, storage action, response composition. Authorization
//! runs before conditionals so a 304 or 412 never discloses state to a
//! caller who may not read it. Dispatch by method and parsed
//! sub-resource lives in `server`.

pub mod acl;
pub mod metadata;
pub mod namespace;
pub mod object;
pub mod upload;
pub mod version;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;

use crate::authn::ClientContext;
use crate::errors::HatracError;
use crate::name::NamePath;
use crate::storage::backend::ByteStream;
use crate::AppState;

/// Content type that marks a PUT as namespace creation.
pub const NAMESPACE_CONTENT_TYPE: &str = "application/x-hatrac-namespace";

/// Service-relative URL of a name (optionally version-qualified).
pub fn resource_url(state: &AppState, path: &NamePath, version: Option<&str>) -> String {
    let mut url = format!(
        "{}{}",
        state.config.service_prefix.trim_end_matches('/'),
        path.encode(&state.class)
    );
    if let Some(version) = version {
        url.push(':');
        url.push_str(&state.class.encode(version));
    }
    url
}

/// Parse a stored full path back into a [`NamePath`].
pub fn name_from_stored(stored: &str) -> NamePath {
    let segments: Vec<String> = stored
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    NamePath::from_segments(segments)
}

/// Negotiate a listing body: `text/uri-list` on request, JSON otherwise.
pub fn listing_response(headers: &HeaderMap, entries: Vec<String>, etag: Option<&str>) -> Response {
    let accept = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let wants_uri_list = accept
        .split(',')
        .any(|part| part.split(';').next().unwrap_or("").trim() == "text/uri-list");

    let mut response = if wants_uri_list {
        let mut body = entries.join("\r\n");
        if !body.is_empty() {
            body.push_str("\r\n");
        }
        (
            StatusCode::OK,
            [("content-type", "text/uri-list".to_string())],
            body,
        )
            .into_response()
    } else {
        let body = serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string());
        (
            StatusCode::OK,
            [("content-type", "application/json".to_string())],
            body,
        )
            .into_response()
    };

    if let Some(etag) = etag {
        if let Ok(v) = HeaderValue::from_str(&crate::conditional::quote_etag(etag)) {
            response.headers_mut().insert("etag", v);
        }
    }
    response
}

/// Strip the body of a response built for GET, for HEAD mirroring.
pub fn strip_body(response: Response) -> Response {
    let (parts, _body) = response.into_parts();
    Response::from_parts(parts, axum::body::Body::empty())
}

/// The authenticated client for this request.
pub fn client_context(state: &AppState, headers: &HeaderMap) -> ClientContext {
    state.authn.identify(headers)
}

/// Declared request payload size; hatrac never accepts unsized bodies.
pub fn require_content_length(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<u64, HatracError> {
    let length: u64 = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            HatracError::BadRequest("a valid Content-Length header is required".to_string())
        })?;
    if length > state.config.max_request_payload_size {
        return Err(HatracError::PayloadTooLarge(format!(
            "payload of {length} bytes exceeds the {} byte limit",
            state.config.max_request_payload_size
        )));
    }
    Ok(length)
}

/// Adapt an axum request body into a backend byte stream.
pub fn body_stream(body: axum::body::Body) -> ByteStream {
    Box::pin(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other)),
    )
}

/// Validate and normalize a base64 digest header value.
///
/// `len` is the raw digest length (16 for MD5, 32 for SHA-256). The
/// normalized re-encoding is returned so stored values compare bytewise.
pub fn parse_digest(value: &str, len: usize, what: &str) -> Result<String, HatracError> {
    use base64::Engine;
    let engine = base64::engine::general_purpose::STANDARD;
    let decoded = engine
        .decode(value.trim())
        .map_err(|_| HatracError::BadRequest(format!("malformed base64 in {what}")))?;
    if decoded.len() != len {
        return Err(HatracError::BadRequest(format!(
            "{what} must encode {len} bytes, got {}",
            decoded.len()
        )));
    }
    Ok(engine.encode(decoded))
}

/// Validate an RFC 5987 `Content-Disposition` of the form
/// `filename*=UTF-8''<percent-encoded basename>`.
pub fn validate_content_disposition(value: &str) -> Result<(), HatracError> {
    let rest = value
        .strip_prefix("filename*=UTF-8''")
        .ok_or_else(|| {
            HatracError::BadRequest(
                "Content-Disposition must use the filename*=UTF-8'' form".to_string(),
            )
        })?;
    if rest.is_empty() {
        return Err(HatracError::BadRequest(
            "Content-Disposition filename is empty".to_string(),
        ));
    }

    // Decode the percent-encoded basename and reject separators.
    let decoded = percent_encoding::percent_decode_str(rest)
        .decode_utf8()
        .map_err(|_| {
            HatracError::BadRequest("Content-Disposition filename is not valid UTF-8".to_string())
        })?;
    if decoded.contains('/') || decoded.contains('\\') {
        return Err(HatracError::BadRequest(
            "Content-Disposition filename must not contain path separators".to_string(),
        ));
    }
    for c in rest.chars() {
        let ok = c.is_ascii_alphanumeric()
            || matches!(c, '-' | '.' | '_' | '~' | '%' | '!' | '$' | '&' | '+');
        if !ok {
            return Err(HatracError::BadRequest(format!(
                "illegal character {c:?} in Content-Disposition"
            )));
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────
