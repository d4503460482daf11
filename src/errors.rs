//! Service error taxonomy.
//!
//! Every failure a handler can produce is a variant of [`HatracError`],
//! mapped to an HTTP status at the response boundary. The enum implements
//! [`axum::response::IntoResponse`] with a plain-text rendering; the
//! dispatch layer upgrades that rendering through the configured error
//! templates and the request's `Accept` header via [`render_error`].

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::config::Config;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Closed sum of hatrac failure kinds.
#[derive(Debug, Error)]
pub enum HatracError {
    /// Malformed request: bad path syntax, bad digests, bad JSON.
    #[error("{0}")]
    BadRequest(String),

    /// Anonymous client attempted a restricted operation.
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated client lacks permission.
    #[error("{0}")]
    Forbidden(String),

    /// Name is undefined or deleted.
    #[error("{0}")]
    NotFound(String),

    /// Method is incompatible with the resolved resource kind.
    #[error("method not allowed on this resource")]
    MethodNotAllowed,

    /// Name-kind reuse, non-empty delete, immutable rewrite, and other
    /// state conflicts.
    #[error("{0}")]
    Conflict(String),

    /// If-Match / If-None-Match precondition failed.
    #[error("{0}")]
    PreconditionFailed(String),

    /// Payload exceeds `max_request_payload_size`.
    #[error("{0}")]
    PayloadTooLarge(String),

    /// Range start lies beyond the representation.
    #[error("requested range exceeds content of length {total}")]
    RangeNotSatisfiable { total: u64 },

    /// Recognized but unsupported feature (e.g. multi-range).
    #[error("{0}")]
    NotImplemented(String),

    /// Conditional GET short-circuit; carries the current ETag.
    #[error("not modified")]
    NotModified { etag: String },

    /// Catch-all for storage and directory faults; the client sees a
    /// redacted message.
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl HatracError {
    /// Short human title used in templated bodies.
    pub fn title(&self) -> &'static str {
        match self {
            HatracError::BadRequest(_) => "Bad Request",
            HatracError::Unauthorized(_) => "Unauthorized",
            HatracError::Forbidden(_) => "Forbidden",
            HatracError::NotFound(_) => "Not Found",
            HatracError::MethodNotAllowed => "Method Not Allowed",
            HatracError::Conflict(_) => "Conflict",
            HatracError::PreconditionFailed(_) => "Precondition Failed",
            HatracError::PayloadTooLarge(_) => "Request Entity Too Large",
            HatracError::RangeNotSatisfiable { .. } => "Requested Range Not Satisfiable",
            HatracError::NotImplemented(_) => "Not Implemented",
            HatracError::NotModified { .. } => "Not Modified",
            HatracError::Internal(_) => "Internal Server Error",
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            HatracError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HatracError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HatracError::Forbidden(_) => StatusCode::FORBIDDEN,
            HatracError::NotFound(_) => StatusCode::NOT_FOUND,
            HatracError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            HatracError::Conflict(_) => StatusCode::CONFLICT,
            HatracError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            HatracError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            HatracError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            HatracError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            HatracError::NotModified { .. } => StatusCode::NOT_MODIFIED,
            HatracError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-visible description. Internal faults are redacted here and
    /// logged at the boundary instead.
    pub fn description(&self) -> String {
        match self {
            HatracError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Content types we can negotiate error bodies into.
const NEGOTIABLE: &[&str] = &["text/plain", "text/html", "application/json"];

/// Pick the error body content type from an `Accept` header value.
///
/// Quality parameters are ignored; the first acceptable listed type wins,
/// with `text/plain` as the fallback.
fn negotiate_content_type(headers: &HeaderMap) -> &'static str {
    let accept = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*/*");
    for part in accept.split(',') {
        let mime = part.split(';').next().unwrap_or("").trim();
        if mime == "*/*" {
            return "text/plain";
        }
        for candidate in NEGOTIABLE {
            if mime == *candidate {
                return candidate;
            }
        }
    }
    "text/plain"
}

/// Interpolate `{code}`, `{title}` and `{description}` into a template.
fn interpolate(template: &str, code: u16, title: &str, description: &str) -> String {
    template
        .replace("{code}", &code.to_string())
        .replace("{title}", title)
        .replace("{description}", description)
}

/// Render an error against the configured templates and Accept header.
///
/// This is the full-fidelity rendering used by the dispatch layer; the
/// bare `IntoResponse` below is the template-less fallback.
pub fn render_error(config: &Config, headers: &HeaderMap, err: HatracError) -> Response {
    if let HatracError::Internal(ref cause) = err {
        tracing::error!("internal error: {cause:#}");
    }

    let status = err.status_code();

    // 304 must carry the ETag and no body.
    if let HatracError::NotModified { ref etag } = err {
        let mut response = status.into_response();
        if let Ok(v) = HeaderValue::from_str(etag) {
            response.headers_mut().insert("etag", v);
        }
        return response;
    }

    let code = status.as_u16();
    let title = err.title();
    let description = err.description();

    let wanted = negotiate_content_type(headers);
    let (content_type, body) = match config.error_template(code, wanted) {
        Some((ct, template)) => (ct, interpolate(&template, code, title, &description)),
        None => (
            "text/plain".to_string(),
            format!("{code} {title}: {description}\n"),
        ),
    };

    let mut response = (status, body).into_response();
    let hdrs = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&content_type) {
        hdrs.insert("content-type", v);
    }
    if let HatracError::RangeNotSatisfiable { total } = err {
        if let Ok(v) = HeaderValue::from_str(&format!("bytes */{total}")) {
            hdrs.insert("content-range", v);
        }
    }
    response
}

impl IntoResponse for HatracError {
    fn into_response(self) -> Response {
        if let HatracError::Internal(ref cause) = self {
            tracing::error!("internal error: {cause:#}");
        }

        let status = self.status_code();

        if let HatracError::NotModified { ref etag } = self {
            let mut response = status.into_response();
            if let Ok(v) = HeaderValue::from_str(etag) {
                response.headers_mut().insert("etag", v);
            }
            return response;
        }

        let body = format!(
            "{} {}: {}\n",
            status.as_u16(),
            self.title(),
            self.description()
        );
        (
            status,
            [("content-type", "text/plain".to_string())],
            body,
        )
            .into_response()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            HatracError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            HatracError::RangeNotSatisfiable { total: 10 }.status_code(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            HatracError::NotImplemented("x".into()).status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn internal_description_is_redacted() {
        let err = HatracError::Internal(anyhow::anyhow!("secret disk path /x/y"));
        assert_eq!(err.description(), "internal server error");
    }

    #[test]
    fn negotiation_prefers_listed_type() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "text/html,application/json".parse().unwrap());
        assert_eq!(negotiate_content_type(&headers), "text/html");

        let mut headers = HeaderMap::new();
        headers.insert("accept", "application/xml, */*".parse().unwrap());
        assert_eq!(negotiate_content_type(&headers), "text/plain");
    }

    #[test]
    fn template_interpolation() {
        let out = interpolate("<b>{code}</b> {title}: {description}", 404, "Not Found", "gone");
        assert_eq!(out, "<b>404</b> Not Found: gone");
    }

    #[test]
    fn templated_render_uses_config() {
        let config: Config = serde_json::from_str(
            r#"{"error_templates": {"404": {"text/html": "<h1>{title}</h1>"}}}"#,
        )
        .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("accept", "text/html".parse().unwrap());
        let resp = render_error(&config, &headers, HatracError::NotFound("nope".into()));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/html"
        );
    }
}
