//! Conditional-request evaluation and Range parsing.
//!
//! Every mutable resource surface presents an ETag; `If-Match` and
//! `If-None-Match` gate writes and enable cache validation on reads.
//! Range handling supports a single `bytes=` range; multi-range requests
//! are recognized and declined.

use axum::http::HeaderMap;

use crate::errors::HatracError;

/// Wrap an opaque token in ETag quotes.
pub fn quote_etag(token: &str) -> String {
    format!("\"{token}\"")
}

/// Strip surrounding double quotes (and a weak prefix) for comparison.
fn strip_etag(etag: &str) -> &str {
    let etag = etag.trim();
    let etag = etag.strip_prefix("W/").unwrap_or(etag);
    if etag.len() >= 2 && etag.starts_with('"') && etag.ends_with('"') {
        &etag[1..etag.len() - 1]
    } else {
        etag
    }
}

/// Whether a comma-separated ETag list matches `current`. `*` matches
/// any existing representation.
fn list_matches(header: &str, current: Option<&str>) -> bool {
    for candidate in header.split(',') {
        let candidate = strip_etag(candidate);
        if candidate == "*" {
            if current.is_some() {
                return true;
            }
            continue;
        }
        if Some(candidate) == current {
            return true;
        }
    }
    false
}

/// Evaluate `If-Match` / `If-None-Match` against the current ETag.
///
/// `current` is `None` when the resource has no representation (e.g. an
/// object with no live version), which is exactly what lets
/// `If-None-Match: *` guard creation. `is_read` selects the 304 path for
/// GET/HEAD; writes fail preconditions with 412.
pub fn evaluate_preconditions(
    headers: &HeaderMap,
    current: Option<&str>,
    is_read: bool,
) -> Result<(), HatracError> {
    if let Some(if_match) = headers.get("if-match").and_then(|v| v.to_str().ok()) {
        if !list_matches(if_match, current) {
            return Err(HatracError::PreconditionFailed(
                "If-Match condition failed".to_string(),
            ));
        }
    }

    if let Some(if_none) = headers.get("if-none-match").and_then(|v| v.to_str().ok()) {
        if list_matches(if_none, current) {
            if is_read {
                let etag = current.map(quote_etag).unwrap_or_default();
                return Err(HatracError::NotModified { etag });
            }
            return Err(HatracError::PreconditionFailed(
                "If-None-Match condition failed".to_string(),
            ));
        }
    }

    Ok(())
}

// -- Range parsing ------------------------------------------------------------

/// Parsed byte range from a Range header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteRange {
    /// bytes=start-end (inclusive both ends)
    StartEnd(u64, u64),
    /// bytes=start-  (from start to end of representation)
    StartOpen(u64),
    /// bytes=-N  (last N bytes)
    Suffix(u64),
}

/// Outcome of parsing a Range header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeSpec {
    /// One well-formed range.
    Single(ByteRange),
    /// Multiple ranges; recognized but unsupported.
    Multi,
    /// Not a parseable bytes range; serve the full representation.
    Malformed,
}

/// Parse a Range header value like `bytes=0-4`, `bytes=5-`, `bytes=-3`.
pub fn parse_range(header: &str) -> RangeSpec {
    let header = header.trim();
    let spec = match header.strip_prefix("bytes=") {
        Some(s) => s,
        None => return RangeSpec::Malformed,
    };

    if spec.contains(',') {
        return RangeSpec::Multi;
    }

    if let Some(suffix) = spec.strip_prefix('-') {
        match suffix.parse::<u64>() {
            Ok(n) if n > 0 => RangeSpec::Single(ByteRange::Suffix(n)),
            _ => RangeSpec::Malformed,
        }
    } else if let Some(stripped) = spec.strip_suffix('-') {
        match stripped.parse::<u64>() {
            Ok(start) => RangeSpec::Single(ByteRange::StartOpen(start)),
            _ => RangeSpec::Malformed,
        }
    } else if let Some((start_s, end_s)) = spec.split_once('-') {
        match (start_s.parse::<u64>(), end_s.parse::<u64>()) {
            (Ok(start), Ok(end)) if start <= end => {
                RangeSpec::Single(ByteRange::StartEnd(start, end))
            }
            _ => RangeSpec::Malformed,
        }
    } else {
        RangeSpec::Malformed
    }
}

/// Resolve a ByteRange against a total length. Returns inclusive
/// `(start, end)`, or `None` when unsatisfiable (416).
pub fn resolve_range(range: &ByteRange, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    match range {
        ByteRange::StartEnd(start, end) => {
            if *start >= total {
                return None;
            }
            Some((*start, (*end).min(total - 1)))
        }
        ByteRange::StartOpen(start) => {
            if *start >= total {
                return None;
            }
            Some((*start, total - 1))
        }
        ByteRange::Suffix(n) => {
            if *n >= total {
                Some((0, total - 1))
            } else {
                Some((total - n, total - 1))
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn if_match_requires_equality() {
        let mut headers = HeaderMap::new();
        headers.insert("if-match", "\"abc\"".parse().unwrap());
        assert!(evaluate_preconditions(&headers, Some("abc"), false).is_ok());
        assert!(matches!(
            evaluate_preconditions(&headers, Some("def"), false),
            Err(HatracError::PreconditionFailed(_))
        ));
        assert!(matches!(
            evaluate_preconditions(&headers, None, false),
            Err(HatracError::PreconditionFailed(_))
        ));
    }

    #[test]
    fn if_match_star_requires_existence() {
        let mut headers = HeaderMap::new();
        headers.insert("if-match", "*".parse().unwrap());
        assert!(evaluate_preconditions(&headers, Some("abc"), false).is_ok());
        assert!(evaluate_preconditions(&headers, None, false).is_err());
    }

    #[test]
    fn if_none_match_star_guards_creation() {
        let mut headers = HeaderMap::new();
        headers.insert("if-none-match", "*".parse().unwrap());
        assert!(evaluate_preconditions(&headers, None, false).is_ok());
        assert!(matches!(
            evaluate_preconditions(&headers, Some("abc"), false),
            Err(HatracError::PreconditionFailed(_))
        ));
    }

    #[test]
    fn if_none_match_read_returns_304() {
        let mut headers = HeaderMap::new();
        headers.insert("if-none-match", "\"abc\"".parse().unwrap());
        match evaluate_preconditions(&headers, Some("abc"), true) {
            Err(HatracError::NotModified { etag }) => assert_eq!(etag, "\"abc\""),
            other => panic!("expected NotModified, got {other:?}"),
        }
        // Mismatch: serve normally.
        assert!(evaluate_preconditions(&headers, Some("def"), true).is_ok());
    }

    #[test]
    fn etag_list_with_multiple_candidates() {
        let mut headers = HeaderMap::new();
        headers.insert("if-match", "\"x\", \"y\"".parse().unwrap());
        assert!(evaluate_preconditions(&headers, Some("y"), false).is_ok());
        assert!(evaluate_preconditions(&headers, Some("z"), false).is_err());
    }

    #[test]
    fn range_parse_forms() {
        assert_eq!(
            parse_range("bytes=5-10"),
            RangeSpec::Single(ByteRange::StartEnd(5, 10))
        );
        assert_eq!(
            parse_range("bytes=5-"),
            RangeSpec::Single(ByteRange::StartOpen(5))
        );
        assert_eq!(
            parse_range("bytes=-4"),
            RangeSpec::Single(ByteRange::Suffix(4))
        );
        assert_eq!(parse_range("bytes=1-2,3-5"), RangeSpec::Multi);
        assert_eq!(parse_range("octets=1-2"), RangeSpec::Malformed);
        assert_eq!(parse_range("bytes=9-2"), RangeSpec::Malformed);
        assert_eq!(parse_range("bytes=-0"), RangeSpec::Malformed);
    }

    #[test]
    fn range_resolution() {
        // 14-byte body, per the canonical round-trip scenario.
        assert_eq!(resolve_range(&ByteRange::StartEnd(5, 10), 14), Some((5, 10)));
        assert_eq!(resolve_range(&ByteRange::Suffix(4), 14), Some((10, 13)));
        assert_eq!(resolve_range(&ByteRange::StartOpen(900_000), 14), None);
        assert_eq!(resolve_range(&ByteRange::StartEnd(10, 100), 14), Some((10, 13)));
        assert_eq!(resolve_range(&ByteRange::Suffix(50), 14), Some((0, 13)));
        assert_eq!(resolve_range(&ByteRange::StartEnd(0, 0), 0), None);
    }
}
