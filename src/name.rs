//! Hierarchical name codec.
//!
//! Hatrac paths treat `/`, `:` and `;` as meta-syntax: `/` separates
//! segments, a trailing `;token[/selector...]` addresses a sub-resource,
//! and `:version` on the last name segment addresses a single version.
//! Segment payloads are drawn from a configurable safe character class
//! plus percent-encoded UTF-8 octets.

use crate::errors::HatracError;

/// Default segment character class (matches the service configuration
/// default `[-._~A-Za-z0-9]`).
pub const DEFAULT_CHAR_CLASS: &str = "[-._~A-Za-z0-9]";

/// A set of bytes permitted to appear raw (unescaped) in a path segment.
///
/// Built from a `[...]`-style character-class string. `%` and the three
/// meta characters are never members regardless of configuration.
#[derive(Debug, Clone)]
pub struct SegmentClass {
    allowed: [bool; 256],
}

impl SegmentClass {
    /// Parse a character-class string like `[-._~A-Za-z0-9]`.
    ///
    /// Supports literal ASCII characters and `a-z` ranges. A leading `-`
    /// (immediately after `[`) is literal, as in regular expressions.
    pub fn parse(class: &str) -> Result<Self, HatracError> {
        let inner = class
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(class);

        let mut allowed = [false; 256];
        let chars: Vec<char> = inner.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if !c.is_ascii() {
                return Err(HatracError::BadRequest(format!(
                    "non-ASCII character {c:?} in URL character class"
                )));
            }
            // Range form `a-z`; a bare `-` is literal.
            if c != '-' && i + 2 < chars.len() && chars[i + 1] == '-' {
                let lo = c as usize;
                let hi = chars[i + 2] as usize;
                if lo > hi {
                    return Err(HatracError::BadRequest(format!(
                        "inverted range {}-{} in URL character class",
                        chars[i], chars[i + 2]
                    )));
                }
                for b in lo..=hi {
                    allowed[b] = true;
                }
                i += 3;
                continue;
            }
            allowed[c as usize] = true;
            i += 1;
        }

        // Meta-syntax and the escape character can never be literal.
        for reserved in [b'/', b':', b';', b'%'] {
            allowed[reserved as usize] = false;
        }

        Ok(Self { allowed })
    }

    /// Whether `b` may appear unescaped in a segment.
    pub fn contains(&self, b: u8) -> bool {
        self.allowed[b as usize]
    }

    /// Percent-encode a decoded segment for use in URLs and listings.
    pub fn encode(&self, segment: &str) -> String {
        let mut out = String::with_capacity(segment.len());
        for &b in segment.as_bytes() {
            if self.contains(b) {
                out.push(b as char);
            } else {
                out.push_str(&format!("%{b:02X}"));
            }
        }
        out
    }

    /// Validate the raw (still-encoded) text of one segment and decode it.
    ///
    /// Every byte must be a class member or part of a `%XX` escape, and
    /// the decoded octets must form valid UTF-8.
    pub fn decode(&self, raw: &str) -> Result<String, HatracError> {
        let bytes = raw.as_bytes();
        let mut decoded: Vec<u8> = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if b == b'%' {
                if i + 3 > bytes.len() {
                    return Err(HatracError::BadRequest(format!(
                        "truncated percent escape in segment {raw:?}"
                    )));
                }
                let hi = hex_val(bytes[i + 1]);
                let lo = hex_val(bytes[i + 2]);
                match (hi, lo) {
                    (Some(h), Some(l)) => decoded.push(h << 4 | l),
                    _ => {
                        return Err(HatracError::BadRequest(format!(
                            "malformed percent escape in segment {raw:?}"
                        )))
                    }
                }
                i += 3;
            } else if self.contains(b) {
                decoded.push(b);
                i += 1;
            } else {
                return Err(HatracError::BadRequest(format!(
                    "illegal character {:?} in segment {raw:?}",
                    b as char
                )));
            }
        }
        String::from_utf8(decoded).map_err(|_| {
            HatracError::BadRequest(format!("segment {raw:?} is not valid UTF-8"))
        })
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// A resolved hierarchical name: decoded segments, root = empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamePath {
    segments: Vec<String>,
}

impl NamePath {
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    pub fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Final segment, if any.
    pub fn leaf(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    /// The parent path (root's parent is root).
    pub fn parent(&self) -> NamePath {
        let mut segments = self.segments.clone();
        segments.pop();
        NamePath { segments }
    }

    /// Canonical decoded form: `/a/b/c`, `/` for the root.
    pub fn to_string_lossless(&self) -> String {
        if self.segments.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", self.segments.join("/"))
        }
    }

    /// Canonical encoded form for URLs and uri-list output.
    pub fn encode(&self, class: &SegmentClass) -> String {
        if self.segments.is_empty() {
            "/".to_string()
        } else {
            let encoded: Vec<String> = self.segments.iter().map(|s| class.encode(s)).collect();
            format!("/{}", encoded.join("/"))
        }
    }

    /// Reject segments that would traverse or alias a parent. Applied on
    /// name-creation paths only; resolution of existing names never
    /// traverses upward by construction.
    pub fn validate_for_creation(&self) -> Result<(), HatracError> {
        for seg in &self.segments {
            if seg.is_empty() {
                return Err(HatracError::BadRequest(
                    "empty path segment".to_string(),
                ));
            }
            if seg == "." || seg == ".." {
                return Err(HatracError::BadRequest(format!(
                    "illegal path segment {seg:?}"
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for NamePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string_lossless())
    }
}

/// A parsed sub-resource selector (the `;token[/selector...]` suffix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubResource {
    /// `;versions` — version listing of an object.
    Versions,
    /// `;metadata[/field]` — metadata collection or one field.
    Metadata { field: Option<String> },
    /// `;acl[/access[/entry]]` — ACL collection, one list, or one entry.
    Acl {
        access: Option<String>,
        entry: Option<String>,
    },
    /// `;upload[/job[/chunk]]` — upload collection, one job, or one chunk.
    Upload {
        job: Option<String>,
        chunk: Option<u64>,
    },
}

/// A fully parsed request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub name: NamePath,
    pub version: Option<String>,
    pub subresource: Option<SubResource>,
}

impl ResourceRef {
    pub fn is_version(&self) -> bool {
        self.version.is_some()
    }
}

/// Parse the request path (with the service prefix already stripped,
/// leading `/` optional) into a [`ResourceRef`].
pub fn parse_path(path: &str, class: &SegmentClass) -> Result<ResourceRef, HatracError> {
    let path = path.strip_prefix('/').unwrap_or(path);

    // Split on raw `/` only; escaped slashes stay inside their segment.
    let mut raw_segments: Vec<&str> = if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    };

    // A single trailing slash addresses the same resource.
    if raw_segments.last() == Some(&"") {
        raw_segments.pop();
    }

    // Detach the `;subresource` suffix: it begins inside some segment and
    // consumes all following segments as selectors.
    let mut subresource: Option<SubResource> = None;
    let mut name_end = raw_segments.len();
    for (i, raw) in raw_segments.iter().enumerate() {
        if let Some(semi) = raw.find(';') {
            let (head, token) = raw.split_at(semi);
            let token = &token[1..];
            let selectors = &raw_segments[i + 1..];
            subresource = Some(parse_subresource(token, selectors, class)?);
            raw_segments[i] = head;
            name_end = i + 1;
            break;
        }
    }
    raw_segments.truncate(name_end);

    // Split the last name segment on `:version`.
    let mut version: Option<String> = None;
    if let Some(last) = raw_segments.last_mut() {
        if let Some(colon) = last.find(':') {
            let (head, ver) = last.split_at(colon);
            let ver = &ver[1..];
            if ver.is_empty() {
                return Err(HatracError::BadRequest(
                    "empty version identifier".to_string(),
                ));
            }
            version = Some(class.decode(ver)?);
            *last = head;
        }
    }

    // Drop an empty final segment left behind by `/;upload` style suffixes
    // on the root, then decode.
    if raw_segments.last() == Some(&"") {
        raw_segments.pop();
    }

    let mut segments = Vec::with_capacity(raw_segments.len());
    for raw in &raw_segments {
        if raw.is_empty() {
            return Err(HatracError::BadRequest("empty path segment".to_string()));
        }
        segments.push(class.decode(raw)?);
    }

    if version.is_some() && segments.is_empty() {
        return Err(HatracError::BadRequest(
            "version qualifier requires an object name".to_string(),
        ));
    }

    Ok(ResourceRef {
        name: NamePath::from_segments(segments),
        version,
        subresource,
    })
}

fn parse_subresource(
    token: &str,
    selectors: &[&str],
    class: &SegmentClass,
) -> Result<SubResource, HatracError> {
    let decode_sel = |raw: &str| -> Result<String, HatracError> {
        if raw.contains(';') || raw.contains(':') {
            return Err(HatracError::BadRequest(format!(
                "illegal character in sub-resource selector {raw:?}"
            )));
        }
        class.decode(raw)
    };

    match token {
        "versions" => {
            if !selectors.is_empty() {
                return Err(HatracError::BadRequest(
                    "the versions sub-resource takes no selector".to_string(),
                ));
            }
            Ok(SubResource::Versions)
        }
        "metadata" => match selectors {
            [] => Ok(SubResource::Metadata { field: None }),
            [field] => Ok(SubResource::Metadata {
                field: Some(decode_sel(field)?),
            }),
            _ => Err(HatracError::BadRequest(
                "too many metadata selectors".to_string(),
            )),
        },
        "acl" => match selectors {
            [] => Ok(SubResource::Acl {
                access: None,
                entry: None,
            }),
            [access] => Ok(SubResource::Acl {
                access: Some(decode_sel(access)?),
                entry: None,
            }),
            [access, entry] => Ok(SubResource::Acl {
                access: Some(decode_sel(access)?),
                entry: Some(decode_sel(entry)?),
            }),
            _ => Err(HatracError::BadRequest(
                "too many ACL selectors".to_string(),
            )),
        },
        "upload" => match selectors {
            [] => Ok(SubResource::Upload {
                job: None,
                chunk: None,
            }),
            [job] => Ok(SubResource::Upload {
                job: Some(decode_sel(job)?),
                chunk: None,
            }),
            [job, chunk] => {
                // Negative positions are malformed, not merely out of range.
                if chunk.starts_with('-') {
                    return Err(HatracError::BadRequest(format!(
                        "negative chunk position {chunk:?}"
                    )));
                }
                let parsed: u64 = chunk.parse().map_err(|_| {
                    HatracError::BadRequest(format!("malformed chunk position {chunk:?}"))
                })?;
                Ok(SubResource::Upload {
                    job: Some(decode_sel(job)?),
                    chunk: Some(parsed),
                })
            }
            _ => Err(HatracError::BadRequest(
                "too many upload selectors".to_string(),
            )),
        },
        other => Err(HatracError::BadRequest(format!(
            "unknown sub-resource {other:?}"
        ))),
    }
}

// ── Tests ───────────────────────────────────────────────────────────
