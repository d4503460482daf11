//! Record types shared by the directory store and the handlers.

use serde::{Deserialize, Serialize};

use crate::authz::AclSet;

/// What kind of resource a name is (or was) bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Namespace,
    Object,
}

impl std::fmt::Display for NameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NameKind::Namespace => f.write_str("namespace"),
            NameKind::Object => f.write_str("object"),
        }
    }
}

/// Directory record for a namespace (an internal node).
#[derive(Debug, Clone)]
pub struct NamespaceRecord {
    pub id: i64,
    pub parent_id: Option<i64>,
    /// Full decoded path; `/` for the root.
    pub name: String,
    /// Monotonic counter bumped by ACL updates; feeds the ETag.
    pub update_seq: i64,
    pub acls: AclSet,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

impl NamespaceRecord {
    /// ETag token for namespace listing and ACL surfaces.
    pub fn etag_token(&self) -> String {
        format!("{}.{}", self.id, self.update_seq)
    }
}

/// Directory record for an object (a leaf holding versions).
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub id: i64,
    pub namespace_id: i64,
    /// Full decoded path.
    pub name: String,
    pub current_version_id: Option<i64>,
    pub update_seq: i64,
    pub acls: AclSet,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

impl ObjectRecord {
    /// ETag token for the object's ACL surface.
    pub fn etag_token(&self) -> String {
        format!("{}.{}", self.id, self.update_seq)
    }
}

/// Auxiliary serving overrides attached to a version, evaluated in
/// priority order: `rename_to`, `url`, `hname`/`hversion`, `version`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxRecord {
    /// `[name, version]` of a preferred version superseding this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename_to: Option<(String, String)>,

    /// Full URL of a remote service holding equivalent content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Override the name handed to the backend addressing function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hname: Option<String>,

    /// Override the version handed to the backend addressing function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hversion: Option<String>,

    /// Backend-level version id (e.g. an S3 versioned-bucket version).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl AuxRecord {
    pub fn is_empty(&self) -> bool {
        *self == AuxRecord::default()
    }
}

/// Content metadata carried by a version (and declared by upload jobs).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    #[serde(rename = "content-type", alias = "content_type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Base64 MD5 digest of the content.
    #[serde(rename = "content-md5", alias = "content_md5", default, skip_serializing_if = "Option::is_none")]
    pub content_md5: Option<String>,

    /// Base64 SHA-256 digest of the content.
    #[serde(rename = "content-sha256", alias = "content_sha256", default, skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,

    /// RFC 5987 `filename*=UTF-8''...` disposition.
    #[serde(rename = "content-disposition", alias = "content_disposition", default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
}

impl VersionMetadata {
    /// Read one field by its wire name.
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "content-type" => self.content_type.as_deref(),
            "content-md5" => self.content_md5.as_deref(),
            "content-sha256" => self.content_sha256.as_deref(),
            "content-disposition" => self.content_disposition.as_deref(),
            _ => None,
        }
    }

    pub const FIELDS: &'static [&'static str] = &[
        "content-type",
        "content-md5",
        "content-sha256",
        "content-disposition",
    ];

    /// Fields that may be rewritten after creation.
    pub const MUTABLE_FIELDS: &'static [&'static str] = &["content-type", "content-disposition"];
}

/// Directory record for an immutable content version.
#[derive(Debug, Clone)]
pub struct VersionRecord {
    pub id: i64,
    pub object_id: i64,
    /// Full decoded path of the owning object (join convenience).
    pub object_name: String,
    /// Opaque URL-safe version id.
    pub version_key: String,
    pub size: Option<i64>,
    pub metadata: VersionMetadata,
    pub update_seq: i64,
    pub acls: AclSet,
    pub aux: AuxRecord,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

impl VersionRecord {
    /// ETag token: the version id itself identifies the content state.
    pub fn etag_token(&self) -> &str {
        &self.version_key
    }
}

/// Directory record for an in-flight chunked upload job.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub id: i64,
    pub object_id: i64,
    /// Full decoded path of the target object (join convenience).
    pub object_name: String,
    pub job_key: String,
    pub chunk_length: i64,
    pub content_length: i64,
    pub metadata: VersionMetadata,
    pub owner_roles: Vec<String>,
    /// Backend-specific coordination handle (e.g. S3 multipart id).
    pub backend_handle: Option<String>,
    /// Per-position chunk aux values recorded by the backend.
    pub chunk_aux: std::collections::BTreeMap<u64, serde_json::Value>,
    pub created_at: String,
}

impl UploadRecord {
    /// Number of chunks the declared lengths imply.
    pub fn total_chunks(&self) -> u64 {
        if self.content_length == 0 {
            0
        } else {
            ((self.content_length as u64) + (self.chunk_length as u64) - 1)
                / self.chunk_length as u64
        }
    }

    /// Expected size of the chunk at `position`.
    pub fn expected_chunk_size(&self, position: u64) -> u64 {
        let total = self.total_chunks();
        let chunk = self.chunk_length as u64;
        if position + 1 < total {
            chunk
        } else {
            let rem = self.content_length as u64 % chunk;
            if rem == 0 {
                chunk
            } else {
                rem
            }
        }
    }
}

/// One entry in a shallow namespace listing.
#[derive(Debug, Clone)]
pub struct ChildEntry {
    /// Full decoded path.
    pub name: String,
    pub kind: NameKind,
}

/// The result of resolving a hierarchical name.
#[derive(Debug, Clone)]
pub struct ResolvedName {
    /// Live ancestor namespaces, root first. For the root itself this is
    /// empty and the binding is the root namespace.
    pub ancestors: Vec<NamespaceRecord>,
    pub binding: Binding,
}

/// What a name resolves to.
#[derive(Debug, Clone)]
pub enum Binding {
    Namespace(NamespaceRecord),
    Object(ObjectRecord),
    /// The name was bound and deleted; only the same kind may rebind it.
    Tombstone(NameKind),
    /// Never bound.
    Undefined,
}

impl ResolvedName {
    /// ACL chain (root → target) for authorization, namespaces and the
    /// bound resource inclusive.
    pub fn acl_chain(&self) -> Vec<&AclSet> {
        let mut chain: Vec<&AclSet> = self.ancestors.iter().map(|n| &n.acls).collect();
        match &self.binding {
            Binding::Namespace(ns) => chain.push(&ns.acls),
            Binding::Object(obj) => chain.push(&obj.acls),
            _ => {}
        }
        chain
    }

    /// ACL chain of the ancestors only (for create-child checks on the
    /// parent side, or version chains built by the caller).
    pub fn ancestor_chain(&self) -> Vec<&AclSet> {
        self.ancestors.iter().map(|n| &n.acls).collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────
