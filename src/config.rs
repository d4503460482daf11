//! Configuration loading and types.
//!
//! Configuration is read from a JSON document and deserialized into the
//! [`Config`] struct. Each subsection governs a different part of the
//! system: networking, the directory database, access-control firewalls,
//! bulk storage, and error-body templates. The loaded value is immutable
//! for the lifetime of the process; handlers read it through shared state.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Service-wide firewall actions gated by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallAction {
    Create,
    Delete,
    ManageAcls,
    ManageMetadata,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// URL prefix under which all resources are served.
    #[serde(default = "default_service_prefix")]
    pub service_prefix: String,

    /// Path to the SQLite directory database.
    #[serde(default = "default_database_path", alias = "database_dsn")]
    pub database_path: String,

    /// Transaction replay bound for directory write contention.
    #[serde(default = "default_database_max_retries")]
    pub database_max_retries: u32,

    /// Character class allowed raw (unescaped) in path segments.
    #[serde(default = "default_url_char_class")]
    pub allowed_url_char_class: String,

    /// Maximum accepted request payload in bytes (default 128 MiB).
    #[serde(default = "default_max_payload")]
    pub max_request_payload_size: u64,

    /// Service-wide ACLs applied in addition to resource ACLs.
    #[serde(default)]
    pub firewall_acls: FirewallAcls,

    /// When set, firewall defaults flip from `["*"]` to `[]`, denying
    /// all mutation unless explicitly granted.
    #[serde(default)]
    pub read_only: bool,

    /// Storage backend selector: `filesystem`, `amazons3`, or `overlay`.
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,

    /// Root directory for the filesystem backend.
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    /// S3 backend configuration (required when `storage_backend` is
    /// `amazons3` or an overlay layer names it).
    #[serde(default)]
    pub s3_config: Option<S3Config>,

    /// Overlay composition (required when `storage_backend` is `overlay`).
    #[serde(default)]
    pub overlay: Option<OverlayConfig>,

    /// Error-body templates keyed by status code, then content type.
    /// Legacy `<code>_html` / `<code>_plain` string entries are accepted.
    #[serde(default)]
    pub error_templates: HashMap<String, serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialize")
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Firewall ACL lists. `None` means "use the service default", which is
/// `["*"]` normally and `[]` under `read_only`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FirewallAcls {
    #[serde(default)]
    pub create: Option<Vec<String>>,
    #[serde(default)]
    pub delete: Option<Vec<String>>,
    #[serde(default)]
    pub manage_acls: Option<Vec<String>>,
    #[serde(default)]
    pub manage_metadata: Option<Vec<String>>,
}

impl Config {
    /// Effective firewall ACL for an action.
    pub fn firewall_acl(&self, action: FirewallAction) -> Vec<String> {
        let configured = match action {
            FirewallAction::Create => &self.firewall_acls.create,
            FirewallAction::Delete => &self.firewall_acls.delete,
            FirewallAction::ManageAcls => &self.firewall_acls.manage_acls,
            FirewallAction::ManageMetadata => &self.firewall_acls.manage_metadata,
        };
        match configured {
            Some(list) => list.clone(),
            None if self.read_only => Vec::new(),
            None => vec!["*".to_string()],
        }
    }

    /// Look up an error template for `(code, content_type)`.
    ///
    /// Resolution order: exact content type under the code's map, the
    /// map's `default` entry, then legacy `<code>_html` / `<code>_plain`
    /// string entries.
    pub fn error_template(&self, code: u16, content_type: &str) -> Option<(String, String)> {
        let key = code.to_string();
        if let Some(serde_json::Value::Object(map)) = self.error_templates.get(&key) {
            if let Some(serde_json::Value::String(t)) = map.get(content_type) {
                return Some((content_type.to_string(), t.clone()));
            }
            if let Some(serde_json::Value::String(t)) = map.get("default") {
                return Some(("text/plain".to_string(), t.clone()));
            }
        }
        // Legacy shorthand keys.
        let legacy = match content_type {
            "text/html" => format!("{key}_html"),
            _ => format!("{key}_plain"),
        };
        if let Some(serde_json::Value::String(t)) = self.error_templates.get(&legacy) {
            let ct = if legacy.ends_with("_html") {
                "text/html"
            } else {
                "text/plain"
            };
            return Some((ct.to_string(), t.clone()));
        }
        None
    }
}

/// S3 backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Session hints shared by all buckets.
    #[serde(default)]
    pub default_session: Option<S3SessionConfig>,

    /// Bucket routing table: longest matching name prefix wins.
    #[serde(default)]
    pub buckets: HashMap<String, S3BucketConfig>,
}

/// Session settings for the AWS client.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct S3SessionConfig {
    /// AWS region (falls back to the environment / profile chain).
    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3-compatible endpoint (e.g. MinIO).
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
}

/// Per-prefix S3 bucket routing entry.
#[derive(Debug, Clone, Deserialize)]
pub struct S3BucketConfig {
    /// Backing bucket name.
    pub bucket_name: String,

    /// Key prefix inside the bucket.
    #[serde(default)]
    pub bucket_path_prefix: String,

    /// Key naming scheme: `hname` (name only) or `hname:hver`
    /// (name + backend version suffix).
    #[serde(default = "default_s3_method")]
    pub hatrac_s3_method: String,

    /// Store keys with percent-escapes removed.
    #[serde(default)]
    pub unquote_object_keys: bool,

    /// Redirect GETs through presigned URLs for payloads at or above
    /// this size. `None` disables presigned redirection.
    #[serde(default)]
    pub presigned_url_threshold: Option<u64>,

    /// Presigned URL lifetime in seconds.
    #[serde(default = "default_presign_expiration")]
    pub presigned_url_expiration_secs: u64,

    /// Treat the bucket as versioned: capture the S3 version id of each
    /// write into the version's aux record.
    #[serde(default)]
    pub versioned: bool,

    /// Per-bucket session overrides.
    #[serde(default)]
    pub session_config: Option<S3SessionConfig>,
}

/// Overlay backend composition: reads fall through primary → secondary,
/// writes go to the primary. Layer names are backend selectors
/// (`filesystem` or `amazons3`).
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    pub primary: String,
    pub secondary: String,
}

// -- Defaults ----------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_service_prefix() -> String {
    "/hatrac".to_string()
}

fn default_database_path() -> String {
    "./data/hatrac.db".to_string()
}

fn default_database_max_retries() -> u32 {
    5
}

fn default_url_char_class() -> String {
    crate::name::DEFAULT_CHAR_CLASS.to_string()
}

fn default_max_payload() -> u64 {
    128 * 1024 * 1024
}

fn default_storage_backend() -> String {
    "filesystem".to_string()
}

fn default_storage_path() -> String {
    "./data/storage".to_string()
}

fn default_s3_method() -> String {
    "hname:hver".to_string()
}

fn default_presign_expiration() -> u64 {
    300
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a JSON file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_json::from_str(&contents)?;
    Ok(config)
}

// ── Tests ───────────────────────────────────────────────────────────
