//! Hatrac library — hierarchical object store with referentially
//! stable versioned names.
//!
//! This crate provides the core components for running the service:
//! the URL codec, the transactional directory, pluggable bulk-storage
//! backends, the authorization engine, and the REST request handlers.

use std::sync::Arc;

pub mod authn;
pub mod authz;
pub mod conditional;
pub mod config;
pub mod directory;
pub mod errors;
pub mod handlers;
pub mod name;
pub mod server;
pub mod storage;

use crate::config::Config;
use crate::directory::sqlite::SqliteDirectory;
use crate::name::SegmentClass;
use crate::storage::backend::StorageBackend;

/// Shared application state passed to all handlers via
/// `axum::extract::State`.
pub struct AppState {
    /// Service configuration, immutable after load.
    pub config: Config,
    /// Segment character class compiled from configuration.
    pub class: SegmentClass,
    /// The directory: authoritative structure and metadata.
    pub directory: Arc<SqliteDirectory>,
    /// Bulk-byte storage backend.
    pub storage: Arc<dyn StorageBackend>,
    /// Authentication adapter supplying client identity and roles.
    pub authn: Arc<dyn authn::Provider>,
}
