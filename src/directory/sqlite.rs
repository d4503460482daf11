//! SQLite-backed directory.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required. The connection sits behind a `Mutex`; every
//! mutating operation runs as one transaction and is replayed with
//! exponential backoff when the database reports contention, up to the
//! configured retry bound. Callers therefore never see transient
//! busy/locked failures.
//!
//! Deleted names stay behind as tombstone rows so a name can never be
//! rebound to a different kind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};

use crate::authz::{AclKind, AclSet};
use crate::errors::HatracError;
use crate::name::NamePath;

use super::records::{
    AuxRecord, Binding, ChildEntry, NameKind, NamespaceRecord, ObjectRecord, ResolvedName,
    UploadRecord, VersionMetadata, VersionRecord,
};

/// Internal transaction error: either retryable contention or a final
/// service error.
enum TxnError {
    Busy,
    Fail(HatracError),
}

impl From<rusqlite::Error> for TxnError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &err {
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) {
                return TxnError::Busy;
            }
        }
        TxnError::Fail(HatracError::Internal(anyhow::Error::new(err)))
    }
}

impl From<HatracError> for TxnError {
    fn from(err: HatracError) -> Self {
        TxnError::Fail(err)
    }
}

/// An ACL mutation applied by the ACL sub-resource handler.
#[derive(Debug, Clone)]
pub enum AclUpdate {
    ReplaceList(BTreeSet<String>),
    InsertEntry(String),
    ClearList,
    RemoveEntry(String),
}

/// Directory of namespaces, objects, versions and upload jobs, backed by
/// a single SQLite database file.
pub struct SqliteDirectory {
    conn: Mutex<Connection>,
    max_retries: u32,
}

impl SqliteDirectory {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (tests).
    pub fn open(path: &str, max_retries: u32) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let dir = Self {
            conn: Mutex::new(conn),
            max_retries,
        };
        dir.apply_pragmas()?;
        dir.init_db()?;
        Ok(dir)
    }

    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create tables and indexes if absent. Idempotent on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            -- Namespaces (internal nodes); the root row has parent_id NULL.
            CREATE TABLE IF NOT EXISTS namespace (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id   INTEGER REFERENCES namespace(id),
                name        TEXT NOT NULL UNIQUE,
                update_seq  INTEGER NOT NULL DEFAULT 0,
                acls        TEXT NOT NULL DEFAULT '{}',
                created_at  TEXT NOT NULL,
                deleted_at  TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_namespace_parent
                ON namespace(parent_id);

            -- Objects (leaves holding versions).
            CREATE TABLE IF NOT EXISTS object (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                namespace_id        INTEGER NOT NULL REFERENCES namespace(id),
                name                TEXT NOT NULL UNIQUE,
                current_version_id  INTEGER,
                update_seq          INTEGER NOT NULL DEFAULT 0,
                acls                TEXT NOT NULL DEFAULT '{}',
                created_at          TEXT NOT NULL,
                deleted_at          TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_object_namespace
                ON object(namespace_id);

            -- Immutable content versions.
            CREATE TABLE IF NOT EXISTS version (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                object_id           INTEGER NOT NULL REFERENCES object(id),
                version_key         TEXT NOT NULL,
                size                INTEGER,
                content_type        TEXT,
                content_md5         TEXT,
                content_sha256      TEXT,
                content_disposition TEXT,
                update_seq          INTEGER NOT NULL DEFAULT 0,
                acls                TEXT NOT NULL DEFAULT '{}',
                aux                 TEXT,
                created_at          TEXT NOT NULL,
                deleted_at          TEXT,

                UNIQUE (object_id, version_key)
            );

            CREATE INDEX IF NOT EXISTS idx_version_object
                ON version(object_id);

            -- Chunked upload jobs; terminal transitions delete the row.
            CREATE TABLE IF NOT EXISTS upload (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                object_id       INTEGER NOT NULL REFERENCES object(id),
                job_key         TEXT NOT NULL UNIQUE,
                chunk_length    INTEGER NOT NULL,
                content_length  INTEGER NOT NULL,
                metadata        TEXT NOT NULL DEFAULT '{}',
                owner_roles     TEXT NOT NULL DEFAULT '[]',
                backend_handle  TEXT,
                chunk_aux       TEXT NOT NULL DEFAULT '{}',
                created_at      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_upload_object
                ON upload(object_id);
            ",
        )?;
        Ok(())
    }

    /// Initialize the root namespace with the given owner roles.
    /// Idempotent: an existing root is left untouched.
    pub fn deploy(&self, admin_roles: &[String]) -> Result<(), HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM namespace WHERE parent_id IS NULL",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_none() {
                let mut acls = AclSet::initial_owner(admin_roles);
                acls.set("subtree-owner", admin_roles.iter().cloned().collect());
                tx.execute(
                    "INSERT INTO namespace (parent_id, name, acls, created_at)
                     VALUES (NULL, '/', ?1, ?2)",
                    params![acl_json(&acls), now()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Run `f` against the connection, replaying on contention with
    /// exponential backoff up to the retry bound.
    fn run<T, F>(&self, mut f: F) -> Result<T, HatracError>
    where
        F: FnMut(&Connection) -> Result<T, TxnError>,
    {
        let mut delay = Duration::from_millis(10);
        let mut attempt = 0u32;
        loop {
            let result = {
                let conn = self.conn.lock().expect("mutex poisoned");
                f(&conn)
            };
            match result {
                Ok(value) => return Ok(value),
                Err(TxnError::Busy) if attempt < self.max_retries => {
                    tracing::debug!(attempt, "directory transaction contention, retrying");
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(TxnError::Busy) => {
                    return Err(HatracError::Internal(anyhow::anyhow!(
                        "directory transaction failed after {} retries",
                        self.max_retries
                    )))
                }
                Err(TxnError::Fail(err)) => return Err(err),
            }
        }
    }

    // ── Name resolution ─────────────────────────────────────────────

    /// Resolve a hierarchical name to its binding and live ancestor
    /// chain. Each step is scoped to the parent id, so resolution never
    /// traverses outside the tree.
    pub fn resolve(&self, path: &NamePath) -> Result<ResolvedName, HatracError> {
        self.run(|conn| Ok(resolve_in(conn, path)?))
    }

    // ── Namespaces ──────────────────────────────────────────────────

    /// Bind `path` as a namespace. With `parents`, missing ancestors are
    /// created (and tombstoned namespace ancestors revived). Returns the
    /// new record and whether a tombstone was restored.
    pub fn create_namespace(
        &self,
        path: &NamePath,
        parents: bool,
        owner_roles: &[String],
    ) -> Result<(NamespaceRecord, bool), HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            let record = create_namespace_in(&tx, path, parents, owner_roles)?;
            tx.commit()?;
            Ok(record)
        })
    }

    /// Live children of a namespace, shallow, sorted by name.
    pub fn enumerate_children(&self, namespace_id: i64) -> Result<Vec<ChildEntry>, HatracError> {
        self.run(|conn| {
            let mut entries: Vec<ChildEntry> = Vec::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT name FROM namespace
                     WHERE parent_id = ?1 AND deleted_at IS NULL",
                )?;
                let rows = stmt.query_map(params![namespace_id], |row| row.get::<_, String>(0))?;
                for name in rows {
                    entries.push(ChildEntry {
                        name: name?,
                        kind: NameKind::Namespace,
                    });
                }
            }
            {
                let mut stmt = conn.prepare(
                    "SELECT name FROM object
                     WHERE namespace_id = ?1 AND deleted_at IS NULL",
                )?;
                let rows = stmt.query_map(params![namespace_id], |row| row.get::<_, String>(0))?;
                for name in rows {
                    entries.push(ChildEntry {
                        name: name?,
                        kind: NameKind::Object,
                    });
                }
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(entries)
        })
    }

    /// Tombstone an empty namespace. The root cannot be deleted.
    pub fn delete_namespace(&self, namespace_id: i64) -> Result<(), HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;

            let parent: Option<Option<i64>> = tx
                .query_row(
                    "SELECT parent_id FROM namespace
                     WHERE id = ?1 AND deleted_at IS NULL",
                    params![namespace_id],
                    |row| row.get(0),
                )
                .optional()?;
            match parent {
                None => return Err(HatracError::NotFound("no such namespace".into()).into()),
                Some(None) => {
                    return Err(
                        HatracError::Conflict("the root namespace cannot be deleted".into()).into(),
                    )
                }
                Some(Some(_)) => {}
            }

            let live_children: i64 = tx.query_row(
                "SELECT
                   (SELECT COUNT(*) FROM namespace
                     WHERE parent_id = ?1 AND deleted_at IS NULL)
                 + (SELECT COUNT(*) FROM object
                     WHERE namespace_id = ?1 AND deleted_at IS NULL)",
                params![namespace_id],
                |row| row.get(0),
            )?;
            if live_children > 0 {
                return Err(HatracError::Conflict("namespace is not empty".into()).into());
            }

            tx.execute(
                "UPDATE namespace SET deleted_at = ?2 WHERE id = ?1",
                params![namespace_id, now()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    // ── Objects ─────────────────────────────────────────────────────

    /// Bind `path` as an object under an existing live parent namespace,
    /// or revive a tombstoned object of the same name. Returns the record
    /// and whether it was restored.
    pub fn create_object(
        &self,
        path: &NamePath,
        owner_roles: &[String],
    ) -> Result<(ObjectRecord, bool), HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            let result = create_object_in(&tx, path, owner_roles)?;
            tx.commit()?;
            Ok(result)
        })
    }

    pub fn get_object(&self, object_id: i64) -> Result<Option<ObjectRecord>, HatracError> {
        self.run(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {OBJECT_COLS} FROM object WHERE id = ?1"),
                    params![object_id],
                    object_from_row,
                )
                .optional()?)
        })
    }

    /// Tombstone an object with all its versions and delete its upload
    /// jobs. Returns the tombstoned live versions (for backend cleanup)
    /// and the cancelled upload jobs (for backend cancel).
    pub fn delete_object(
        &self,
        object_id: i64,
    ) -> Result<(Vec<VersionRecord>, Vec<UploadRecord>), HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;

            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM object WHERE id = ?1 AND deleted_at IS NULL",
                    params![object_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(HatracError::NotFound("no such object".into()).into());
            }

            let versions = collect_versions(&tx, object_id)?;
            let uploads = collect_uploads(&tx, object_id)?;

            let stamp = now();
            tx.execute(
                "UPDATE version SET deleted_at = ?2
                 WHERE object_id = ?1 AND deleted_at IS NULL",
                params![object_id, stamp],
            )?;
            tx.execute("DELETE FROM upload WHERE object_id = ?1", params![object_id])?;
            tx.execute(
                "UPDATE object SET deleted_at = ?2, current_version_id = NULL,
                        update_seq = update_seq + 1
                 WHERE id = ?1",
                params![object_id, stamp],
            )?;

            tx.commit()?;
            Ok((versions, uploads))
        })
    }

    // ── Versions ────────────────────────────────────────────────────

    /// Insert a new version row and make it the object's current version.
    pub fn create_version(
        &self,
        object_id: i64,
        version_key: &str,
        size: i64,
        metadata: &VersionMetadata,
        acls: &AclSet,
        aux: &AuxRecord,
    ) -> Result<VersionRecord, HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            let record =
                create_version_in(&tx, object_id, version_key, size, metadata, acls, aux)?;
            tx.commit()?;
            Ok(record)
        })
    }

    /// Fetch a version (live or tombstoned) by object and version key.
    pub fn get_version(
        &self,
        object_id: i64,
        version_key: &str,
    ) -> Result<Option<VersionRecord>, HatracError> {
        self.run(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {VERSION_COLS} FROM version v
                         JOIN object o ON o.id = v.object_id
                         WHERE v.object_id = ?1 AND v.version_key = ?2"
                    ),
                    params![object_id, version_key],
                    version_from_row,
                )
                .optional()?)
        })
    }

    pub fn get_version_by_id(&self, version_id: i64) -> Result<Option<VersionRecord>, HatracError> {
        self.run(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {VERSION_COLS} FROM version v
                         JOIN object o ON o.id = v.object_id
                         WHERE v.id = ?1"
                    ),
                    params![version_id],
                    version_from_row,
                )
                .optional()?)
        })
    }

    /// Live versions of an object, oldest first.
    pub fn enumerate_versions(&self, object_id: i64) -> Result<Vec<VersionRecord>, HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            let versions = collect_versions(&tx, object_id)?;
            tx.commit()?;
            Ok(versions)
        })
    }

    /// Every live version in the directory, for migration sweeps.
    /// `name_prefix` narrows the walk to one subtree.
    pub fn enumerate_all_versions(
        &self,
        name_prefix: Option<&str>,
    ) -> Result<Vec<VersionRecord>, HatracError> {
        self.run(|conn| {
            let pattern = match name_prefix {
                Some(prefix) => format!("{}%", prefix.trim_end_matches('/')),
                None => "%".to_string(),
            };
            let mut stmt = conn.prepare(&format!(
                "SELECT {VERSION_COLS} FROM version v
                 JOIN object o ON o.id = v.object_id
                 WHERE v.deleted_at IS NULL AND o.deleted_at IS NULL
                   AND o.name LIKE ?1
                 ORDER BY o.name, v.id"
            ))?;
            let rows = stmt.query_map(params![pattern], version_from_row)?;
            let mut versions = Vec::new();
            for row in rows {
                versions.push(row?);
            }
            Ok(versions)
        })
    }

    /// Replace a version's aux record (migration rewrites).
    pub fn set_version_aux(&self, version_id: i64, aux: &AuxRecord) -> Result<(), HatracError> {
        self.run(|conn| {
            let aux_json = if aux.is_empty() {
                None
            } else {
                Some(serde_json::to_string(aux).unwrap_or_else(|_| "{}".into()))
            };
            let changed = conn.execute(
                "UPDATE version SET aux = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                params![version_id, aux_json],
            )?;
            if changed == 0 {
                return Err(HatracError::NotFound("no such version".into()).into());
            }
            Ok(())
        })
    }

    /// Tombstone one version. When it was current, the newest remaining
    /// live version becomes current (or the pointer clears). Returns the
    /// new current version id.
    pub fn delete_version(&self, version_id: i64) -> Result<Option<i64>, HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;

            let row: Option<(i64, Option<String>)> = tx
                .query_row(
                    "SELECT object_id, deleted_at FROM version WHERE id = ?1",
                    params![version_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (object_id, deleted_at) = match row {
                Some(v) => v,
                None => return Err(HatracError::NotFound("no such version".into()).into()),
            };
            if deleted_at.is_some() {
                return Err(HatracError::NotFound("version already deleted".into()).into());
            }

            tx.execute(
                "UPDATE version SET deleted_at = ?2 WHERE id = ?1",
                params![version_id, now()],
            )?;

            let current: Option<i64> = tx.query_row(
                "SELECT current_version_id FROM object WHERE id = ?1",
                params![object_id],
                |row| row.get(0),
            )?;

            let new_current = if current == Some(version_id) {
                let replacement: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM version
                         WHERE object_id = ?1 AND deleted_at IS NULL
                         ORDER BY id DESC LIMIT 1",
                        params![object_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                tx.execute(
                    "UPDATE object SET current_version_id = ?2, update_seq = update_seq + 1
                     WHERE id = ?1",
                    params![object_id, replacement],
                )?;
                replacement
            } else {
                current
            };

            tx.commit()?;
            Ok(new_current)
        })
    }

    // ── ACLs ────────────────────────────────────────────────────────

    /// Apply an ACL mutation to a resource and return the updated set.
    ///
    /// Stripping the last owner from a namespace or object is rejected;
    /// versions may have empty owner lists because their object chain
    /// still owns them.
    pub fn update_acl(
        &self,
        kind: AclKind,
        id: i64,
        access: &str,
        update: &AclUpdate,
    ) -> Result<AclSet, HatracError> {
        let table = acl_table(kind);
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;

            let acls_json: Option<String> = tx
                .query_row(
                    &format!("SELECT acls FROM {table} WHERE id = ?1 AND deleted_at IS NULL"),
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let mut acls: AclSet = match acls_json {
                Some(json) => parse_acls(&json),
                None => return Err(HatracError::NotFound("no such resource".into()).into()),
            };

            let mut list = acls.get(access).cloned().unwrap_or_default();
            match update {
                AclUpdate::ReplaceList(roles) => list = roles.clone(),
                AclUpdate::InsertEntry(role) => {
                    list.insert(role.clone());
                }
                AclUpdate::ClearList => list.clear(),
                AclUpdate::RemoveEntry(role) => {
                    if !list.remove(role) {
                        return Err(
                            HatracError::NotFound(format!("role {role:?} not in ACL")).into()
                        );
                    }
                }
            }

            if access == "owner" && list.is_empty() && kind != AclKind::Version {
                return Err(HatracError::BadRequest(
                    "update would leave the resource without an owner".into(),
                )
                .into());
            }

            if list.is_empty() {
                acls.clear(access);
            } else {
                acls.set(access, list);
            }

            tx.execute(
                &format!(
                    "UPDATE {table} SET acls = ?2, update_seq = update_seq + 1 WHERE id = ?1"
                ),
                params![id, acl_json(&acls)],
            )?;
            tx.commit()?;
            Ok(acls)
        })
    }

    // ── Metadata ────────────────────────────────────────────────────

    /// Set one metadata field on a version. Digest fields are immutable
    /// once set: rewriting with a different value is a conflict, an
    /// identical rewrite is a no-op.
    pub fn set_metadata_field(
        &self,
        version_id: i64,
        field: &str,
        value: &str,
    ) -> Result<(), HatracError> {
        let column = metadata_column(field)?;
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;

            let existing: Option<Option<String>> = tx
                .query_row(
                    &format!(
                        "SELECT {column} FROM version WHERE id = ?1 AND deleted_at IS NULL"
                    ),
                    params![version_id],
                    |row| row.get(0),
                )
                .optional()?;
            let existing = match existing {
                Some(v) => v,
                None => return Err(HatracError::NotFound("no such version".into()).into()),
            };

            let immutable = matches!(field, "content-md5" | "content-sha256");
            if immutable {
                match existing.as_deref() {
                    Some(current) if current == value => {
                        tx.commit()?;
                        return Ok(());
                    }
                    Some(_) => {
                        return Err(HatracError::Conflict(format!(
                            "{field} is immutable once set"
                        ))
                        .into())
                    }
                    None => {}
                }
            }

            tx.execute(
                &format!("UPDATE version SET {column} = ?2 WHERE id = ?1"),
                params![version_id, value],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Remove one mutable metadata field from a version.
    pub fn delete_metadata_field(
        &self,
        version_id: i64,
        field: &str,
    ) -> Result<(), HatracError> {
        let column = metadata_column(field)?;
        if !VersionMetadata::MUTABLE_FIELDS.contains(&field) {
            return Err(HatracError::Conflict(format!("{field} is immutable once set")));
        }
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            let existing: Option<Option<String>> = tx
                .query_row(
                    &format!(
                        "SELECT {column} FROM version WHERE id = ?1 AND deleted_at IS NULL"
                    ),
                    params![version_id],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                None => return Err(HatracError::NotFound("no such version".into()).into()),
                Some(None) => {
                    return Err(HatracError::NotFound(format!("{field} is not set")).into())
                }
                Some(Some(_)) => {}
            }
            tx.execute(
                &format!("UPDATE version SET {column} = NULL WHERE id = ?1"),
                params![version_id],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    // ── Upload jobs ─────────────────────────────────────────────────

    pub fn create_upload(
        &self,
        object_id: i64,
        job_key: &str,
        chunk_length: i64,
        content_length: i64,
        metadata: &VersionMetadata,
        owner_roles: &[String],
        backend_handle: Option<&str>,
    ) -> Result<UploadRecord, HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO upload (object_id, job_key, chunk_length, content_length,
                                     metadata, owner_roles, backend_handle, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    object_id,
                    job_key,
                    chunk_length,
                    content_length,
                    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".into()),
                    serde_json::to_string(owner_roles).unwrap_or_else(|_| "[]".into()),
                    backend_handle,
                    now(),
                ],
            )?;
            let record = fetch_upload(&tx, job_key)?
                .ok_or_else(|| HatracError::Internal(anyhow::anyhow!("upload row vanished")))?;
            tx.commit()?;
            Ok(record)
        })
    }

    pub fn get_upload(&self, job_key: &str) -> Result<Option<UploadRecord>, HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            let record = fetch_upload(&tx, job_key)?;
            tx.commit()?;
            Ok(record)
        })
    }

    /// Open jobs targeting an object, oldest first.
    pub fn list_uploads(&self, object_id: i64) -> Result<Vec<UploadRecord>, HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            let uploads = collect_uploads(&tx, object_id)?;
            tx.commit()?;
            Ok(uploads)
        })
    }

    /// Record the backend aux value for a chunk position. Retransmission
    /// of the same position replaces the earlier value.
    pub fn record_chunk(
        &self,
        upload_id: i64,
        position: u64,
        aux: &serde_json::Value,
    ) -> Result<(), HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            let json: Option<String> = tx
                .query_row(
                    "SELECT chunk_aux FROM upload WHERE id = ?1",
                    params![upload_id],
                    |row| row.get(0),
                )
                .optional()?;
            let json = match json {
                Some(j) => j,
                None => return Err(HatracError::NotFound("no such upload job".into()).into()),
            };
            let mut map: BTreeMap<String, serde_json::Value> =
                serde_json::from_str(&json).unwrap_or_default();
            map.insert(position.to_string(), aux.clone());
            tx.execute(
                "UPDATE upload SET chunk_aux = ?2 WHERE id = ?1",
                params![
                    upload_id,
                    serde_json::to_string(&map).unwrap_or_else(|_| "{}".into())
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Consume the job row and create its version atomically. A job that
    /// has already reached a terminal state yields 404, so two racing
    /// finalizations produce at most one version row.
    pub fn finalize_upload(
        &self,
        job_key: &str,
        version_key: &str,
        size: i64,
        metadata: &VersionMetadata,
        acls: &AclSet,
        aux: &AuxRecord,
    ) -> Result<VersionRecord, HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            let job = match fetch_upload(&tx, job_key)? {
                Some(job) => job,
                None => return Err(HatracError::NotFound("no such upload job".into()).into()),
            };
            tx.execute("DELETE FROM upload WHERE id = ?1", params![job.id])?;
            let record =
                create_version_in(&tx, job.object_id, version_key, size, metadata, acls, aux)?;
            tx.commit()?;
            Ok(record)
        })
    }

    /// Delete the job row, returning it for backend cancellation.
    pub fn cancel_upload(&self, job_key: &str) -> Result<Option<UploadRecord>, HatracError> {
        self.run(|conn| {
            let tx = conn.unchecked_transaction()?;
            let job = fetch_upload(&tx, job_key)?;
            if let Some(ref job) = job {
                tx.execute("DELETE FROM upload WHERE id = ?1", params![job.id])?;
            }
            tx.commit()?;
            Ok(job)
        })
    }
}

// ── Internal helpers ───────────────────────────────────────────────

const NAMESPACE_COLS: &str = "id, parent_id, name, update_seq, acls, created_at, deleted_at";
const OBJECT_COLS: &str =
    "id, namespace_id, name, current_version_id, update_seq, acls, created_at, deleted_at";
const VERSION_COLS: &str = "v.id, v.object_id, o.name, v.version_key, v.size, v.content_type, \
     v.content_md5, v.content_sha256, v.content_disposition, v.update_seq, v.acls, v.aux, \
     v.created_at, v.deleted_at";
const UPLOAD_COLS: &str = "u.id, u.object_id, o.name, u.job_key, u.chunk_length, \
     u.content_length, u.metadata, u.owner_roles, u.backend_handle, u.chunk_aux, u.created_at";

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn acl_json(acls: &AclSet) -> String {
    serde_json::to_string(acls).unwrap_or_else(|_| "{}".to_string())
}

fn parse_acls(json: &str) -> AclSet {
    serde_json::from_str(json).unwrap_or_default()
}

fn acl_table(kind: AclKind) -> &'static str {
    match kind {
        AclKind::Namespace => "namespace",
        AclKind::Object => "object",
        AclKind::Version => "version",
    }
}

fn metadata_column(field: &str) -> Result<&'static str, HatracError> {
    match field {
        "content-type" => Ok("content_type"),
        "content-md5" => Ok("content_md5"),
        "content-sha256" => Ok("content_sha256"),
        "content-disposition" => Ok("content_disposition"),
        other => Err(HatracError::NotFound(format!(
            "unknown metadata field {other:?}"
        ))),
    }
}

fn namespace_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NamespaceRecord> {
    Ok(NamespaceRecord {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        name: row.get(2)?,
        update_seq: row.get(3)?,
        acls: parse_acls(&row.get::<_, String>(4)?),
        created_at: row.get(5)?,
        deleted_at: row.get(6)?,
    })
}

fn object_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ObjectRecord> {
    Ok(ObjectRecord {
        id: row.get(0)?,
        namespace_id: row.get(1)?,
        name: row.get(2)?,
        current_version_id: row.get(3)?,
        update_seq: row.get(4)?,
        acls: parse_acls(&row.get::<_, String>(5)?),
        created_at: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRecord> {
    let aux: Option<String> = row.get(11)?;
    Ok(VersionRecord {
        id: row.get(0)?,
        object_id: row.get(1)?,
        object_name: row.get(2)?,
        version_key: row.get(3)?,
        size: row.get(4)?,
        metadata: VersionMetadata {
            content_type: row.get(5)?,
            content_md5: row.get(6)?,
            content_sha256: row.get(7)?,
            content_disposition: row.get(8)?,
        },
        update_seq: row.get(9)?,
        acls: parse_acls(&row.get::<_, String>(10)?),
        aux: aux
            .as_deref()
            .and_then(|j| serde_json::from_str(j).ok())
            .unwrap_or_default(),
        created_at: row.get(12)?,
        deleted_at: row.get(13)?,
    })
}

fn upload_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadRecord> {
    let metadata: String = row.get(6)?;
    let owner_roles: String = row.get(7)?;
    let chunk_aux: String = row.get(9)?;
    let aux_map: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&chunk_aux).unwrap_or_default();
    Ok(UploadRecord {
        id: row.get(0)?,
        object_id: row.get(1)?,
        object_name: row.get(2)?,
        job_key: row.get(3)?,
        chunk_length: row.get(4)?,
        content_length: row.get(5)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        owner_roles: serde_json::from_str(&owner_roles).unwrap_or_default(),
        backend_handle: row.get(8)?,
        chunk_aux: aux_map
            .into_iter()
            .filter_map(|(k, v)| k.parse::<u64>().ok().map(|k| (k, v)))
            .collect(),
        created_at: row.get(10)?,
    })
}

fn lookup_namespace(
    conn: &Connection,
    parent_id: i64,
    name: &str,
) -> Result<Option<NamespaceRecord>, TxnError> {
    Ok(conn
        .query_row(
            &format!("SELECT {NAMESPACE_COLS} FROM namespace WHERE parent_id = ?1 AND name = ?2"),
            params![parent_id, name],
            namespace_from_row,
        )
        .optional()?)
}

fn lookup_object(
    conn: &Connection,
    namespace_id: i64,
    name: &str,
) -> Result<Option<ObjectRecord>, TxnError> {
    Ok(conn
        .query_row(
            &format!("SELECT {OBJECT_COLS} FROM object WHERE namespace_id = ?1 AND name = ?2"),
            params![namespace_id, name],
            object_from_row,
        )
        .optional()?)
}

fn root_namespace(conn: &Connection) -> Result<NamespaceRecord, TxnError> {
    let root = conn
        .query_row(
            &format!("SELECT {NAMESPACE_COLS} FROM namespace WHERE parent_id IS NULL"),
            [],
            namespace_from_row,
        )
        .optional()?;
    root.ok_or_else(|| {
        TxnError::Fail(HatracError::Internal(anyhow::anyhow!(
            "root namespace missing; run deploy"
        )))
    })
}

fn resolve_in(conn: &Connection, path: &NamePath) -> Result<ResolvedName, TxnError> {
    let root = root_namespace(conn)?;
    if path.is_root() {
        return Ok(ResolvedName {
            ancestors: Vec::new(),
            binding: Binding::Namespace(root),
        });
    }

    let segments = path.segments();
    let mut ancestors = vec![root];
    for (i, _segment) in segments.iter().enumerate() {
        let parent = ancestors.last().expect("ancestors never empty");
        let prefix = NamePath::from_segments(segments[..=i].to_vec()).to_string_lossless();
        let last = i + 1 == segments.len();

        if let Some(ns) = lookup_namespace(conn, parent.id, &prefix)? {
            if ns.deleted_at.is_some() {
                if last {
                    return Ok(ResolvedName {
                        ancestors: ancestors.clone(),
                        binding: Binding::Tombstone(NameKind::Namespace),
                    });
                }
                // A deleted intermediate hides everything beneath it.
                return Err(HatracError::NotFound(format!("{prefix} not found")).into());
            }
            if last {
                return Ok(ResolvedName {
                    ancestors: ancestors.clone(),
                    binding: Binding::Namespace(ns),
                });
            }
            ancestors.push(ns);
            continue;
        }

        if let Some(obj) = lookup_object(conn, parent.id, &prefix)? {
            if !last {
                // Objects are leaves; nothing resolves beneath them.
                return Err(HatracError::NotFound(format!("{prefix} is not a namespace")).into());
            }
            if obj.deleted_at.is_some() {
                return Ok(ResolvedName {
                    ancestors: ancestors.clone(),
                    binding: Binding::Tombstone(NameKind::Object),
                });
            }
            return Ok(ResolvedName {
                ancestors: ancestors.clone(),
                binding: Binding::Object(obj),
            });
        }

        if !last {
            return Err(HatracError::NotFound(format!("{prefix} not found")).into());
        }
        return Ok(ResolvedName {
            ancestors: ancestors.clone(),
            binding: Binding::Undefined,
        });
    }
    unreachable!("non-root path has at least one segment")
}

fn create_namespace_in(
    tx: &Transaction<'_>,
    path: &NamePath,
    parents: bool,
    owner_roles: &[String],
) -> Result<(NamespaceRecord, bool), TxnError> {
    if path.is_root() {
        return Err(HatracError::Conflict("the root namespace already exists".into()).into());
    }

    let root = root_namespace(tx)?;
    let segments = path.segments();
    let mut parent = root;

    for (i, _segment) in segments.iter().enumerate() {
        let prefix = NamePath::from_segments(segments[..=i].to_vec()).to_string_lossless();
        let last = i + 1 == segments.len();

        if let Some(ns) = lookup_namespace(tx, parent.id, &prefix)? {
            if ns.deleted_at.is_none() {
                if last {
                    return Err(
                        HatracError::Conflict(format!("{prefix} is already a namespace")).into(),
                    );
                }
                parent = ns;
                continue;
            }
            // Tombstoned namespace: restoration of the same kind.
            if !last && !parents {
                return Err(HatracError::NotFound(format!("{prefix} not found")).into());
            }
            let acls = AclSet::initial_owner(owner_roles);
            tx.execute(
                "UPDATE namespace SET deleted_at = NULL, acls = ?2, created_at = ?3,
                        update_seq = update_seq + 1
                 WHERE id = ?1",
                params![ns.id, acl_json(&acls), now()],
            )?;
            let revived = lookup_namespace(tx, parent.id, &prefix)?
                .ok_or_else(|| HatracError::Internal(anyhow::anyhow!("namespace row vanished")))?;
            if last {
                return Ok((revived, true));
            }
            parent = revived;
            continue;
        }

        if lookup_object(tx, parent.id, &prefix)?.is_some() {
            return Err(HatracError::Conflict(format!(
                "{prefix} is bound as an object and cannot become a namespace"
            ))
            .into());
        }

        if !last && !parents {
            return Err(HatracError::NotFound(format!("{prefix} not found")).into());
        }

        let acls = AclSet::initial_owner(owner_roles);
        tx.execute(
            "INSERT INTO namespace (parent_id, name, acls, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![parent.id, prefix, acl_json(&acls), now()],
        )?;
        let created = lookup_namespace(tx, parent.id, &prefix)?
            .ok_or_else(|| HatracError::Internal(anyhow::anyhow!("namespace row vanished")))?;
        if last {
            return Ok((created, false));
        }
        parent = created;
    }
    unreachable!("non-root path has at least one segment")
}

fn create_object_in(
    tx: &Transaction<'_>,
    path: &NamePath,
    owner_roles: &[String],
) -> Result<(ObjectRecord, bool), TxnError> {
    let resolved = resolve_in(tx, path)?;
    let parent = match resolved.ancestors.last() {
        Some(ns) if resolved.ancestors.len() == path.depth() => ns,
        _ => {
            return Err(
                HatracError::NotFound(format!("parent of {path} is not a namespace")).into(),
            )
        }
    };

    match resolved.binding {
        Binding::Object(obj) => Ok((obj, false)),
        Binding::Namespace(_) | Binding::Tombstone(NameKind::Namespace) => Err(
            HatracError::Conflict(format!("{path} is bound as a namespace")).into(),
        ),
        Binding::Tombstone(NameKind::Object) => {
            let name = path.to_string_lossless();
            let acls = AclSet::initial_owner(owner_roles);
            tx.execute(
                "UPDATE object SET deleted_at = NULL, acls = ?3, created_at = ?4,
                        current_version_id = NULL, update_seq = update_seq + 1
                 WHERE namespace_id = ?1 AND name = ?2",
                params![parent.id, name, acl_json(&acls), now()],
            )?;
            let revived = lookup_object(tx, parent.id, &name)?
                .ok_or_else(|| HatracError::Internal(anyhow::anyhow!("object row vanished")))?;
            Ok((revived, true))
        }
        Binding::Undefined => {
            let name = path.to_string_lossless();
            let acls = AclSet::initial_owner(owner_roles);
            tx.execute(
                "INSERT INTO object (namespace_id, name, acls, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![parent.id, name, acl_json(&acls), now()],
            )?;
            let created = lookup_object(tx, parent.id, &name)?
                .ok_or_else(|| HatracError::Internal(anyhow::anyhow!("object row vanished")))?;
            Ok((created, false))
        }
    }
}

fn create_version_in(
    tx: &Transaction<'_>,
    object_id: i64,
    version_key: &str,
    size: i64,
    metadata: &VersionMetadata,
    acls: &AclSet,
    aux: &AuxRecord,
) -> Result<VersionRecord, TxnError> {
    let live: Option<i64> = tx
        .query_row(
            "SELECT id FROM object WHERE id = ?1 AND deleted_at IS NULL",
            params![object_id],
            |row| row.get(0),
        )
        .optional()?;
    if live.is_none() {
        return Err(HatracError::NotFound("no such object".into()).into());
    }

    let aux_json = if aux.is_empty() {
        None
    } else {
        Some(serde_json::to_string(aux).unwrap_or_else(|_| "{}".into()))
    };

    tx.execute(
        "INSERT INTO version (object_id, version_key, size, content_type, content_md5,
                              content_sha256, content_disposition, acls, aux, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            object_id,
            version_key,
            size,
            metadata.content_type,
            metadata.content_md5,
            metadata.content_sha256,
            metadata.content_disposition,
            acl_json(acls),
            aux_json,
            now(),
        ],
    )?;
    let version_id = tx.last_insert_rowid();

    tx.execute(
        "UPDATE object SET current_version_id = ?2, update_seq = update_seq + 1
         WHERE id = ?1",
        params![object_id, version_id],
    )?;

    let record = tx
        .query_row(
            &format!(
                "SELECT {VERSION_COLS} FROM version v
                 JOIN object o ON o.id = v.object_id
                 WHERE v.id = ?1"
            ),
            params![version_id],
            version_from_row,
        )
        .optional()?
        .ok_or_else(|| HatracError::Internal(anyhow::anyhow!("version row vanished")))?;
    Ok(record)
}

fn collect_versions(
    tx: &Transaction<'_>,
    object_id: i64,
) -> Result<Vec<VersionRecord>, TxnError> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {VERSION_COLS} FROM version v
         JOIN object o ON o.id = v.object_id
         WHERE v.object_id = ?1 AND v.deleted_at IS NULL
         ORDER BY v.id ASC"
    ))?;
    let rows = stmt.query_map(params![object_id], version_from_row)?;
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row?);
    }
    Ok(versions)
}

fn collect_uploads(tx: &Transaction<'_>, object_id: i64) -> Result<Vec<UploadRecord>, TxnError> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {UPLOAD_COLS} FROM upload u
         JOIN object o ON o.id = u.object_id
         WHERE u.object_id = ?1
         ORDER BY u.id ASC"
    ))?;
    let rows = stmt.query_map(params![object_id], upload_from_row)?;
    let mut uploads = Vec::new();
    for row in rows {
        uploads.push(row?);
    }
    Ok(uploads)
}

fn fetch_upload(tx: &Transaction<'_>, job_key: &str) -> Result<Option<UploadRecord>, TxnError> {
    Ok(tx
        .query_row(
            &format!(
                "SELECT {UPLOAD_COLS} FROM upload u
                 JOIN object o ON o.id = u.object_id
                 WHERE u.job_key = ?1"
            ),
            params![job_key],
            upload_from_row,
        )
        .optional()?)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir() -> SqliteDirectory {
        let dir = SqliteDirectory::open(":memory:", 3).expect("open in-memory directory");
        dir.deploy(&["admin".to_string()]).expect("deploy");
        dir
    }

    fn path(p: &str) -> NamePath {
        let segments: Vec<String> = p
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        NamePath::from_segments(segments)
    }

    fn owners() -> Vec<String> {
        vec!["alice".to_string()]
    }

    #[test]
    fn deploy_is_idempotent() {
        let dir = test_dir();
        dir.deploy(&["someone-else".to_string()]).unwrap();
        let root = dir.resolve(&NamePath::root()).unwrap();
        match root.binding {
            Binding::Namespace(ns) => {
                assert_eq!(ns.name, "/");
                assert!(ns.acls.get("owner").unwrap().contains("admin"));
            }
            other => panic!("expected namespace, got {other:?}"),
        }
    }

    #[test]
    fn namespace_create_resolve_delete_cycle() {
        let dir = test_dir();
        let (ns, restored) = dir.create_namespace(&path("/ns-X"), false, &owners()).unwrap();
        assert!(!restored);
        assert_eq!(ns.name, "/ns-X");

        // Repeat create conflicts.
        let err = dir.create_namespace(&path("/ns-X"), false, &owners()).unwrap_err();
        assert!(matches!(err, HatracError::Conflict(_)));

        dir.delete_namespace(ns.id).unwrap();
        match dir.resolve(&path("/ns-X")).unwrap().binding {
            Binding::Tombstone(NameKind::Namespace) => {}
            other => panic!("expected tombstone, got {other:?}"),
        }

        // Same-kind restoration succeeds and reports it.
        let (_, restored) = dir.create_namespace(&path("/ns-X"), false, &owners()).unwrap();
        assert!(restored);
    }

    #[test]
    fn parents_flag_controls_ancestor_creation() {
        let dir = test_dir();
        let err = dir
            .create_namespace(&path("/a/b/c"), false, &owners())
            .unwrap_err();
        assert!(matches!(err, HatracError::NotFound(_)));

        let (ns, _) = dir.create_namespace(&path("/a/b/c"), true, &owners()).unwrap();
        assert_eq!(ns.name, "/a/b/c");

        let resolved = dir.resolve(&path("/a/b")).unwrap();
        assert!(matches!(resolved.binding, Binding::Namespace(_)));
    }

    #[test]
    fn kind_is_monotone_across_deletion() {
        let dir = test_dir();
        dir.create_namespace(&path("/ns"), false, &owners()).unwrap();
        let (obj, _) = dir.create_object(&path("/ns/thing"), &owners()).unwrap();
        let _ = dir.delete_object(obj.id).unwrap();

        // Rebinding the deleted object name as a namespace conflicts.
        let err = dir
            .create_namespace(&path("/ns/thing"), false, &owners())
            .unwrap_err();
        assert!(matches!(err, HatracError::Conflict(_)));

        // Same-kind restoration works and clears the old version pointer.
        let (revived, restored) = dir.create_object(&path("/ns/thing"), &owners()).unwrap();
        assert!(restored);
        assert!(revived.current_version_id.is_none());
    }

    #[test]
    fn nonempty_namespace_delete_conflicts() {
        let dir = test_dir();
        let (ns, _) = dir.create_namespace(&path("/ns"), false, &owners()).unwrap();
        dir.create_object(&path("/ns/obj"), &owners()).unwrap();

        let err = dir.delete_namespace(ns.id).unwrap_err();
        assert!(matches!(err, HatracError::Conflict(_)));
    }

    #[test]
    fn version_lifecycle_advances_current_pointer() {
        let dir = test_dir();
        dir.create_namespace(&path("/ns"), false, &owners()).unwrap();
        let (obj, _) = dir.create_object(&path("/ns/obj"), &owners()).unwrap();

        let meta = VersionMetadata::default();
        let acls = AclSet::initial_owner(&owners());
        let v1 = dir
            .create_version(obj.id, "v1", 3, &meta, &acls, &AuxRecord::default())
            .unwrap();
        let v2 = dir
            .create_version(obj.id, "v2", 4, &meta, &acls, &AuxRecord::default())
            .unwrap();

        let obj_now = dir.get_object(obj.id).unwrap().unwrap();
        assert_eq!(obj_now.current_version_id, Some(v2.id));

        // Deleting current advances to the most recent remaining.
        let new_current = dir.delete_version(v2.id).unwrap();
        assert_eq!(new_current, Some(v1.id));

        // Deleting the last clears the pointer.
        let new_current = dir.delete_version(v1.id).unwrap();
        assert_eq!(new_current, None);

        // Double delete is 404.
        let err = dir.delete_version(v1.id).unwrap_err();
        assert!(matches!(err, HatracError::NotFound(_)));
    }

    #[test]
    fn digest_metadata_is_immutable() {
        let dir = test_dir();
        dir.create_namespace(&path("/ns"), false, &owners()).unwrap();
        let (obj, _) = dir.create_object(&path("/ns/obj"), &owners()).unwrap();
        let v = dir
            .create_version(
                obj.id,
                "v1",
                3,
                &VersionMetadata::default(),
                &AclSet::initial_owner(&owners()),
                &AuxRecord::default(),
            )
            .unwrap();

        dir.set_metadata_field(v.id, "content-md5", "abc=").unwrap();
        // Identical rewrite is a no-op.
        dir.set_metadata_field(v.id, "content-md5", "abc=").unwrap();
        // Conflicting rewrite fails.
        let err = dir.set_metadata_field(v.id, "content-md5", "def=").unwrap_err();
        assert!(matches!(err, HatracError::Conflict(_)));

        // Mutable fields can change and be deleted.
        dir.set_metadata_field(v.id, "content-type", "text/plain").unwrap();
        dir.set_metadata_field(v.id, "content-type", "text/html").unwrap();
        dir.delete_metadata_field(v.id, "content-type").unwrap();
        let err = dir.delete_metadata_field(v.id, "content-md5").unwrap_err();
        assert!(matches!(err, HatracError::Conflict(_)));
    }

    #[test]
    fn acl_updates_guard_last_owner() {
        let dir = test_dir();
        let (ns, _) = dir.create_namespace(&path("/ns"), false, &owners()).unwrap();

        let err = dir
            .update_acl(
                AclKind::Namespace,
                ns.id,
                "owner",
                &AclUpdate::ReplaceList(BTreeSet::new()),
            )
            .unwrap_err();
        assert!(matches!(err, HatracError::BadRequest(_)));

        let roles: BTreeSet<String> = ["R1", "R2"].iter().map(|s| s.to_string()).collect();
        let acls = dir
            .update_acl(
                AclKind::Namespace,
                ns.id,
                "owner",
                &AclUpdate::ReplaceList(roles),
            )
            .unwrap();
        assert_eq!(acls.get("owner").unwrap().len(), 2);

        dir.update_acl(
            AclKind::Namespace,
            ns.id,
            "owner",
            &AclUpdate::RemoveEntry("R2".to_string()),
        )
        .unwrap();

        let err = dir
            .update_acl(
                AclKind::Namespace,
                ns.id,
                "owner",
                &AclUpdate::RemoveEntry("R1".to_string()),
            )
            .unwrap_err();
        assert!(matches!(err, HatracError::BadRequest(_)));

        // Removing an absent entry is 404.
        let err = dir
            .update_acl(
                AclKind::Namespace,
                ns.id,
                "subtree-read",
                &AclUpdate::RemoveEntry("nobody".to_string()),
            )
            .unwrap_err();
        assert!(matches!(err, HatracError::NotFound(_)));
    }

    #[test]
    fn acl_update_bumps_etag_seq() {
        let dir = test_dir();
        let (ns, _) = dir.create_namespace(&path("/ns"), false, &owners()).unwrap();
        let before = ns.etag_token();

        dir.update_acl(
            AclKind::Namespace,
            ns.id,
            "subtree-read",
            &AclUpdate::InsertEntry("readers".to_string()),
        )
        .unwrap();

        let after = match dir.resolve(&path("/ns")).unwrap().binding {
            Binding::Namespace(ns) => ns.etag_token(),
            other => panic!("expected namespace, got {other:?}"),
        };
        assert_ne!(before, after);
    }

    #[test]
    fn upload_finalize_is_once_only() {
        let dir = test_dir();
        dir.create_namespace(&path("/ns"), false, &owners()).unwrap();
        let (obj, _) = dir.create_object(&path("/ns/obj"), &owners()).unwrap();

        let job = dir
            .create_upload(
                obj.id,
                "job-1",
                5,
                12,
                &VersionMetadata::default(),
                &owners(),
                Some("backend-handle"),
            )
            .unwrap();
        assert_eq!(job.total_chunks(), 3);

        dir.record_chunk(job.id, 0, &serde_json::json!({"etag": "a"})).unwrap();
        dir.record_chunk(job.id, 1, &serde_json::json!({"etag": "b"})).unwrap();
        let job = dir.get_upload("job-1").unwrap().unwrap();
        assert_eq!(job.chunk_aux.len(), 2);

        let version = dir
            .finalize_upload(
                "job-1",
                "vfinal",
                12,
                &VersionMetadata::default(),
                &AclSet::initial_owner(&owners()),
                &AuxRecord::default(),
            )
            .unwrap();
        assert_eq!(version.version_key, "vfinal");

        // The job row is consumed: a second finalize is 404.
        let err = dir
            .finalize_upload(
                "job-1",
                "vother",
                12,
                &VersionMetadata::default(),
                &AclSet::initial_owner(&owners()),
                &AuxRecord::default(),
            )
            .unwrap_err();
        assert!(matches!(err, HatracError::NotFound(_)));
    }

    #[test]
    fn object_delete_cancels_open_uploads() {
        let dir = test_dir();
        dir.create_namespace(&path("/ns"), false, &owners()).unwrap();
        let (obj, _) = dir.create_object(&path("/ns/obj"), &owners()).unwrap();
        dir.create_upload(obj.id, "job-1", 5, 10, &VersionMetadata::default(), &owners(), None)
            .unwrap();
        dir.create_version(
            obj.id,
            "v1",
            3,
            &VersionMetadata::default(),
            &AclSet::initial_owner(&owners()),
            &AuxRecord::default(),
        )
        .unwrap();

        let (versions, uploads) = dir.delete_object(obj.id).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(uploads.len(), 1);
        assert!(dir.get_upload("job-1").unwrap().is_none());
    }

    #[test]
    fn resolution_distinguishes_undefined_from_tombstone() {
        let dir = test_dir();
        dir.create_namespace(&path("/ns"), false, &owners()).unwrap();

        match dir.resolve(&path("/ns/never-bound")).unwrap().binding {
            Binding::Undefined => {}
            other => panic!("expected undefined, got {other:?}"),
        }

        // A missing intermediate fails resolution outright.
        let err = dir.resolve(&path("/nope/deep/path")).unwrap_err();
        assert!(matches!(err, HatracError::NotFound(_)));
    }

    #[test]
    fn resolution_returns_ancestor_chain() {
        let dir = test_dir();
        dir.create_namespace(&path("/a/b"), true, &owners()).unwrap();
        let (_, _) = dir.create_object(&path("/a/b/obj"), &owners()).unwrap();

        let resolved = dir.resolve(&path("/a/b/obj")).unwrap();
        let names: Vec<&str> = resolved.ancestors.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["/", "/a", "/a/b"]);
        assert!(matches!(resolved.binding, Binding::Object(_)));
    }
}
