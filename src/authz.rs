//! Authorization engine.
//!
//! Two filters gate every operation: the service-wide firewall ACLs from
//! configuration, and the resource ACL chain with ancestral `subtree-*`
//! inheritance. Ownership anywhere along the chain grants all access to
//! everything below it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::{Config, FirewallAction};
use crate::errors::HatracError;

/// A resource's ACLs: access name → role set. Stored as a JSON object
/// column in the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AclSet(pub BTreeMap<String, BTreeSet<String>>);

impl AclSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// ACLs given to a freshly created resource: the creator owns it.
    pub fn initial_owner(owner_roles: &[String]) -> Self {
        let mut acls = AclSet::new();
        acls.0
            .insert("owner".to_string(), owner_roles.iter().cloned().collect());
        acls
    }

    pub fn get(&self, access: &str) -> Option<&BTreeSet<String>> {
        self.0.get(access)
    }

    pub fn set(&mut self, access: &str, roles: BTreeSet<String>) {
        self.0.insert(access.to_string(), roles);
    }

    pub fn clear(&mut self, access: &str) {
        self.0.remove(access);
    }

    fn intersects(&self, access: &str, roles: &BTreeSet<String>) -> bool {
        self.get(access)
            .map(|acl| !acl.is_disjoint(roles))
            .unwrap_or(false)
    }
}

/// The resource kinds that carry ACL sub-resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclKind {
    Namespace,
    Object,
    Version,
}

impl AclKind {
    /// Access names valid on a resource of this kind.
    pub fn access_names(self) -> &'static [&'static str] {
        match self {
            AclKind::Namespace => &[
                "owner",
                "create",
                "subtree-owner",
                "subtree-create",
                "subtree-update",
                "subtree-read",
            ],
            AclKind::Object => &["owner", "update", "subtree-owner", "subtree-read"],
            AclKind::Version => &["owner", "read"],
        }
    }

    pub fn validate_access(self, access: &str) -> Result<(), HatracError> {
        if self.access_names().contains(&access) {
            Ok(())
        } else {
            Err(HatracError::NotFound(format!(
                "access mode {access:?} not defined for this resource"
            )))
        }
    }
}

/// Operations checked against resource ACLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceAction {
    /// Bind a new child name under a namespace.
    CreateChild,
    /// Add a version to an object.
    Update,
    /// Read content or listings.
    Read,
    /// Tombstone a name or version.
    Delete,
    /// Replace or edit ACLs.
    ManageAcls,
    /// Edit the metadata sub-resource.
    ManageMetadata,
}

impl ResourceAction {
    /// The firewall list gating this action, if any. Reads are never
    /// firewalled.
    fn firewall(self) -> Option<FirewallAction> {
        match self {
            ResourceAction::CreateChild | ResourceAction::Update => Some(FirewallAction::Create),
            ResourceAction::Delete => Some(FirewallAction::Delete),
            ResourceAction::ManageAcls => Some(FirewallAction::ManageAcls),
            ResourceAction::ManageMetadata => Some(FirewallAction::ManageMetadata),
            ResourceAction::Read => None,
        }
    }

    /// Direct ACL name on the target resource, for non-ownership actions.
    fn direct_access(self) -> Option<&'static str> {
        match self {
            ResourceAction::CreateChild => Some("create"),
            ResourceAction::Update => Some("update"),
            ResourceAction::Read => Some("read"),
            // Destructive and administrative actions require ownership.
            _ => None,
        }
    }

    /// Inherited `subtree-*` ACL name contributed by ancestors.
    fn subtree_access(self) -> Option<&'static str> {
        match self {
            ResourceAction::CreateChild => Some("subtree-create"),
            ResourceAction::Update => Some("subtree-update"),
            ResourceAction::Read => Some("subtree-read"),
            _ => None,
        }
    }
}

/// Ownership alone: `owner` on the target or `subtree-owner` anywhere
/// along the chain. Used directly for surfaces that only owners may
/// see, such as ACL reads.
pub fn owns(roles: &BTreeSet<String>, chain: &[&AclSet]) -> bool {
    if let Some(target) = chain.last() {
        if target.intersects("owner", roles) {
            return true;
        }
    }
    chain
        .iter()
        .any(|acls| acls.intersects("subtree-owner", roles))
}

/// Decide whether `roles` may perform `action` against a resource whose
/// ACL chain (root namespace first, target resource last) is `chain`.
///
/// `roles` must be the effective role set (client id + attributes + `*`).
pub fn authorized(
    config: &Config,
    roles: &BTreeSet<String>,
    action: ResourceAction,
    chain: &[&AclSet],
) -> bool {
    // Filter 1: the service firewall.
    if let Some(firewall) = action.firewall() {
        let list = config.firewall_acl(firewall);
        if !list.iter().any(|entry| roles.contains(entry)) {
            return false;
        }
    }

    // Filter 2: ownership short-circuit grants everything.
    if owns(roles, chain) {
        return true;
    }

    // Non-ownership actions: the target's direct ACL unioned with
    // matching subtree ACLs at self or any ancestor.
    if let Some(direct) = action.direct_access() {
        if let Some(target) = chain.last() {
            if target.intersects(direct, roles) {
                return true;
            }
        }
    }
    if let Some(subtree) = action.subtree_access() {
        if chain.iter().any(|acls| acls.intersects(subtree, roles)) {
            return true;
        }
    }

    false
}

/// Map a denied decision to the right error: anonymous callers get 401,
/// identified callers 403.
pub fn denial(anonymous: bool, what: &str) -> HatracError {
    if anonymous {
        HatracError::Unauthorized(format!("authentication required to {what}"))
    } else {
        HatracError::Forbidden(format!("not authorized to {what}"))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
