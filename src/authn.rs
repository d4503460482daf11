//! Authentication adapter.
//!
//! Hatrac does not authenticate requests itself; an upstream provider
//! (reverse proxy, gateway, session service) establishes the client
//! identity and attribute set and the service consumes them through the
//! [`Provider`] trait. The shipped [`TrustedHeaderProvider`] reads the
//! values from request headers populated by such a front end.

use axum::http::HeaderMap;
use std::collections::BTreeSet;

/// Per-request client identity: an optional client id plus role strings.
///
/// An anonymous request has no client and an empty role set. The
/// wildcard role `*` is implicit for every request and is what lets
/// `["*"]` ACLs admit anonymous callers.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    /// Authenticated client identifier, if any.
    pub client: Option<String>,
    /// Attribute roles granted to the client.
    pub roles: BTreeSet<String>,
}

impl ClientContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.client.is_none()
    }

    /// The role set used for ACL intersection: attributes, the client id
    /// itself, and the implicit wildcard.
    pub fn effective_roles(&self) -> BTreeSet<String> {
        let mut roles = self.roles.clone();
        if let Some(ref client) = self.client {
            roles.insert(client.clone());
        }
        roles.insert("*".to_string());
        roles
    }

    /// Roles recorded as resource owners at creation time: the client id
    /// and attributes, without the wildcard.
    pub fn ownership_roles(&self) -> Vec<String> {
        let mut roles: BTreeSet<String> = self.roles.clone();
        if let Some(ref client) = self.client {
            roles.insert(client.clone());
        }
        roles.into_iter().collect()
    }
}

/// Supplies the per-request client context.
pub trait Provider: Send + Sync + 'static {
    fn identify(&self, headers: &HeaderMap) -> ClientContext;
}

/// Reads identity from headers injected by a trusted front end.
///
/// The client id comes from one header and roles from another as a
/// comma-separated list. Absent headers yield an anonymous context.
pub struct TrustedHeaderProvider {
    client_header: String,
    roles_header: String,
}

impl TrustedHeaderProvider {
    pub fn new() -> Self {
        Self {
            client_header: "x-hatrac-client".to_string(),
            roles_header: "x-hatrac-roles".to_string(),
        }
    }
}

impl Default for TrustedHeaderProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for TrustedHeaderProvider {
    fn identify(&self, headers: &HeaderMap) -> ClientContext {
        let client = headers
            .get(self.client_header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let mut roles = BTreeSet::new();
        if let Some(list) = headers
            .get(self.roles_header.as_str())
            .and_then(|v| v.to_str().ok())
        {
            for role in list.split(',') {
                let role = role.trim();
                if !role.is_empty() {
                    roles.insert(role.to_string());
                }
            }
        }

        ClientContext { client, roles }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_has_only_wildcard() {
        let ctx = ClientContext::anonymous();
        assert!(ctx.is_anonymous());
        let roles = ctx.effective_roles();
        assert_eq!(roles.len(), 1);
        assert!(roles.contains("*"));
    }

    #[test]
    fn header_provider_extracts_client_and_roles() {
        let provider = TrustedHeaderProvider::new();
        let mut headers = HeaderMap::new();
        headers.insert("x-hatrac-client", "alice".parse().unwrap());
        headers.insert("x-hatrac-roles", "staff, curators".parse().unwrap());

        let ctx = provider.identify(&headers);
        assert_eq!(ctx.client.as_deref(), Some("alice"));
        assert!(ctx.roles.contains("staff"));
        assert!(ctx.roles.contains("curators"));

        let effective = ctx.effective_roles();
        assert!(effective.contains("alice"));
        assert!(effective.contains("*"));
    }

    #[test]
    fn missing_headers_are_anonymous() {
        let provider = TrustedHeaderProvider::new();
        let ctx = provider.identify(&HeaderMap::new());
        assert!(ctx.is_anonymous());
        assert!(ctx.roles.is_empty());
    }
}
