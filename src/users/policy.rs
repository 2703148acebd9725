use std::collections::HashMap;

use tracing::warn;

use crate::error::{Error, Result};
use crate::users::repo_types::User;

/// Per-resource authorization decision. Each action maps to exactly one
/// `<resource>:<action>` permission; unmapped actions always deny.
pub trait ResourcePolicy: Send + Sync {
    fn resource(&self) -> &'static str;
    fn allows(&self, user: &User, action: &str) -> bool;
}

fn allows_scoped(user: &User, resource: &str, actions: &[&str], action: &str) -> bool {
    let full = format!("{resource}:full");
    if user.has_any_permission(&["full", full.as_str()]) {
        return true;
    }
    if !actions.contains(&action) {
        return false;
    }
    user.has_permission(&format!("{resource}:{action}"))
}

pub struct UserPolicy;

impl ResourcePolicy for UserPolicy {
    fn resource(&self) -> &'static str {
        "users"
    }

    fn allows(&self, user: &User, action: &str) -> bool {
        const ACTIONS: &[&str] = &[
            "create",
            "view",
            "update",
            "delete",
            "assign-role",
            "revoke-role",
            "view-roles",
            "assign-permission",
            "revoke-permission",
            "view-permissions",
        ];
        allows_scoped(user, self.resource(), ACTIONS, action)
    }
}

pub struct RolePolicy;

impl ResourcePolicy for RolePolicy {
    fn resource(&self) -> &'static str {
        "roles"
    }

    fn allows(&self, user: &User, action: &str) -> bool {
        const ACTIONS: &[&str] = &[
            "create",
            "view",
            "delete",
            "grant-permission",
            "revoke-permission",
        ];
        allows_scoped(user, self.resource(), ACTIONS, action)
    }
}

pub struct PermissionPolicy;

impl ResourcePolicy for PermissionPolicy {
    fn resource(&self) -> &'static str {
        "permissions"
    }

    fn allows(&self, user: &User, action: &str) -> bool {
        const ACTIONS: &[&str] = &["create", "view", "delete", "assign", "revoke"];
        allows_scoped(user, self.resource(), ACTIONS, action)
    }
}

/// Explicitly constructed resource→policy registry. Built once at startup
/// and injected; safe for unsynchronized concurrent reads afterwards.
pub struct PolicyRegistry {
    policies: HashMap<&'static str, Box<dyn ResourcePolicy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(UserPolicy));
        registry.register(Box::new(RolePolicy));
        registry.register(Box::new(PermissionPolicy));
        registry
    }

    pub fn register(&mut self, policy: Box<dyn ResourcePolicy>) {
        self.policies.insert(policy.resource(), policy);
    }

    /// The closed set of registered resource keys, for startup checks.
    pub fn resources(&self) -> Vec<&'static str> {
        let mut resources: Vec<_> = self.policies.keys().copied().collect();
        resources.sort_unstable();
        resources
    }

    /// A missing policy is a configuration error; the caller still only
    /// sees `Forbidden`.
    pub fn check(&self, user: &User, resource: &str, action: &str) -> Result<()> {
        let Some(policy) = self.policies.get(resource) else {
            warn!(resource, "no policy registered for resource");
            return Err(Error::Forbidden);
        };
        if policy.allows(user, action) {
            Ok(())
        } else {
            Err(Error::Forbidden)
        }
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
