use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Directory user record plus the RBAC state loaded for it.
///
/// Rows are soft-deleted only (`deleted_at`); lookups skip deleted rows.
/// Email is stored and compared case-sensitively.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: String,
    pub phone: String,
    pub position: String,
    pub active: bool,
    pub email_verified: bool,
    pub last_login: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
    #[sqlx(skip)]
    #[serde(default)]
    pub roles: Vec<Role>,
    #[sqlx(skip)]
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

/// Named capability bundle, global to the directory.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    #[sqlx(skip)]
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

/// Named atomic capability, global to the directory.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Permission {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
}

impl User {
    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.name.clone()).collect()
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.roles.iter().any(|r| r.name == name)
    }

    /// True when the permission is granted directly or through any role.
    pub fn has_permission(&self, name: &str) -> bool {
        if self.permissions.iter().any(|p| p.name == name) {
            return true;
        }
        self.roles
            .iter()
            .any(|r| r.permissions.iter().any(|p| p.name == name))
    }

    pub fn has_any_permission(&self, names: &[&str]) -> bool {
        names.iter().any(|name| self.has_permission(name))
    }

    /// Effective permission set: direct grants unioned with every assigned
    /// role's permissions, deduplicated by name.
    pub fn effective_permission_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> =
            self.permissions.iter().map(|p| p.name.clone()).collect();
        for role in &self.roles {
            names.extend(role.permissions.iter().map(|p| p.name.clone()));
        }
        names
    }
}
