use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::auth::password::{hash_password, verify_password};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::users::dto::CreateUserRequest;
use crate::users::repo::DirectoryStore;
use crate::users::repo_types::{Permission, Role, User};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn DirectoryStore>,
    clock: Arc<dyn Clock>,
}

impl UserService {
    pub fn new(store: Arc<dyn DirectoryStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Provisions a user together with its role and permission grants in one
    /// transaction. Password values never appear in errors or logs.
    #[instrument(skip(self, req), fields(email = %req.email))]
    pub async fn create(&self, req: CreateUserRequest) -> Result<User> {
        if req.password != req.password_confirmation {
            return Err(Error::Validation(
                "password confirmation does not match password".into(),
            ));
        }
        if !is_valid_email(&req.email) {
            return Err(Error::Validation(format!("invalid email: {}", req.email)));
        }
        if req.password.len() < 8 {
            return Err(Error::Validation(
                "password must be at least 8 characters".into(),
            ));
        }

        if self.store.find_by_email(&req.email).await?.is_some() {
            warn!(email = %req.email, "email already registered");
            return Err(Error::Conflict(format!(
                "email already registered: {}",
                req.email
            )));
        }

        let password_hash = hash_password(&req.password)?;
        let now = self.clock.now();
        let user = User {
            id: Uuid::new_v4(),
            email: req.email,
            password_hash,
            first_name: req.first_name,
            last_name: req.last_name,
            middle_name: req.middle_name,
            phone: req.phone,
            position: req.position,
            active: req.active,
            email_verified: false,
            last_login: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            roles: Vec::new(),
            permissions: Vec::new(),
        };

        let created = self
            .store
            .create_with_grants(&user, &req.roles, &req.permissions)
            .await?;
        info!(user_id = %created.id, email = %created.email, "user created with grants");
        Ok(created)
    }

    /// Loads a user with its full RBAC state resolved.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let Some(mut user) = self.store.find_by_id(id).await? else {
            return Ok(None);
        };
        user.roles = self.store.user_roles(id).await?;
        user.permissions = self.store.user_permissions(id).await?;
        Ok(Some(user))
    }

    pub async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        let Some(mut user) = self.store.find_by_email(email).await? else {
            return Ok(None);
        };
        user.roles = self.store.user_roles(user.id).await?;
        user.permissions = self.store.user_permissions(user.id).await?;
        Ok(Some(user))
    }

    /// Checks a password against the stored hash and returns the user with
    /// roles and permissions resolved for token issuance.
    #[instrument(skip(self, password))]
    pub async fn validate_credentials(&self, email: &str, password: &str) -> Result<User> {
        let user = self
            .get_by_email(email)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user: {email}")))?;

        if !verify_password(password, &user.password_hash)? {
            warn!(user_id = %user.id, "invalid password");
            return Err(Error::Unauthorized);
        }
        Ok(user)
    }

    pub async fn create_role(&self, name: &str, description: &str) -> Result<Role> {
        self.store.create_role(name, description).await
    }

    pub async fn create_permission(&self, name: &str, description: &str) -> Result<Permission> {
        self.store.create_permission(name, description).await
    }

    pub async fn grant_role_permission(&self, role_id: i32, permission_id: i32) -> Result<()> {
        self.store.grant_role_permission(role_id, permission_id).await
    }

    pub async fn assign_role(&self, user_id: Uuid, role_id: i32) -> Result<()> {
        self.store.assign_role(user_id, role_id).await
    }

    pub async fn remove_role(&self, user_id: Uuid, role_id: i32) -> Result<()> {
        self.store.remove_role(user_id, role_id).await
    }

    pub async fn assign_permission(&self, user_id: Uuid, permission_id: i32) -> Result<()> {
        self.store.assign_permission(user_id, permission_id).await
    }

    pub async fn remove_permission(&self, user_id: Uuid, permission_id: i32) -> Result<()> {
        self.store.remove_permission(user_id, permission_id).await
    }
}
