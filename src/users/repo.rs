use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::users::repo_types::{Permission, Role, User};

/// Reads and mutations of the user directory and RBAC catalog.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;
    /// Assigned roles, each with its permissions loaded.
    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<Role>>;
    /// Direct grants unioned with role-derived permissions.
    async fn user_permissions(&self, user_id: Uuid) -> Result<Vec<Permission>>;

    async fn create_role(&self, name: &str, description: &str) -> Result<Role>;
    async fn create_permission(&self, name: &str, description: &str) -> Result<Permission>;
    async fn grant_role_permission(&self, role_id: i32, permission_id: i32) -> Result<()>;
    async fn assign_role(&self, user_id: Uuid, role_id: i32) -> Result<()>;
    async fn remove_role(&self, user_id: Uuid, role_id: i32) -> Result<()>;
    async fn assign_permission(&self, user_id: Uuid, permission_id: i32) -> Result<()>;
    async fn remove_permission(&self, user_id: Uuid, permission_id: i32) -> Result<()>;

    /// Creates the user row and attaches the requested roles and permissions
    /// in one atomic unit of work; nothing survives a failure.
    async fn create_with_grants(
        &self,
        user: &User,
        role_names: &[String],
        permission_names: &[String],
    ) -> Result<User>;
}

/// The granular operations available inside one atomic unit of work.
/// Implemented by a live database transaction and by the in-memory test
/// directory's staged state.
#[async_trait]
pub trait GrantUnit: Send {
    async fn insert_user(&mut self, user: &User) -> Result<()>;
    async fn all_roles(&mut self) -> Result<Vec<Role>>;
    async fn find_role_by_name(&mut self, name: &str) -> Result<Option<Role>>;
    async fn assign_role(&mut self, user_id: Uuid, role_id: i32) -> Result<()>;
    async fn all_permissions(&mut self) -> Result<Vec<Permission>>;
    async fn find_permission_by_name(&mut self, name: &str) -> Result<Option<Permission>>;
    async fn assign_permission(&mut self, user_id: Uuid, permission_id: i32) -> Result<()>;
    async fn user_roles(&mut self, user_id: Uuid) -> Result<Vec<Role>>;
    async fn user_permissions(&mut self, user_id: Uuid) -> Result<Vec<Permission>>;
}

/// Provisioning algorithm shared by every [`GrantUnit`] implementation:
/// insert the user, assign requested roles and permissions by catalog
/// lookup with a by-name fallback, abort on the first unknown name, then
/// re-read the grants inside the same unit of work for the response.
pub async fn provision_in<U>(
    uow: &mut U,
    user: &User,
    role_names: &[String],
    permission_names: &[String],
) -> Result<(Vec<Role>, Vec<Permission>)>
where
    U: GrantUnit + ?Sized,
{
    uow.insert_user(user).await?;

    let catalog = uow.all_roles().await?;
    let roles_by_name: HashMap<&str, i32> =
        catalog.iter().map(|r| (r.name.as_str(), r.id)).collect();
    for name in role_names {
        if let Some(&role_id) = roles_by_name.get(name.as_str()) {
            uow.assign_role(user.id, role_id).await?;
            continue;
        }
        // The catalog snapshot may have drifted within the transaction.
        match uow.find_role_by_name(name).await? {
            Some(role) => uow.assign_role(user.id, role.id).await?,
            None => return Err(Error::NotFound(format!("role: {name}"))),
        }
    }

    let catalog = uow.all_permissions().await?;
    let permissions_by_name: HashMap<&str, i32> =
        catalog.iter().map(|p| (p.name.as_str(), p.id)).collect();
    for name in permission_names {
        if let Some(&permission_id) = permissions_by_name.get(name.as_str()) {
            uow.assign_permission(user.id, permission_id).await?;
            continue;
        }
        match uow.find_permission_by_name(name).await? {
            Some(permission) => uow.assign_permission(user.id, permission.id).await?,
            None => return Err(Error::NotFound(format!("permission: {name}"))),
        }
    }

    let roles = uow.user_roles(user.id).await?;
    let permissions = uow.user_permissions(user.id).await?;
    Ok((roles, permissions))
}

pub struct PgDirectoryStore {
    pool: PgPool,
}

impl PgDirectoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const USER_COLUMNS: &str = "id, email, password_hash, first_name, last_name, middle_name, \
     phone, position, active, email_verified, last_login, created_at, updated_at, deleted_at";

async fn load_role_permissions(pool: &PgPool, roles: &mut [Role]) -> Result<()> {
    for role in roles.iter_mut() {
        role.permissions = sqlx::query_as::<_, Permission>(
            r#"
            SELECT p.id, p.name, p.description
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            WHERE rp.role_id = $1
            "#,
        )
        .bind(role.id)
        .fetch_all(pool)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl DirectoryStore for PgDirectoryStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1 AND deleted_at IS NULL"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<Role>> {
        let mut roles = sqlx::query_as::<_, Role>(
            r#"
            SELECT r.id, r.name, r.description
            FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        load_role_permissions(&self.pool, &mut roles).await?;
        Ok(roles)
    }

    async fn user_permissions(&self, user_id: Uuid) -> Result<Vec<Permission>> {
        let permissions = sqlx::query_as::<_, Permission>(
            r#"
            SELECT DISTINCT p.id, p.name, p.description
            FROM permissions p
            JOIN user_permissions up ON up.permission_id = p.id
            WHERE up.user_id = $1

            UNION

            SELECT DISTINCT p.id, p.name, p.description
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            JOIN user_roles ur ON ur.role_id = rp.role_id
            WHERE ur.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(permissions)
    }

    async fn create_role(&self, name: &str, description: &str) -> Result<Role> {
        let role = sqlx::query_as::<_, Role>(
            r#"
            INSERT INTO roles (name, description)
            VALUES ($1, $2)
            RETURNING id, name, description
            "#,
        )
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;
        Ok(role)
    }

    async fn create_permission(&self, name: &str, description: &str) -> Result<Permission> {
        let permission = sqlx::query_as::<_, Permission>(
            r#"
            INSERT INTO permissions (name, description)
            VALUES ($1, $2)
            RETURNING id, name, description
            "#,
        )
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;
        Ok(permission)
    }

    async fn grant_role_permission(&self, role_id: i32, permission_id: i32) -> Result<()> {
        sqlx::query("INSERT INTO role_permissions (role_id, permission_id) VALUES ($1, $2)")
            .bind(role_id)
            .bind(permission_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn assign_role(&self, user_id: Uuid, role_id: i32) -> Result<()> {
        sqlx::query("INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2)")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_role(&self, user_id: Uuid, role_id: i32) -> Result<()> {
        sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn assign_permission(&self, user_id: Uuid, permission_id: i32) -> Result<()> {
        sqlx::query("INSERT INTO user_permissions (user_id, permission_id) VALUES ($1, $2)")
            .bind(user_id)
            .bind(permission_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_permission(&self, user_id: Uuid, permission_id: i32) -> Result<()> {
        sqlx::query("DELETE FROM user_permissions WHERE user_id = $1 AND permission_id = $2")
            .bind(user_id)
            .bind(permission_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_with_grants(
        &self,
        user: &User,
        role_names: &[String],
        permission_names: &[String],
    ) -> Result<User> {
        let mut tx = self.pool.begin().await?;
        // An error drops the transaction, rolling back the user row and any
        // grants already attached.
        let (roles, permissions) =
            provision_in(&mut tx, user, role_names, permission_names).await?;
        tx.commit().await?;

        debug!(user_id = %user.id, roles = roles.len(), permissions = permissions.len(),
            "user provisioned");
        let mut created = user.clone();
        created.roles = roles;
        created.permissions = permissions;
        Ok(created)
    }
}

#[async_trait]
impl GrantUnit for Transaction<'_, Postgres> {
    async fn insert_user(&mut self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (
                id, email, password_hash, first_name, last_name, middle_name,
                phone, position, active, email_verified, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.middle_name)
        .bind(&user.phone)
        .bind(&user.position)
        .bind(user.active)
        .bind(user.email_verified)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut **self)
        .await?;
        Ok(())
    }

    async fn all_roles(&mut self) -> Result<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>("SELECT id, name, description FROM roles")
            .fetch_all(&mut **self)
            .await?;
        Ok(roles)
    }

    async fn find_role_by_name(&mut self, name: &str) -> Result<Option<Role>> {
        let role =
            sqlx::query_as::<_, Role>("SELECT id, name, description FROM roles WHERE name = $1")
                .bind(name)
                .fetch_optional(&mut **self)
                .await?;
        Ok(role)
    }

    async fn assign_role(&mut self, user_id: Uuid, role_id: i32) -> Result<()> {
        sqlx::query("INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2)")
            .bind(user_id)
            .bind(role_id)
            .execute(&mut **self)
            .await?;
        Ok(())
    }

    async fn all_permissions(&mut self) -> Result<Vec<Permission>> {
        let permissions =
            sqlx::query_as::<_, Permission>("SELECT id, name, description FROM permissions")
                .fetch_all(&mut **self)
                .await?;
        Ok(permissions)
    }

    async fn find_permission_by_name(&mut self, name: &str) -> Result<Option<Permission>> {
        let permission = sqlx::query_as::<_, Permission>(
            "SELECT id, name, description FROM permissions WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&mut **self)
        .await?;
        Ok(permission)
    }

    async fn assign_permission(&mut self, user_id: Uuid, permission_id: i32) -> Result<()> {
        sqlx::query("INSERT INTO user_permissions (user_id, permission_id) VALUES ($1, $2)")
            .bind(user_id)
            .bind(permission_id)
            .execute(&mut **self)
            .await?;
        Ok(())
    }

    async fn user_roles(&mut self, user_id: Uuid) -> Result<Vec<Role>> {
        let mut roles = sqlx::query_as::<_, Role>(
            r#"
            SELECT r.id, r.name, r.description
            FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut **self)
        .await?;
        for role in roles.iter_mut() {
            role.permissions = sqlx::query_as::<_, Permission>(
                r#"
                SELECT p.id, p.name, p.description
                FROM permissions p
                JOIN role_permissions rp ON rp.permission_id = p.id
                WHERE rp.role_id = $1
                "#,
            )
            .bind(role.id)
            .fetch_all(&mut **self)
            .await?;
        }
        Ok(roles)
    }

    async fn user_permissions(&mut self, user_id: Uuid) -> Result<Vec<Permission>> {
        let permissions = sqlx::query_as::<_, Permission>(
            r#"
            SELECT DISTINCT p.id, p.name, p.description
            FROM permissions p
            JOIN user_permissions up ON up.permission_id = p.id
            WHERE up.user_id = $1

            UNION

            SELECT DISTINCT p.id, p.name, p.description
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            JOIN user_roles ur ON ur.role_id = rp.role_id
            WHERE ur.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut **self)
        .await?;
        Ok(permissions)
    }
}
