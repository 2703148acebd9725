#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use keygate::auth::repo::SessionStore;
use keygate::auth::repo_types::RefreshToken;
use keygate::auth::services::AuthService;
use keygate::clock::Clock;
use keygate::config::{AppConfig, JwtConfig};
use keygate::error::{Error, Result};
use keygate::users::dto::CreateUserRequest;
use keygate::users::repo::{provision_in, DirectoryStore, GrantUnit};
use keygate::users::repo_types::{Permission, Role, User};
use keygate::users::services::UserService;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Adjustable clock so expiry arithmetic is deterministic in tests.
pub struct TestClock(Mutex<OffsetDateTime>);

impl TestClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self(Mutex::new(start))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for TestClock {
    fn now(&self) -> OffsetDateTime {
        *self.0.lock().unwrap()
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    rows: Mutex<Vec<RefreshToken>>,
}

impl MemorySessionStore {
    pub fn all(&self) -> Vec<RefreshToken> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, record: &RefreshToken) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|r| r.token == record.token) {
            return Err(Error::Internal(anyhow::anyhow!(
                "duplicate refresh token value"
            )));
        }
        rows.push(record.clone());
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.token == token)
            .cloned())
    }

    async fn active_for_user(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshToken>> {
        let mut records: Vec<RefreshToken> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id && r.is_active_at(now))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn active_for_device(
        &self,
        user_id: Uuid,
        device_identifier: &str,
        now: OffsetDateTime,
    ) -> Result<Option<RefreshToken>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.user_id == user_id
                    && r.device_identifier.as_deref() == Some(device_identifier)
                    && r.is_active_at(now)
            })
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn count_active(&self, user_id: Uuid, now: OffsetDateTime) -> Result<i64> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id && r.is_active_at(now))
            .count() as i64)
    }

    async fn mark_revoked(&self, record: &RefreshToken) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|r| r.id == record.id) {
            row.revoked = record.revoked;
            row.revoked_at = record.revoked_at;
            row.revoked_by_ip = record.revoked_by_ip.clone();
            row.replaced_by_token = record.replaced_by_token.clone();
        }
        Ok(())
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        ip: &str,
        now: OffsetDateTime,
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        for row in rows.iter_mut() {
            if row.user_id == user_id && row.is_active_at(now) {
                row.revoked = true;
                row.revoked_at = Some(now);
                row.revoked_by_ip = Some(ip.to_string());
            }
        }
        Ok(())
    }

    async fn revoke_oldest_if_over(
        &self,
        user_id: Uuid,
        max_keep: i64,
        ip: &str,
        now: OffsetDateTime,
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let mut active: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.user_id == user_id && r.is_active_at(now))
            .map(|(i, _)| i)
            .collect();
        if active.len() as i64 <= max_keep {
            return Ok(());
        }
        active.sort_by_key(|&i| rows[i].created_at);
        let excess = active.len() - max_keep as usize;
        for &i in active.iter().take(excess) {
            rows[i].revoked = true;
            rows[i].revoked_at = Some(now);
            rows[i].revoked_by_ip = Some(ip.to_string());
        }
        Ok(())
    }

    async fn purge_expired(&self, cutoff: OffsetDateTime) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|r| r.expires_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}

#[derive(Default, Clone)]
struct DirectoryState {
    users: Vec<User>,
    roles: Vec<Role>,
    permissions: Vec<Permission>,
    user_roles: Vec<(Uuid, i32)>,
    role_permissions: Vec<(i32, i32)>,
    user_permissions: Vec<(Uuid, i32)>,
    next_role_id: i32,
    next_permission_id: i32,
}

impl DirectoryState {
    fn role_with_permissions(&self, role: &Role) -> Role {
        let mut out = role.clone();
        out.permissions = self
            .role_permissions
            .iter()
            .filter(|(role_id, _)| *role_id == role.id)
            .filter_map(|(_, permission_id)| {
                self.permissions.iter().find(|p| p.id == *permission_id)
            })
            .cloned()
            .collect();
        out
    }

    fn roles_of(&self, user_id: Uuid) -> Vec<Role> {
        self.user_roles
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .filter_map(|(_, role_id)| self.roles.iter().find(|r| r.id == *role_id))
            .map(|role| self.role_with_permissions(role))
            .collect()
    }

    fn permissions_of(&self, user_id: Uuid) -> Vec<Permission> {
        let mut ids: Vec<i32> = self
            .user_permissions
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .map(|(_, pid)| *pid)
            .collect();
        for role in self.roles_of(user_id) {
            ids.extend(role.permissions.iter().map(|p| p.id));
        }
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter()
            .filter_map(|id| self.permissions.iter().find(|p| p.id == id).cloned())
            .collect()
    }
}

#[async_trait]
impl GrantUnit for DirectoryState {
    async fn insert_user(&mut self, user: &User) -> Result<()> {
        if self.users.iter().any(|u| u.email == user.email) {
            return Err(Error::Conflict(format!(
                "email already registered: {}",
                user.email
            )));
        }
        let mut stored = user.clone();
        stored.roles.clear();
        stored.permissions.clear();
        self.users.push(stored);
        Ok(())
    }

    async fn all_roles(&mut self) -> Result<Vec<Role>> {
        Ok(self.roles.clone())
    }

    async fn find_role_by_name(&mut self, name: &str) -> Result<Option<Role>> {
        Ok(self.roles.iter().find(|r| r.name == name).cloned())
    }

    async fn assign_role(&mut self, user_id: Uuid, role_id: i32) -> Result<()> {
        self.user_roles.push((user_id, role_id));
        Ok(())
    }

    async fn all_permissions(&mut self) -> Result<Vec<Permission>> {
        Ok(self.permissions.clone())
    }

    async fn find_permission_by_name(&mut self, name: &str) -> Result<Option<Permission>> {
        Ok(self.permissions.iter().find(|p| p.name == name).cloned())
    }

    async fn assign_permission(&mut self, user_id: Uuid, permission_id: i32) -> Result<()> {
        self.user_permissions.push((user_id, permission_id));
        Ok(())
    }

    async fn user_roles(&mut self, user_id: Uuid) -> Result<Vec<Role>> {
        Ok(self.roles_of(user_id))
    }

    async fn user_permissions(&mut self, user_id: Uuid) -> Result<Vec<Permission>> {
        Ok(self.permissions_of(user_id))
    }
}

/// In-memory directory. `create_with_grants` stages every write on a copy
/// of the state and swaps it in only on success, mirroring a transaction
/// rollback.
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
}

impl MemoryDirectory {
    pub fn seed_permission(&self, name: &str) -> i32 {
        let mut state = self.state.lock().unwrap();
        if let Some(permission) = state.permissions.iter().find(|p| p.name == name) {
            return permission.id;
        }
        state.next_permission_id += 1;
        let id = state.next_permission_id;
        state.permissions.push(Permission {
            id,
            name: name.to_string(),
            description: None,
        });
        id
    }

    pub fn seed_role(&self, name: &str, permission_names: &[&str]) -> i32 {
        let permission_ids: Vec<i32> = permission_names
            .iter()
            .map(|name| self.seed_permission(name))
            .collect();
        let mut state = self.state.lock().unwrap();
        state.next_role_id += 1;
        let id = state.next_role_id;
        state.roles.push(Role {
            id,
            name: name.to_string(),
            description: None,
            permissions: Vec::new(),
        });
        for permission_id in permission_ids {
            state.role_permissions.push((id, permission_id));
        }
        id
    }

    /// (user_roles, user_permissions) join-row counts, for rollback checks.
    pub fn join_rows(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.user_roles.len(), state.user_permissions.len())
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectory {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|u| u.id == id && u.deleted_at.is_none())
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|u| u.email == email && u.deleted_at.is_none())
            .cloned())
    }

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<Role>> {
        Ok(self.state.lock().unwrap().roles_of(user_id))
    }

    async fn user_permissions(&self, user_id: Uuid) -> Result<Vec<Permission>> {
        Ok(self.state.lock().unwrap().permissions_of(user_id))
    }

    async fn create_role(&self, name: &str, description: &str) -> Result<Role> {
        let mut state = self.state.lock().unwrap();
        state.next_role_id += 1;
        let role = Role {
            id: state.next_role_id,
            name: name.to_string(),
            description: Some(description.to_string()),
            permissions: Vec::new(),
        };
        state.roles.push(role.clone());
        Ok(role)
    }

    async fn create_permission(&self, name: &str, description: &str) -> Result<Permission> {
        let mut state = self.state.lock().unwrap();
        state.next_permission_id += 1;
        let permission = Permission {
            id: state.next_permission_id,
            name: name.to_string(),
            description: Some(description.to_string()),
        };
        state.permissions.push(permission.clone());
        Ok(permission)
    }

    async fn grant_role_permission(&self, role_id: i32, permission_id: i32) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .role_permissions
            .push((role_id, permission_id));
        Ok(())
    }

    async fn assign_role(&self, user_id: Uuid, role_id: i32) -> Result<()> {
        self.state.lock().unwrap().user_roles.push((user_id, role_id));
        Ok(())
    }

    async fn remove_role(&self, user_id: Uuid, role_id: i32) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .user_roles
            .retain(|(uid, rid)| !(*uid == user_id && *rid == role_id));
        Ok(())
    }

    async fn assign_permission(&self, user_id: Uuid, permission_id: i32) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .user_permissions
            .push((user_id, permission_id));
        Ok(())
    }

    async fn remove_permission(&self, user_id: Uuid, permission_id: i32) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .user_permissions
            .retain(|(uid, pid)| !(*uid == user_id && *pid == permission_id));
        Ok(())
    }

    async fn create_with_grants(
        &self,
        user: &User,
        role_names: &[String],
        permission_names: &[String],
    ) -> Result<User> {
        let mut staged = self.state.lock().unwrap().clone();
        let (roles, permissions) =
            provision_in(&mut staged, user, role_names, permission_names).await?;
        *self.state.lock().unwrap() = staged;

        let mut created = user.clone();
        created.roles = roles;
        created.permissions = permissions;
        Ok(created)
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "postgres://localhost/keygate-test".into(),
        jwt: JwtConfig {
            secret: "test-secret".into(),
            access_ttl_minutes: 5,
            refresh_ttl_hours: 24,
        },
        max_sessions_per_user: 3,
    }
}

pub struct TestAuthority {
    pub auth: AuthService,
    pub directory: Arc<MemoryDirectory>,
    pub sessions: Arc<MemorySessionStore>,
    pub clock: Arc<TestClock>,
}

pub fn authority() -> TestAuthority {
    init_tracing();
    let clock = Arc::new(TestClock::new(datetime!(2024-05-01 12:00 UTC)));
    let directory = Arc::new(MemoryDirectory::default());
    let sessions = Arc::new(MemorySessionStore::default());
    let users = UserService::new(directory.clone(), clock.clone());
    let auth = AuthService::new(&test_config(), users, sessions.clone(), clock.clone());
    TestAuthority {
        auth,
        directory,
        sessions,
        clock,
    }
}

pub fn register_request(
    email: &str,
    password: &str,
    roles: &[&str],
    permissions: &[&str],
) -> CreateUserRequest {
    CreateUserRequest {
        email: email.into(),
        password: password.into(),
        password_confirmation: password.into(),
        first_name: "Test".into(),
        last_name: "User".into(),
        middle_name: String::new(),
        phone: String::new(),
        position: String::new(),
        active: true,
        roles: roles.iter().map(|s| s.to_string()).collect(),
        permissions: permissions.iter().map(|s| s.to_string()).collect(),
    }
}
