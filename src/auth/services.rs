use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::auth::dto::{AuthResponse, RegisterResponse, RequestMetadata};
use crate::auth::jwt::TokenCodec;
use crate::auth::repo::SessionStore;
use crate::auth::repo_types::RefreshToken;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::users::dto::CreateUserRequest;
use crate::users::repo_types::User;
use crate::users::services::UserService;

const TOKEN_TYPE: &str = "Bearer";
/// Expired rows stay queryable for a day before the sweep deletes them.
const PURGE_GRACE: Duration = Duration::hours(24);

/// Coordinates login, registration, refresh and revocation over the user
/// directory and the session store; owns the rotation and device-limit
/// algorithm.
pub struct AuthService {
    users: UserService,
    sessions: Arc<dyn SessionStore>,
    codec: TokenCodec,
    clock: Arc<dyn Clock>,
    max_sessions: i64,
}

impl AuthService {
    pub fn new(
        cfg: &AppConfig,
        users: UserService,
        sessions: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            users,
            sessions,
            codec: TokenCodec::new(&cfg.jwt),
            clock,
            max_sessions: cfg.max_sessions_per_user,
        }
    }

    /// Access-token verification handle for the boundary layer.
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    #[instrument(skip(self, req, meta), fields(email = %req.email))]
    pub async fn register(
        &self,
        req: CreateUserRequest,
        meta: &RequestMetadata,
    ) -> Result<RegisterResponse> {
        let user = self.users.create(req).await?;
        let tokens = self.issue_tokens(&user, meta).await?;
        info!(user_id = %user.id, "user registered");
        Ok(RegisterResponse {
            id: user.id,
            tokens,
        })
    }

    #[instrument(skip(self, password, meta))]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        meta: &RequestMetadata,
    ) -> Result<AuthResponse> {
        let user = self.users.validate_credentials(email, password).await?;
        info!(user_id = %user.id, "user logged in");
        self.issue_tokens(&user, meta).await
    }

    /// Exchanges an active refresh token for a new pair, then chains the
    /// presented record to the new refresh string and marks it revoked.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str, meta: &RequestMetadata) -> Result<AuthResponse> {
        let now = self.clock.now();
        let mut stored = self
            .sessions
            .find_by_token(refresh_token)
            .await?
            .ok_or(Error::Unauthorized)?;
        if !stored.is_active_at(now) {
            return Err(Error::Unauthorized);
        }

        let user = self
            .users
            .get_by_id(stored.user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user: {}", stored.user_id)))?;

        let response = self.issue_tokens(&user, meta).await?;

        // The caller already holds the new pair; a late failure to persist
        // the rotation must not take it back.
        stored.revoke(
            self.clock.now(),
            meta.client_ip(),
            Some(response.refresh_token.clone()),
        );
        if let Err(err) = self.sessions.mark_revoked(&stored).await {
            warn!(error = %err, token_id = %stored.id, "failed to persist refresh rotation");
        }

        Ok(response)
    }

    #[instrument(skip_all)]
    pub async fn revoke(&self, refresh_token: &str, meta: &RequestMetadata) -> Result<()> {
        let mut stored = self
            .sessions
            .find_by_token(refresh_token)
            .await?
            .ok_or_else(|| Error::NotFound("refresh token".into()))?;
        stored.revoke(self.clock.now(), meta.client_ip(), None);
        self.sessions.mark_revoked(&stored).await
    }

    /// Revokes every active session of a user, e.g. after a password change.
    /// A second call is a no-op on the already-inactive rows.
    #[instrument(skip(self, meta))]
    pub async fn revoke_all(&self, user_id: Uuid, meta: &RequestMetadata) -> Result<()> {
        self.sessions
            .revoke_all_for_user(user_id, meta.client_ip(), self.clock.now())
            .await
    }

    pub async fn active_sessions(&self, user_id: Uuid) -> Result<Vec<RefreshToken>> {
        self.sessions
            .active_for_user(user_id, self.clock.now())
            .await
    }

    /// Purges session rows expired more than 24 hours ago.
    pub async fn sweep_expired(&self) -> Result<u64> {
        self.sessions
            .purge_expired(self.clock.now() - PURGE_GRACE)
            .await
    }

    async fn issue_tokens(&self, user: &User, meta: &RequestMetadata) -> Result<AuthResponse> {
        let now = self.clock.now();
        let roles = user.role_names();
        let permissions: Vec<String> = user.effective_permission_names().into_iter().collect();

        let access_token = self.codec.sign_access(user.id, roles, permissions)?;
        let refresh_token = self.codec.sign_refresh(user.id)?;
        let access_expires_at = now + self.codec.access_ttl();
        let refresh_expires_at = now + self.codec.refresh_ttl();

        self.admit_session(user.id, &refresh_token, refresh_expires_at, meta, now)
            .await?;

        Ok(AuthResponse {
            access_token,
            refresh_token,
            token_type: TOKEN_TYPE.to_string(),
            expires_in: self.codec.access_ttl().whole_seconds(),
            access_expires_at,
        })
    }

    /// Session admission: one active session per device, at most
    /// `max_sessions` active sessions per user. Device rotation and cap
    /// enforcement are best-effort; only the final insert fails issuance.
    async fn admit_session(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
        meta: &RequestMetadata,
        now: OffsetDateTime,
    ) -> Result<()> {
        let device_identifier = meta.device_identifier();
        let ip = meta.client_ip();

        match self
            .sessions
            .active_for_device(user_id, &device_identifier, now)
            .await
        {
            Ok(Some(mut existing)) => {
                existing.revoke(now, ip, Some(token.to_string()));
                if let Err(err) = self.sessions.mark_revoked(&existing).await {
                    warn!(error = %err, user_id = %user_id, device = %device_identifier,
                        "failed to rotate device session");
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, user_id = %user_id, device = %device_identifier,
                    "device session lookup failed");
            }
        }

        if let Err(err) = self
            .sessions
            .revoke_oldest_if_over(user_id, self.max_sessions - 1, ip, now)
            .await
        {
            warn!(error = %err, user_id = %user_id, "failed to enforce session cap");
        }

        let record = RefreshToken {
            id: Uuid::new_v4(),
            user_id,
            token: token.to_string(),
            expires_at,
            revoked: false,
            created_at: now,
            created_by_ip: ip.to_string(),
            revoked_at: None,
            revoked_by_ip: None,
            replaced_by_token: None,
            device_identifier: Some(device_identifier),
        };
        self.sessions.insert(&record).await
    }
}
