use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::RefreshToken;
use crate::error::Result;

/// Persistence for refresh-token session records. Activity filters take the
/// caller's `now` so the clock stays injectable end to end.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, record: &RefreshToken) -> Result<()>;
    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>>;
    async fn active_for_user(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshToken>>;
    /// Newest active record for one device, if any.
    async fn active_for_device(
        &self,
        user_id: Uuid,
        device_identifier: &str,
        now: OffsetDateTime,
    ) -> Result<Option<RefreshToken>>;
    async fn count_active(&self, user_id: Uuid, now: OffsetDateTime) -> Result<i64>;
    /// Persists the revocation fields of an already-revoked record.
    async fn mark_revoked(&self, record: &RefreshToken) -> Result<()>;
    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        ip: &str,
        now: OffsetDateTime,
    ) -> Result<()>;
    /// Revokes the oldest active sessions until at most `max_keep` remain.
    async fn revoke_oldest_if_over(
        &self,
        user_id: Uuid,
        max_keep: i64,
        ip: &str,
        now: OffsetDateTime,
    ) -> Result<()>;
    /// Deletes rows that expired before `cutoff`; returns how many went.
    async fn purge_expired(&self, cutoff: OffsetDateTime) -> Result<u64>;
}

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const TOKEN_COLUMNS: &str = "id, user_id, token, expires_at, revoked, created_at, created_by_ip, \
     revoked_at, revoked_by_ip, replaced_by_token, device_identifier";

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, record: &RefreshToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens
            (id, user_id, token, expires_at, revoked, created_at, created_by_ip, device_identifier)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.token)
        .bind(record.expires_at)
        .bind(record.revoked)
        .bind(record.created_at)
        .bind(&record.created_by_ip)
        .bind(&record.device_identifier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>> {
        let record = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn active_for_user(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<RefreshToken>> {
        let records = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens \
             WHERE user_id = $1 AND revoked = false AND expires_at > $2 \
             ORDER BY created_at ASC"
        ))
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn active_for_device(
        &self,
        user_id: Uuid,
        device_identifier: &str,
        now: OffsetDateTime,
    ) -> Result<Option<RefreshToken>> {
        let record = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens \
             WHERE user_id = $1 AND device_identifier = $2 \
               AND revoked = false AND expires_at > $3 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .bind(device_identifier)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn count_active(&self, user_id: Uuid, now: OffsetDateTime) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM refresh_tokens \
             WHERE user_id = $1 AND revoked = false AND expires_at > $2",
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn mark_revoked(&self, record: &RefreshToken) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = $1, revoked_at = $2, revoked_by_ip = $3, replaced_by_token = $4
            WHERE id = $5
            "#,
        )
        .bind(record.revoked)
        .bind(record.revoked_at)
        .bind(&record.revoked_by_ip)
        .bind(&record.replaced_by_token)
        .bind(record.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        ip: &str,
        now: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = true, revoked_at = $1, revoked_by_ip = $2
            WHERE user_id = $3 AND revoked = false AND expires_at > $4
            "#,
        )
        .bind(now)
        .bind(ip)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_oldest_if_over(
        &self,
        user_id: Uuid,
        max_keep: i64,
        ip: &str,
        now: OffsetDateTime,
    ) -> Result<()> {
        let count = self.count_active(user_id, now).await?;
        if count <= max_keep {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = true, revoked_at = $1, revoked_by_ip = $2
            WHERE id IN (
                SELECT id FROM refresh_tokens
                WHERE user_id = $3 AND revoked = false AND expires_at > $4
                ORDER BY created_at ASC
                LIMIT $5
            )
            "#,
        )
        .bind(now)
        .bind(ip)
        .bind(user_id)
        .bind(now)
        .bind(count - max_keep)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self, cutoff: OffsetDateTime) -> Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
