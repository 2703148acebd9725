use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// One refresh credential, active or historical. Rotation chains records
/// through `replaced_by_token`; rows are only deleted by the expiry sweep.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub expires_at: OffsetDateTime,
    pub revoked: bool,
    pub created_at: OffsetDateTime,
    pub created_by_ip: String,
    pub revoked_at: Option<OffsetDateTime>,
    pub revoked_by_ip: Option<String>,
    pub replaced_by_token: Option<String>,
    pub device_identifier: Option<String>,
}

impl RefreshToken {
    /// A record expiring exactly at `now` is already expired.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        !self.revoked && !self.is_expired_at(now)
    }

    pub fn revoke(&mut self, now: OffsetDateTime, ip: &str, replaced_by_token: Option<String>) {
        self.revoked = true;
        self.revoked_at = Some(now);
        self.revoked_by_ip = Some(ip.to_string());
        self.replaced_by_token = replaced_by_token;
    }
}
