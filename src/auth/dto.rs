use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// Caller metadata supplied explicitly by the boundary layer, replacing
/// request values smuggled through a context bag.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestMetadata {
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            user_agent: Some(user_agent.into()),
        }
    }

    pub fn client_ip(&self) -> &str {
        self.ip.as_deref().unwrap_or("unknown")
    }

    /// Deterministic fingerprint of network address and agent string; a
    /// random identifier when either part is missing, so an anonymous
    /// caller never collides with a real device.
    pub fn device_identifier(&self) -> String {
        match (self.ip.as_deref(), self.user_agent.as_deref()) {
            (Some(ip), Some(agent)) => format!("{ip}-{agent}"),
            _ => Uuid::new_v4().to_string(),
        }
    }
}

/// Token pair returned by register, login and refresh.
#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub access_expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    pub id: Uuid,
    pub tokens: AuthResponse,
}
