use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::error;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Signed claims. Access tokens carry the resolved role and permission name
/// sets; refresh tokens stay minimal (type marker and expiry only). `jti`
/// keeps two tokens minted in the same second distinct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub jti: Uuid,
    pub iat: usize,
    pub nbf: usize,
    pub exp: usize,
    pub kind: TokenKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed token")]
    Malformed,
}

impl From<TokenError> for error::Error {
    fn from(_: TokenError) -> Self {
        // the caller must not learn which check failed
        error::Error::Unauthorized
    }
}

/// HS256 signer/verifier. Pure local computation; no I/O and no state
/// beyond the configured secret and lifetimes.
#[derive(Clone)]
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenCodec {
    pub fn new(cfg: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            access_ttl: Duration::minutes(cfg.access_ttl_minutes),
            refresh_ttl: Duration::hours(cfg.refresh_ttl_hours),
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    fn sign(&self, claims: &Claims) -> error::Result<String> {
        let token = encode(&Header::default(), claims, &self.encoding)
            .map_err(|e| error::Error::Internal(e.into()))?;
        debug!(user_id = %claims.sub, kind = ?claims.kind, "token signed");
        Ok(token)
    }

    pub fn sign_access(
        &self,
        user_id: Uuid,
        roles: Vec<String>,
        permissions: Vec<String>,
    ) -> error::Result<String> {
        let now = OffsetDateTime::now_utc();
        self.sign(&Claims {
            sub: user_id,
            jti: Uuid::new_v4(),
            iat: unix(now),
            nbf: unix(now),
            exp: unix(now + self.access_ttl),
            kind: TokenKind::Access,
            roles,
            permissions,
        })
    }

    pub fn sign_refresh(&self, user_id: Uuid) -> error::Result<String> {
        let now = OffsetDateTime::now_utc();
        self.sign(&Claims {
            sub: user_id,
            jti: Uuid::new_v4(),
            iat: unix(now),
            nbf: unix(now),
            exp: unix(now + self.refresh_ttl),
            kind: TokenKind::Refresh,
            roles: Vec::new(),
            permissions: Vec::new(),
        })
    }

    /// Zero leeway: a token whose expiry equals "now" is already expired.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_nbf = true;
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature
                | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => {
                    TokenError::InvalidSignature
                }
                _ => TokenError::Malformed,
            }
        })?;
        Ok(data.claims)
    }

    pub fn verify_access(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.verify(token)?;
        if claims.kind != TokenKind::Access {
            return Err(TokenError::Malformed);
        }
        Ok(claims)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.verify(token)?;
        if claims.kind != TokenKind::Refresh {
            return Err(TokenError::Malformed);
        }
        Ok(claims)
    }
}

fn unix(at: OffsetDateTime) -> usize {
    at.unix_timestamp() as usize
}
