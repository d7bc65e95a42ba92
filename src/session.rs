//! Dual-token session issuance, rotation, and revocation intent.
//!
//! A session pairs a short-lived signed access token with a longer-lived
//! opaque refresh token. The refresh token is single-use: rotation mints
//! fresh material and permanently invalidates the old value. The manager
//! is pure over its inputs; persistence (including the compare-and-swap
//! that arbitrates concurrent rotations) belongs to the `SessionStore`.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::token::{
    AccessClaims, TOKEN_VERSION, TokenCodec, codec_from_config, compose_refresh_token,
    generate_opaque_token, hash_opaque_token, split_refresh_token,
};

/// Why a session stopped being valid. Persisted with the revocation so the
/// audit trail carries intent, not just a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Logout,
    PasswordChanged,
    TokenReuse,
    Expired,
    Admin,
}

/// Server-side session record. Holds only the refresh token *hash*; raw
/// token material never touches storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub refresh_token_hash: String,
    /// Access-token expiry. Always earlier than `refresh_expires_at`.
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub remember_me: bool,
    pub ip_address: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<RevocationReason>,
}

impl Session {
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// A session record bundled with the raw credentials to hand the client.
/// The raw values exist only in this struct, never in storage.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub access_token: String,
    pub refresh_token: String,
}

pub struct SessionManager {
    codec: Box<dyn TokenCodec>,
    issuer: String,
    audience: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    refresh_ttl_remember: Duration,
}

impl SessionManager {
    /// # Errors
    /// Returns an error if the configured signing key cannot be parsed.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let codec = codec_from_config(config.issuer(), config.audience(), config.signer())
            .context("failed to build token codec")?;
        Ok(Self {
            codec,
            issuer: config.issuer().to_string(),
            audience: config.audience().to_string(),
            access_ttl: config.access_ttl(),
            refresh_ttl: config.refresh_ttl(false),
            refresh_ttl_remember: config.refresh_ttl(true),
        })
    }

    fn refresh_ttl(&self, remember_me: bool) -> Duration {
        if remember_me {
            self.refresh_ttl_remember
        } else {
            self.refresh_ttl
        }
    }

    /// Issue a brand-new session with fresh access and refresh material.
    ///
    /// # Errors
    /// Returns an error if token generation or signing fails.
    pub fn issue(
        &self,
        user_id: Uuid,
        email: &str,
        remember_me: bool,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<IssuedSession> {
        let session_id = Uuid::new_v4();
        self.build(session_id, user_id, email, remember_me, ip_address, now, now)
    }

    /// Rotate a presented refresh token against its stored session.
    ///
    /// State machine: no stored session means `TokenInvalid`; an expired
    /// refresh window means `TokenExpired`; a constant-time mismatch means
    /// `TokenInvalid` — and the caller must treat that as a theft signal,
    /// because a legitimate client never resubmits a superseded token.
    /// On success the session keeps its id but every credential is fresh
    /// and the old refresh token is dead.
    ///
    /// # Errors
    /// See above; signing failures surface as `ServiceUnavailable`.
    pub fn rotate(
        &self,
        presented: &str,
        stored: Option<&Session>,
        now: DateTime<Utc>,
    ) -> Result<IssuedSession, AuthError> {
        let (session_id, secret) = split_refresh_token(presented)?;
        let Some(stored) = stored else {
            return Err(AuthError::TokenInvalid);
        };
        if stored.id != session_id || stored.is_revoked() {
            return Err(AuthError::TokenInvalid);
        }
        if now >= stored.refresh_expires_at {
            return Err(AuthError::TokenExpired);
        }
        let presented_hash = hash_opaque_token(secret);
        if !crate::compare::constant_time_eq_str(&presented_hash, &stored.refresh_token_hash) {
            return Err(AuthError::TokenInvalid);
        }

        self.build(
            stored.id,
            stored.user_id,
            &stored.email,
            stored.remember_me,
            stored.ip_address.as_deref(),
            stored.created_at,
            now,
        )
        .map_err(|err| {
            error!("session rotation failed to mint tokens: {err}");
            AuthError::ServiceUnavailable
        })
    }

    /// Verify an access token and return its claims.
    ///
    /// # Errors
    /// `TokenInvalid` or `TokenExpired` from the codec.
    pub fn verify_access(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessClaims, AuthError> {
        self.codec.verify(token, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        email: &str,
        remember_me: bool,
        ip_address: Option<&str>,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<IssuedSession> {
        let expires_at = now + self.access_ttl;
        let refresh_expires_at = now + self.refresh_ttl(remember_me);
        debug_assert!(expires_at < refresh_expires_at);

        let refresh_secret = generate_opaque_token()?;
        let refresh_token = compose_refresh_token(session_id, &refresh_secret);

        let claims = AccessClaims {
            v: TOKEN_VERSION,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: user_id.to_string(),
            email: email.to_string(),
            sid: session_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };
        let access_token = self.codec.sign(&claims)?;

        let session = Session {
            id: session_id,
            user_id,
            email: email.to_string(),
            refresh_token_hash: hash_opaque_token(&refresh_secret),
            expires_at,
            refresh_expires_at,
            created_at,
            remember_me,
            ip_address: ip_address.map(str::to_string),
            revoked_at: None,
            revocation_reason: None,
        };

        Ok(IssuedSession {
            session,
            access_token,
            refresh_token,
        })
    }
}
