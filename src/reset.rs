//! Single-use, time-limited password-reset tokens.
//!
//! `initiate` always succeeds with token material regardless of whether the
//! email maps to an account; whether anything is actually sent is the
//! caller's decision, which keeps account enumeration out of this layer.
//! `validate` and `consume` are separate steps so a token can be checked
//! for UI purposes without being burned.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compare::constant_time_eq_str;
use crate::config::AuthConfig;
use crate::credentials::normalize_email;
use crate::error::AuthError;
use crate::token::{generate_opaque_token, hash_opaque_token};

/// Pending reset request, owned by the persistence boundary. Stores only
/// the token hash; `used_at` once set is permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordResetRequest {
    pub id: Uuid,
    pub email: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl PasswordResetRequest {
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }
}

/// Outcome of a non-destructive token check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTokenStatus {
    Valid,
    NotFound,
    AlreadyUsed,
    Expired,
    Mismatch,
}

impl ResetTokenStatus {
    /// Collapse into the generic error taxonomy. Everything except expiry
    /// maps to `TokenInvalid`, so callers cannot tell a wrong token from a
    /// burned one.
    pub fn into_result(self) -> Result<(), AuthError> {
        match self {
            Self::Valid => Ok(()),
            Self::Expired => Err(AuthError::TokenExpired),
            Self::NotFound | Self::AlreadyUsed | Self::Mismatch => Err(AuthError::TokenInvalid),
        }
    }
}

pub struct PasswordResetManager {
    ttl: Duration,
}

impl PasswordResetManager {
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            ttl: config.reset_ttl(),
        }
    }

    /// Mint a reset token for an email. Always returns success-shaped data;
    /// the caller decides whether anything gets delivered.
    ///
    /// # Errors
    /// `ServiceUnavailable` only if the randomness source fails.
    pub fn initiate(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<(PasswordResetRequest, String), AuthError> {
        let raw_token = generate_opaque_token().map_err(|_| AuthError::ServiceUnavailable)?;
        let request = PasswordResetRequest {
            id: Uuid::new_v4(),
            email: normalize_email(email),
            token_hash: hash_opaque_token(&raw_token),
            expires_at: now + self.ttl,
            created_at: now,
            used_at: None,
        };
        Ok((request, raw_token))
    }

    /// Check a presented token against a stored request without burning it.
    #[must_use]
    pub fn validate(
        &self,
        raw_token: &str,
        stored: Option<&PasswordResetRequest>,
        now: DateTime<Utc>,
    ) -> ResetTokenStatus {
        let Some(stored) = stored else {
            return ResetTokenStatus::NotFound;
        };
        if stored.is_used() {
            return ResetTokenStatus::AlreadyUsed;
        }
        if now >= stored.expires_at {
            return ResetTokenStatus::Expired;
        }
        if !constant_time_eq_str(&hash_opaque_token(raw_token.trim()), &stored.token_hash) {
            return ResetTokenStatus::Mismatch;
        }
        ResetTokenStatus::Valid
    }

    /// Burn a validated token. Explicitly separate from `validate`.
    ///
    /// # Errors
    /// `TokenInvalid` if already used, `TokenExpired` past the deadline.
    pub fn consume(
        &self,
        stored: &mut PasswordResetRequest,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        if stored.is_used() {
            return Err(AuthError::TokenInvalid);
        }
        if now >= stored.expires_at {
            return Err(AuthError::TokenExpired);
        }
        stored.used_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{PasswordResetManager, ResetTokenStatus};
    use crate::config::{AuthConfig, SignerConfig};
    use crate::error::AuthError;
    use anyhow::Result;
    use chrono::{Duration, Utc};

    fn manager() -> PasswordResetManager {
        let config = AuthConfig::new(
            "https://auth.test".to_string(),
            "gardi".to_string(),
            SignerConfig::Hmac {
                key: vec![1u8; 32],
                kid: "k1".to_string(),
            },
        );
        PasswordResetManager::from_config(&config)
    }

    #[test]
    fn initiate_normalizes_email_and_sets_ttl() -> Result<()> {
        let now = Utc::now();
        let (request, raw) = manager()
            .initiate(" Parent@Example.COM ", now)
            .map_err(|e| anyhow::anyhow!(e))?;
        assert_eq!(request.email, "parent@example.com");
        assert_eq!(request.expires_at, now + Duration::hours(1));
        assert!(!raw.is_empty());
        assert_ne!(request.token_hash, raw);
        Ok(())
    }

    #[test]
    fn validate_distinguishes_reasons_internally() -> Result<()> {
        let manager = manager();
        let now = Utc::now();
        let (stored, raw) = manager
            .initiate("a@example.com", now)
            .map_err(|e| anyhow::anyhow!(e))?;

        assert_eq!(
            manager.validate(&raw, Some(&stored), now),
            ResetTokenStatus::Valid
        );
        assert_eq!(manager.validate(&raw, None, now), ResetTokenStatus::NotFound);
        assert_eq!(
            manager.validate("wrong", Some(&stored), now),
            ResetTokenStatus::Mismatch
        );
        assert_eq!(
            manager.validate(&raw, Some(&stored), now + Duration::hours(2)),
            ResetTokenStatus::Expired
        );
        Ok(())
    }

    #[test]
    fn consume_is_single_use() -> Result<()> {
        let manager = manager();
        let now = Utc::now();
        let (mut stored, raw) = manager
            .initiate("a@example.com", now)
            .map_err(|e| anyhow::anyhow!(e))?;

        manager
            .consume(&mut stored, now)
            .map_err(|e| anyhow::anyhow!(e))?;
        assert_eq!(stored.used_at, Some(now));

        // Second consume fails and validate now reports the token burned.
        assert_eq!(
            manager.consume(&mut stored, now).err(),
            Some(AuthError::TokenInvalid)
        );
        assert_eq!(
            manager.validate(&raw, Some(&stored), now),
            ResetTokenStatus::AlreadyUsed
        );
        Ok(())
    }

    #[test]
    fn status_collapses_to_generic_errors() {
        assert!(ResetTokenStatus::Valid.into_result().is_ok());
        assert_eq!(
            ResetTokenStatus::NotFound.into_result().err(),
            Some(AuthError::TokenInvalid)
        );
        assert_eq!(
            ResetTokenStatus::AlreadyUsed.into_result().err(),
            Some(AuthError::TokenInvalid)
        );
        assert_eq!(
            ResetTokenStatus::Expired.into_result().err(),
            Some(AuthError::TokenExpired)
        );
    }
}
