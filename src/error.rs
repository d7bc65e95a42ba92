//! Error taxonomy for the auth core.
//!
//! Expected control-flow failures (bad credentials, lockouts, dead tokens)
//! are typed variants; unexpected downstream failures are collapsed into
//! `ServiceUnavailable` at the facade boundary so no internal detail leaks.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Typed outcome of every auth operation.
///
/// Messages are intentionally generic: a credential failure never reveals
/// whether the account exists or which check rejected it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Bad format or wrong secret. Ambiguous on purpose.
    #[error("invalid credentials")]
    InvalidCredentials {
        /// Remaining attempts for the email dimension only; `None` when the
        /// failure was a format rejection that never reached the limiter.
        attempts_remaining: Option<u32>,
    },
    /// The source IP is inside a lockout window.
    #[error("too many requests")]
    RateLimited { locked_until: DateTime<Utc> },
    /// The account (email key) is inside a lockout window.
    #[error("account temporarily locked")]
    AccountLocked { locked_until: DateTime<Utc> },
    /// Malformed, mismatched, or reused token. Callers must treat a
    /// rotation mismatch as a theft signal and revoke the user's sessions.
    #[error("invalid token")]
    TokenInvalid,
    #[error("token expired")]
    TokenExpired,
    #[error("verification code expired")]
    OtpExpired,
    /// Wrong verification code; the record absorbed the attempt.
    #[error("invalid verification code")]
    InvalidOtp { attempts_remaining: u32 },
    /// Attempt ceiling reached; further codes are rejected unseen.
    #[error("too many attempts")]
    TooManyAttempts { locked_until: DateTime<Utc> },
    /// Input failed format or strength validation before any store work.
    #[error("validation failed")]
    Validation { errors: Vec<String> },
    /// A downstream dependency failed; details stay in the logs.
    #[error("service unavailable")]
    ServiceUnavailable,
}

impl AuthError {
    /// True for variants a client may retry after fixing its input, as
    /// opposed to lockouts and downstream outages.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials { .. }
                | Self::TokenInvalid
                | Self::TokenExpired
                | Self::OtpExpired
                | Self::InvalidOtp { .. }
                | Self::Validation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::AuthError;
    use chrono::Utc;

    #[test]
    fn display_is_generic() {
        let err = AuthError::InvalidCredentials {
            attempts_remaining: Some(2),
        };
        assert_eq!(err.to_string(), "invalid credentials");

        let err = AuthError::AccountLocked {
            locked_until: Utc::now(),
        };
        assert_eq!(err.to_string(), "account temporarily locked");
    }

    #[test]
    fn lockouts_are_not_retryable() {
        let locked = AuthError::TooManyAttempts {
            locked_until: Utc::now(),
        };
        assert!(!locked.is_retryable());
        assert!(AuthError::TokenExpired.is_retryable());
        assert!(!AuthError::ServiceUnavailable.is_retryable());
    }
}
