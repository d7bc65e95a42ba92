//! One-time-password phone verification.
//!
//! Codes are six digits drawn from the OS random source, stored only as a
//! SHA-256 digest, and live for five minutes. Expiry wins over attempt
//! accounting: a late attempt is `OtpExpired` and does not burn an attempt.
//! Once verified the record is terminal.

use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compare::constant_time_eq_str;
use crate::config::AuthConfig;
use crate::credentials::{mask_phone, valid_phone};
use crate::error::AuthError;
use crate::token::hash_opaque_token;

/// Pending phone verification, owned by the persistence boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneVerificationRequest {
    pub id: Uuid,
    pub phone: String,
    /// Masked rendering, safe to show in UIs and logs.
    pub phone_display: String,
    pub otp_hash: String,
    pub otp_attempts: u32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl PhoneVerificationRequest {
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some()
    }
}

pub struct OtpManager {
    ttl: Duration,
    max_attempts: u32,
    lockout: Duration,
}

impl OtpManager {
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            ttl: config.otp_ttl(),
            max_attempts: config.otp_max_attempts(),
            lockout: config.otp_lockout(),
        }
    }

    /// Generate a code for a phone number. The raw code goes to the SMS
    /// path only; the returned record carries just its hash.
    ///
    /// # Errors
    /// `Validation` for a malformed phone, `ServiceUnavailable` if the
    /// randomness source fails.
    pub fn request_otp(
        &self,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<(PhoneVerificationRequest, String), AuthError> {
        let phone = phone.trim();
        if !valid_phone(phone) {
            return Err(AuthError::Validation {
                errors: vec!["invalid phone number".to_string()],
            });
        }

        let raw_code = generate_code()?;
        let request = PhoneVerificationRequest {
            id: Uuid::new_v4(),
            phone: phone.to_string(),
            phone_display: mask_phone(phone),
            otp_hash: hash_opaque_token(&raw_code),
            otp_attempts: 0,
            expires_at: now + self.ttl,
            created_at: now,
            verified_at: None,
        };
        Ok((request, raw_code))
    }

    /// Verify a code against a stored request, mutating it in place.
    ///
    /// Terminal checks run in a fixed order: already verified, expired,
    /// attempts exhausted, then the constant-time hash comparison. A
    /// mismatch burns an attempt; a match marks the record verified and no
    /// further attempts are possible.
    ///
    /// # Errors
    /// `InvalidOtp`, `OtpExpired`, or `TooManyAttempts` as above.
    pub fn verify_otp(
        &self,
        raw_code: &str,
        stored: &mut PhoneVerificationRequest,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        if stored.is_verified() {
            // Terminal record; nothing left to verify against.
            return Err(AuthError::InvalidOtp {
                attempts_remaining: 0,
            });
        }
        if now >= stored.expires_at {
            return Err(AuthError::OtpExpired);
        }
        if stored.otp_attempts >= self.max_attempts {
            return Err(AuthError::TooManyAttempts {
                locked_until: stored.created_at + self.lockout,
            });
        }

        if !constant_time_eq_str(&hash_opaque_token(raw_code.trim()), &stored.otp_hash) {
            stored.otp_attempts += 1;
            return Err(AuthError::InvalidOtp {
                attempts_remaining: self.max_attempts.saturating_sub(stored.otp_attempts),
            });
        }

        stored.verified_at = Some(now);
        Ok(())
    }
}

fn generate_code() -> Result<String, AuthError> {
    const BOUND: u32 = 1_000_000;
    // Rejection sampling keeps the draw uniform over the six-digit range.
    let limit = u32::MAX - u32::MAX % BOUND;
    loop {
        let mut bytes = [0u8; 4];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| AuthError::ServiceUnavailable)?;
        let value = u32::from_be_bytes(bytes);
        if value < limit {
            return Ok(format!("{:06}", value % BOUND));
        }
    }
}
