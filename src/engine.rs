//! Orchestrating facade over the auth components.
//!
//! The engine owns the fixed ordering of every flow: format checks before
//! lockout checks, lockout checks before any credential comparison, limiter
//! clears only after verified success. Credential failures stay generic all
//! the way out; nothing here ever distinguishes "no such user" from "wrong
//! password", in result shape or in timing.

use anyhow::{Context, Result};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::credentials::{normalize_email, valid_email, validate_password_strength};
use crate::error::AuthError;
use crate::otp::{OtpManager, PhoneVerificationRequest};
use crate::rate_limit::{KeyScope, RateLimiter, rate_limit_key};
use crate::reset::{PasswordResetManager, PasswordResetRequest};
use crate::session::{IssuedSession, RevocationReason, SessionManager};
use crate::store::{
    AuditContext, AuditSink, Notifier, RateLimitStore, SecretHasher, SessionStore, UserRecord,
    UserStore,
};
use crate::token::{AccessClaims, generate_opaque_token, split_refresh_token};

const RESET_TEMPLATE: &str = "password_reset";
const OTP_TEMPLATE: &str = "phone_otp";

/// Identity asserted by an external OAuth provider. Signature verification
/// happened upstream; the engine only performs the account handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthProfile {
    pub provider: String,
    pub subject: String,
    pub email: String,
}

pub struct AuthEngine {
    users: Arc<dyn UserStore>,
    session_store: Arc<dyn SessionStore>,
    sessions: SessionManager,
    email_limiter: RateLimiter,
    ip_limiter: RateLimiter,
    otp_limiter: RateLimiter,
    otp: OtpManager,
    reset: PasswordResetManager,
    hasher: Arc<dyn SecretHasher>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    /// Hash compared against when the account does not exist, so unknown
    /// emails cost exactly one verification like everyone else.
    dummy_hash: String,
}

impl AuthEngine {
    /// Wire up the engine with its collaborators.
    ///
    /// # Errors
    /// Returns an error if the signing key cannot be parsed or the dummy
    /// hash cannot be prepared.
    pub async fn new(
        config: AuthConfig,
        users: Arc<dyn UserStore>,
        session_store: Arc<dyn SessionStore>,
        rate_limits: Arc<dyn RateLimitStore>,
        hasher: Arc<dyn SecretHasher>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let sessions = SessionManager::from_config(&config)?;
        let email_limiter = RateLimiter::new(rate_limits.clone(), config.email_policy());
        let ip_limiter = RateLimiter::new(rate_limits.clone(), config.ip_policy());
        // OTP requests share the per-account policy; verification attempts
        // are capped separately inside the OTP records themselves.
        let otp_limiter = RateLimiter::new(rate_limits, config.email_policy());
        let otp = OtpManager::from_config(&config);
        let reset = PasswordResetManager::from_config(&config);

        let dummy_secret = generate_opaque_token()?;
        let dummy_hash = hasher
            .hash(&dummy_secret)
            .await
            .context("failed to prepare dummy hash")?;

        Ok(Self {
            users,
            session_store,
            sessions,
            email_limiter,
            ip_limiter,
            otp_limiter,
            otp,
            reset,
            hasher,
            notifier,
            audit,
            dummy_hash,
        })
    }

    /// Password login. The step order is fixed: format validation, IP
    /// lockout, email lockout, constant-cost credential comparison, then
    /// limiter bookkeeping.
    ///
    /// # Errors
    /// `InvalidCredentials` (generic by design), `RateLimited`,
    /// `AccountLocked`, or `ServiceUnavailable`.
    pub async fn login(
        &self,
        email: &str,
        password: &SecretString,
        remember_me: bool,
        ip: Option<&str>,
    ) -> Result<IssuedSession, AuthError> {
        let now = Utc::now();
        let email = normalize_email(email);
        if !valid_email(&email) || password.expose_secret().is_empty() {
            // Malformed input never reaches the stores or the limiters.
            return Err(AuthError::InvalidCredentials {
                attempts_remaining: None,
            });
        }

        let email_key = rate_limit_key(KeyScope::Email, &email);
        let ip_key = ip.map(|ip| rate_limit_key(KeyScope::Ip, ip));

        if let Some(key) = &ip_key {
            if let Some(until) = self.ip_limiter.locked_until(key, now).await {
                return Err(AuthError::RateLimited {
                    locked_until: until,
                });
            }
        }
        if let Some(until) = self.email_limiter.locked_until(&email_key, now).await {
            return Err(AuthError::AccountLocked {
                locked_until: until,
            });
        }

        let user = self
            .users
            .find_by_email(&email)
            .await
            .map_err(downstream)?;
        // The comparison runs even when the user is missing or has no
        // password, against a dummy hash of equal cost.
        let stored_hash = user
            .as_ref()
            .and_then(|user| user.password_hash.as_deref())
            .unwrap_or(&self.dummy_hash);
        let verified = self
            .hasher
            .verify(password.expose_secret(), stored_hash)
            .await
            .map_err(downstream)?;

        let authenticated = user
            .as_ref()
            .is_some_and(|user| verified && user.password_hash.is_some() && !user.disabled);
        if !authenticated {
            if let Some(key) = &ip_key {
                self.ip_limiter.record_failure(key, now).await;
            }
            let state = self.email_limiter.record_failure(&email_key, now).await;
            self.emit(
                "auth.login_failed",
                AuditContext {
                    email: Some(email.clone()),
                    ip: ip.map(str::to_string),
                    ..AuditContext::default()
                },
                serde_json::json!({ "attempts": state.attempts }),
            )
            .await;
            // Only the email dimension's remaining budget is disclosed.
            return Err(AuthError::InvalidCredentials {
                attempts_remaining: Some(self.email_limiter.attempts_remaining(&state)),
            });
        }

        // Clears happen only after verified success, never before the
        // comparison, so failures cannot observe a reset.
        if let Some(key) = &ip_key {
            self.ip_limiter.clear(key).await;
        }
        self.email_limiter.clear(&email_key).await;

        let user = user.ok_or(AuthError::ServiceUnavailable)?;
        let issued = self.open_session(&user, remember_me, ip).await?;
        self.emit(
            "auth.login",
            context_for(&user, ip),
            serde_json::json!({ "session_id": issued.session.id }),
        )
        .await;
        Ok(issued)
    }

    /// Create an account and sign it in.
    ///
    /// # Errors
    /// `Validation` for format/strength failures or an already-registered
    /// email, `RateLimited`, or `ServiceUnavailable`.
    pub async fn register(
        &self,
        email: &str,
        password: &SecretString,
        ip: Option<&str>,
    ) -> Result<IssuedSession, AuthError> {
        let now = Utc::now();
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Err(AuthError::Validation {
                errors: vec!["invalid email address".to_string()],
            });
        }
        let strength = validate_password_strength(password.expose_secret());
        if !strength.valid {
            return Err(AuthError::Validation {
                errors: strength.errors,
            });
        }

        if let Some(ip) = ip {
            let key = rate_limit_key(KeyScope::Ip, ip);
            if let Some(until) = self.ip_limiter.locked_until(&key, now).await {
                return Err(AuthError::RateLimited {
                    locked_until: until,
                });
            }
        }

        if self
            .users
            .find_by_email(&email)
            .await
            .map_err(downstream)?
            .is_some()
        {
            return Err(AuthError::Validation {
                errors: vec!["email already registered".to_string()],
            });
        }

        let hash = self
            .hasher
            .hash(password.expose_secret())
            .await
            .map_err(downstream)?;
        let user = self
            .users
            .create(&email, Some(hash))
            .await
            .map_err(downstream)?;

        let issued = self.open_session(&user, false, ip).await?;
        self.emit(
            "auth.register",
            context_for(&user, ip),
            serde_json::json!({ "session_id": issued.session.id }),
        )
        .await;
        Ok(issued)
    }

    /// Account handoff for an externally verified OAuth identity:
    /// find-or-create by email, then issue a session.
    ///
    /// # Errors
    /// `InvalidCredentials` for a disabled account, `Validation` for a
    /// malformed provider email, or `ServiceUnavailable`.
    pub async fn oauth_login(
        &self,
        profile: &OAuthProfile,
        ip: Option<&str>,
    ) -> Result<IssuedSession, AuthError> {
        let email = normalize_email(&profile.email);
        if !valid_email(&email) {
            return Err(AuthError::Validation {
                errors: vec!["invalid email address".to_string()],
            });
        }

        let user = match self
            .users
            .find_by_email(&email)
            .await
            .map_err(downstream)?
        {
            Some(user) => user,
            None => self
                .users
                .create(&email, None)
                .await
                .map_err(downstream)?,
        };
        if user.disabled {
            return Err(AuthError::InvalidCredentials {
                attempts_remaining: None,
            });
        }

        let issued = self.open_session(&user, false, ip).await?;
        self.emit(
            "auth.oauth_login",
            context_for(&user, ip),
            serde_json::json!({
                "provider": profile.provider,
                "subject": profile.subject,
                "session_id": issued.session.id,
            }),
        )
        .await;
        Ok(issued)
    }

    /// Rotate a refresh token. Exactly one of two concurrent rotations of
    /// the same token succeeds; the loser, and any replay of a superseded
    /// token, is treated as theft: every session for the user is revoked.
    ///
    /// # Errors
    /// `TokenInvalid`, `TokenExpired`, or `ServiceUnavailable`.
    pub async fn refresh(&self, presented_refresh_token: &str) -> Result<IssuedSession, AuthError> {
        let now = Utc::now();
        let (session_id, _) = split_refresh_token(presented_refresh_token)?;
        let stored = self
            .session_store
            .find_by_id(session_id)
            .await
            .map_err(downstream)?;

        let rotated = match self.sessions.rotate(presented_refresh_token, stored.as_ref(), now) {
            Ok(rotated) => rotated,
            Err(AuthError::TokenInvalid) => {
                if let Some(stored) = &stored {
                    self.respond_to_token_reuse(stored.user_id, stored.id).await;
                }
                return Err(AuthError::TokenInvalid);
            }
            Err(err) => return Err(err),
        };

        // The store arbitrates racing rotations; losing the swap means the
        // presented token was superseded between check and commit.
        let stored = stored.ok_or(AuthError::TokenInvalid)?;
        let won = self
            .session_store
            .rotate(
                session_id,
                &stored.refresh_token_hash,
                &rotated.session.refresh_token_hash,
                rotated.session.expires_at,
                rotated.session.refresh_expires_at,
            )
            .await
            .map_err(downstream)?;
        if !won {
            self.respond_to_token_reuse(stored.user_id, stored.id).await;
            return Err(AuthError::TokenInvalid);
        }

        self.emit(
            "auth.refresh",
            AuditContext {
                user_id: Some(stored.user_id),
                email: Some(stored.email.clone()),
                ip: stored.ip_address.clone(),
            },
            serde_json::json!({ "session_id": session_id }),
        )
        .await;
        Ok(rotated)
    }

    /// Verify an access token and return its claims.
    ///
    /// # Errors
    /// `TokenInvalid` or `TokenExpired`.
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        self.sessions.verify_access(token, Utc::now())
    }

    /// Revoke one session. Idempotent.
    ///
    /// # Errors
    /// `ServiceUnavailable` if the session store fails.
    pub async fn logout(&self, session_id: Uuid) -> Result<(), AuthError> {
        self.session_store
            .revoke(session_id, RevocationReason::Logout)
            .await
            .map_err(downstream)?;
        self.emit(
            "auth.logout",
            AuditContext::default(),
            serde_json::json!({ "session_id": session_id }),
        )
        .await;
        Ok(())
    }

    /// Verify the current password, install the new one, and revoke every
    /// session for the user.
    ///
    /// # Errors
    /// `InvalidCredentials`, `Validation`, or `ServiceUnavailable`.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current: &SecretString,
        new_password: &SecretString,
    ) -> Result<(), AuthError> {
        let user = self.users.find_by_id(user_id).await.map_err(downstream)?;
        let stored_hash = user
            .as_ref()
            .and_then(|user| user.password_hash.as_deref())
            .unwrap_or(&self.dummy_hash);
        let verified = self
            .hasher
            .verify(current.expose_secret(), stored_hash)
            .await
            .map_err(downstream)?;
        let Some(user) = user.filter(|user| verified && user.password_hash.is_some()) else {
            return Err(AuthError::InvalidCredentials {
                attempts_remaining: None,
            });
        };

        let strength = validate_password_strength(new_password.expose_secret());
        if !strength.valid {
            return Err(AuthError::Validation {
                errors: strength.errors,
            });
        }

        let hash = self
            .hasher
            .hash(new_password.expose_secret())
            .await
            .map_err(downstream)?;
        self.users
            .update_password(user.id, hash)
            .await
            .map_err(downstream)?;
        self.session_store
            .revoke_all_for_user(user.id, RevocationReason::PasswordChanged)
            .await
            .map_err(downstream)?;

        self.emit(
            "auth.password_changed",
            context_for(&user, None),
            serde_json::json!({}),
        )
        .await;
        Ok(())
    }

    /// Start a password reset. Success-shaped for every input: a missing
    /// account, a malformed email, and a rate-limited source all return
    /// `Ok(None)` exactly like a handled request returns `Ok(Some(..))` to
    /// the trusted caller. The reset email is only sent when the account
    /// exists; the returned record is the caller's to persist.
    ///
    /// # Errors
    /// `ServiceUnavailable` only if token generation fails.
    pub async fn begin_password_reset(
        &self,
        email: &str,
        ip: Option<&str>,
    ) -> Result<Option<PasswordResetRequest>, AuthError> {
        let now = Utc::now();
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Ok(None);
        }
        if let Some(ip) = ip {
            let key = rate_limit_key(KeyScope::Ip, ip);
            if self.ip_limiter.is_locked(&key, now).await {
                return Ok(None);
            }
        }

        // Token material is minted unconditionally so the work done does
        // not depend on whether the account exists.
        let (request, raw_token) = self.reset.initiate(&email, now)?;

        let user = match self.users.find_by_email(&email).await {
            Ok(user) => user,
            Err(err) => {
                error!("reset lookup failed: {err}");
                return Ok(None);
            }
        };
        let Some(user) = user else {
            return Ok(None);
        };

        if let Err(err) = self
            .notifier
            .send(
                &user.email,
                RESET_TEMPLATE,
                serde_json::json!({ "token": raw_token, "expires_at": request.expires_at }),
            )
            .await
        {
            // Delivery failures stay opaque to the requester.
            error!("failed to send reset notification: {err}");
        }

        self.emit(
            "auth.reset_requested",
            context_for(&user, ip),
            serde_json::json!({ "request_id": request.id }),
        )
        .await;
        Ok(Some(request))
    }

    /// Finish a password reset: validate, burn the token, install the new
    /// password, and revoke every session. Returns the consumed record for
    /// the persistence boundary.
    ///
    /// # Errors
    /// `TokenInvalid`, `TokenExpired`, `Validation`, or `ServiceUnavailable`.
    pub async fn complete_password_reset(
        &self,
        raw_token: &str,
        stored: Option<PasswordResetRequest>,
        new_password: &SecretString,
    ) -> Result<PasswordResetRequest, AuthError> {
        let now = Utc::now();
        self.reset
            .validate(raw_token, stored.as_ref(), now)
            .into_result()?;
        let mut request = stored.ok_or(AuthError::TokenInvalid)?;

        let strength = validate_password_strength(new_password.expose_secret());
        if !strength.valid {
            return Err(AuthError::Validation {
                errors: strength.errors,
            });
        }

        let user = self
            .users
            .find_by_email(&request.email)
            .await
            .map_err(downstream)?
            .ok_or(AuthError::TokenInvalid)?;

        self.reset.consume(&mut request, now)?;
        let hash = self
            .hasher
            .hash(new_password.expose_secret())
            .await
            .map_err(downstream)?;
        self.users
            .update_password(user.id, hash)
            .await
            .map_err(downstream)?;
        self.session_store
            .revoke_all_for_user(user.id, RevocationReason::PasswordChanged)
            .await
            .map_err(downstream)?;

        self.emit(
            "auth.reset_completed",
            context_for(&user, None),
            serde_json::json!({ "request_id": request.id }),
        )
        .await;
        Ok(request)
    }

    /// Issue a phone-verification code and hand it to the SMS path. The
    /// returned record is the caller's to persist.
    ///
    /// # Errors
    /// `Validation` for a malformed phone, `RateLimited` while the phone
    /// key is locked out, or `ServiceUnavailable`.
    pub async fn request_phone_verification(
        &self,
        phone: &str,
        ip: Option<&str>,
    ) -> Result<(PhoneVerificationRequest, String), AuthError> {
        let now = Utc::now();
        let (request, raw_code) = self.otp.request_otp(phone, now)?;

        let phone_key = rate_limit_key(KeyScope::Otp, &request.phone);
        if let Some(until) = self.otp_limiter.locked_until(&phone_key, now).await {
            return Err(AuthError::RateLimited {
                locked_until: until,
            });
        }
        // Every request counts toward the flood budget for this phone.
        self.otp_limiter.record_failure(&phone_key, now).await;

        if let Err(err) = self
            .notifier
            .send(
                &request.phone,
                OTP_TEMPLATE,
                serde_json::json!({ "code": raw_code, "phone_display": request.phone_display }),
            )
            .await
        {
            error!("failed to send verification code: {err}");
            return Err(AuthError::ServiceUnavailable);
        }

        self.emit(
            "auth.otp_requested",
            AuditContext {
                ip: ip.map(str::to_string),
                ..AuditContext::default()
            },
            serde_json::json!({ "request_id": request.id, "phone": request.phone_display }),
        )
        .await;
        Ok((request, raw_code))
    }

    /// Verify a phone code against its stored request, mutating it. The
    /// caller persists the transitioned record either way.
    ///
    /// # Errors
    /// `InvalidOtp`, `OtpExpired`, or `TooManyAttempts`.
    pub async fn verify_phone(
        &self,
        raw_code: &str,
        stored: &mut PhoneVerificationRequest,
    ) -> Result<(), AuthError> {
        let now = Utc::now();
        self.otp.verify_otp(raw_code, stored, now)?;
        self.otp_limiter
            .clear(&rate_limit_key(KeyScope::Otp, &stored.phone))
            .await;
        self.emit(
            "auth.phone_verified",
            AuditContext::default(),
            serde_json::json!({ "request_id": stored.id, "phone": stored.phone_display }),
        )
        .await;
        Ok(())
    }

    async fn open_session(
        &self,
        user: &UserRecord,
        remember_me: bool,
        ip: Option<&str>,
    ) -> Result<IssuedSession, AuthError> {
        let issued = self
            .sessions
            .issue(user.id, &user.email, remember_me, ip, Utc::now())
            .map_err(downstream)?;
        self.session_store
            .create(&issued.session)
            .await
            .map_err(downstream)?;
        Ok(issued)
    }

    async fn respond_to_token_reuse(&self, user_id: Uuid, session_id: Uuid) {
        warn!(%user_id, "refresh token reuse detected, revoking all sessions");
        if let Err(err) = self
            .session_store
            .revoke_all_for_user(user_id, RevocationReason::TokenReuse)
            .await
        {
            error!("failed to revoke sessions after token reuse: {err}");
        }
        self.emit(
            "auth.token_reuse",
            AuditContext {
                user_id: Some(user_id),
                ..AuditContext::default()
            },
            serde_json::json!({ "session_id": session_id }),
        )
        .await;
    }

    /// Fire-and-forget audit write; a failing sink never fails the flow.
    async fn emit(&self, action: &str, context: AuditContext, metadata: serde_json::Value) {
        if let Err(err) = self.audit.record(action, context, metadata).await {
            error!("audit sink failure for {action}: {err}");
        }
    }
}

fn context_for(user: &UserRecord, ip: Option<&str>) -> AuditContext {
    AuditContext {
        user_id: Some(user.id),
        email: Some(user.email.clone()),
        ip: ip.map(str::to_string),
    }
}

fn downstream(err: anyhow::Error) -> AuthError {
    error!("downstream dependency failure: {err}");
    AuthError::ServiceUnavailable
}
