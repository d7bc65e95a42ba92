//! Collaborator interfaces consumed by the auth core.
//!
//! The core never talks to a database or a network directly; every
//! persistence and delivery concern sits behind one of these traits. SQL,
//! Redis, or in-memory implementations are the caller's choice; the crate
//! ships in-process versions in [`crate::memory`] suitable for a single
//! instance and for tests.

use anyhow::Result;
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use uuid::Uuid;

use crate::rate_limit::RateLimitState;
use crate::session::{RevocationReason, Session};

/// Account record as the persistence boundary exposes it to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    /// Absent for accounts created through an OAuth handoff.
    pub password_hash: Option<String>,
    pub disabled: bool,
    pub email_verified: bool,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserRecord>>;
    /// Create an account. `password_hash` is `None` for OAuth accounts.
    async fn create(&self, email: &str, password_hash: Option<String>) -> Result<UserRecord>;
    async fn update_password(&self, id: Uuid, password_hash: String) -> Result<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>>;
    async fn find_by_refresh_hash(&self, refresh_hash: &str) -> Result<Option<Session>>;
    /// Swap the refresh hash and expiries, but only while the stored hash
    /// still equals `expected_hash` and the session is not revoked.
    /// Returns `false` when the swap lost: of two concurrent rotations of
    /// the same token exactly one may observe `true`.
    async fn rotate(
        &self,
        id: Uuid,
        expected_hash: &str,
        new_hash: &str,
        new_expires_at: DateTime<Utc>,
        new_refresh_expires_at: DateTime<Utc>,
    ) -> Result<bool>;
    /// Idempotent: revoking an unknown or already-revoked session is a no-op.
    async fn revoke(&self, id: Uuid, reason: RevocationReason) -> Result<()>;
    async fn revoke_all_for_user(&self, user_id: Uuid, reason: RevocationReason) -> Result<()>;
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RateLimitState>>;
    /// Atomic read-modify-write: discard state whose window or lockout has
    /// expired at `now`, then count one failure. Concurrent callers must
    /// observe distinct attempt counts.
    async fn increment(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<RateLimitState>;
    async fn set_lockout(&self, key: &str, until: DateTime<Utc>) -> Result<()>;
    async fn clear(&self, key: &str) -> Result<()>;
}

/// Pluggable password hashing capability.
///
/// Production implementations must use a deliberately slow algorithm; the
/// core never picks one itself. `verify` must take the same time for a
/// wrong password as for a right one.
#[async_trait]
pub trait SecretHasher: Send + Sync {
    async fn hash(&self, plaintext: &str) -> Result<String>;
    async fn verify(&self, plaintext: &str, hash: &str) -> Result<bool>;
}

/// Outbound email/SMS delivery. The core only names a template and hands
/// over variables; rendering and transport happen elsewhere.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, template_id: &str, variables: serde_json::Value) -> Result<()>;
}

/// Identity fields attached to an audit record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditContext {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub ip: Option<String>,
}

/// Fire-and-forget audit trail. A failing sink must never fail the
/// primary flow; the engine logs and moves on.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(
        &self,
        action: &str,
        context: AuditContext,
        metadata: serde_json::Value,
    ) -> Result<()>;
}

/// Drops every audit record. Useful for tests and minimal deployments.
#[derive(Clone, Debug, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(
        &self,
        _action: &str,
        _context: AuditContext,
        _metadata: serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }
}

/// Swallows every notification. Useful for tests.
#[derive(Clone, Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(
        &self,
        _to: &str,
        _template_id: &str,
        _variables: serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }
}

/// Argon2id implementation of [`SecretHasher`] with default parameters.
#[derive(Clone, Debug, Default)]
pub struct Argon2Hasher;

#[async_trait]
impl SecretHasher for Argon2Hasher {
    async fn hash(&self, plaintext: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|err| anyhow::anyhow!("password hashing failed: {err}"))?;
        Ok(hash.to_string())
    }

    async fn verify(&self, plaintext: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|err| anyhow::anyhow!("invalid password hash: {err}"))?;
        Ok(Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok())
    }
}
