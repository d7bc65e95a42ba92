//! Sliding-window rate limiting with lockouts.
//!
//! Two independent limiters run per login attempt, one keyed by normalized
//! email and one by client IP, so a distributed attacker is throttled
//! per-source while a targeted attacker is throttled per-account. Keys are
//! always hashed before they reach the store, so raw emails and addresses
//! never become store keys.
//!
//! Scaling: the store is an injected trait. An in-process map is fine for a
//! single instance; multi-instance deployments plug in a shared atomic
//! counter behind the same interface.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{error, warn};

use crate::store::RateLimitStore;

/// Failure-count state for one key inside the current sliding window.
///
/// A state whose window or lockout has expired is logically empty; the
/// store discards it on the next increment rather than eagerly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub key: String,
    pub attempts: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
}

/// Window and lockout parameters for one limiter dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
    pub lockout: Duration,
}

/// Namespace for hashed rate-limit keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    Email,
    Ip,
    Otp,
}

impl KeyScope {
    fn prefix(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Ip => "ip",
            Self::Otp => "otp",
        }
    }
}

/// Derive the store key for an identifier: `scope:` plus a SHA-256 digest.
/// Raw emails, phones, and addresses never leave this function.
#[must_use]
pub fn rate_limit_key(scope: KeyScope, raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    format!(
        "{}:{}",
        scope.prefix(),
        Base64UrlUnpadded::encode_string(&digest)
    )
}

/// Sliding-window failure counter over an injected store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn RateLimitStore>, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    #[must_use]
    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Active lockout expiry for a key, if one is in force at `now`.
    ///
    /// Must be consulted before any credential comparison. A store failure
    /// fails closed: the key is reported locked rather than letting an
    /// outage disable brute-force protection.
    pub async fn locked_until(&self, key: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.store.get(key).await {
            Ok(Some(state)) => state.locked_until.filter(|until| now < *until),
            Ok(None) => None,
            Err(err) => {
                error!("rate limit lookup failed, failing closed: {err}");
                Some(now + self.policy.lockout)
            }
        }
    }

    pub async fn is_locked(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.locked_until(key, now).await.is_some()
    }

    /// Record a failed attempt and return the updated state.
    ///
    /// The store applies the sliding-window reset atomically; this layer
    /// decides whether the new count crosses the lockout threshold. Never
    /// fails open: if the store is unreachable the returned state reports
    /// an immediate lockout.
    pub async fn record_failure(&self, key: &str, now: DateTime<Utc>) -> RateLimitState {
        let mut state = match self.store.increment(key, now, self.policy.window).await {
            Ok(state) => state,
            Err(err) => {
                error!("rate limit increment failed, failing closed: {err}");
                return RateLimitState {
                    key: key.to_string(),
                    attempts: self.policy.max_attempts,
                    first_attempt_at: now,
                    last_attempt_at: now,
                    locked_until: Some(now + self.policy.lockout),
                };
            }
        };

        if state.attempts >= self.policy.max_attempts && state.locked_until.is_none() {
            let until = now + self.policy.lockout;
            if let Err(err) = self.store.set_lockout(key, until).await {
                error!("failed to persist lockout: {err}");
            }
            warn!(attempts = state.attempts, "rate limit lockout triggered");
            state.locked_until = Some(until);
        }
        state
    }

    /// Clear state for a key. Called only after a verified success so a
    /// failed comparison can never observe the reset.
    pub async fn clear(&self, key: &str) {
        if let Err(err) = self.store.clear(key).await {
            error!("failed to clear rate limit state: {err}");
        }
    }

    /// Attempts left before the next failure locks the key.
    #[must_use]
    pub fn attempts_remaining(&self, state: &RateLimitState) -> u32 {
        self.policy.max_attempts.saturating_sub(state.attempts)
    }
}
