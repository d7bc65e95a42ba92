//! In-process store implementations.
//!
//! Backed by mutexed maps, so every operation is an atomic
//! read-modify-write. Correct for a single instance; multi-instance
//! deployments replace these with a shared store behind the same traits.
//! They are also the substrate for the crate's own tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::rate_limit::RateLimitState;
use crate::session::{RevocationReason, Session};
use crate::store::{RateLimitStore, SessionStore, UserRecord, UserStore};

#[derive(Default)]
pub struct InMemoryUserStore {
    users: Mutex<HashMap<Uuid, UserRecord>>,
}

impl InMemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed record, replacing any previous one. Intended
    /// for seeding test fixtures.
    pub async fn seed(&self, record: UserRecord) {
        self.users.lock().await.insert(record.id, record);
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let users = self.users.lock().await;
        Ok(users.values().find(|user| user.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserRecord>> {
        Ok(self.users.lock().await.get(&id).cloned())
    }

    async fn create(&self, email: &str, password_hash: Option<String>) -> Result<UserRecord> {
        let mut users = self.users.lock().await;
        if users.values().any(|user| user.email == email) {
            anyhow::bail!("email already registered");
        }
        let record = UserRecord {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash,
            disabled: false,
            email_verified: false,
        };
        users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_password(&self, id: Uuid, password_hash: String) -> Result<()> {
        let mut users = self.users.lock().await;
        let user = users
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("no such user"))?;
        user.password_hash = Some(password_hash);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All sessions for a user, revoked ones included.
    pub async fn sessions_for_user(&self, user_id: Uuid) -> Vec<Session> {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: &Session) -> Result<()> {
        self.sessions
            .lock()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.sessions.lock().await.get(&id).cloned())
    }

    async fn find_by_refresh_hash(&self, refresh_hash: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .values()
            .find(|session| session.refresh_token_hash == refresh_hash)
            .cloned())
    }

    async fn rotate(
        &self,
        id: Uuid,
        expected_hash: &str,
        new_hash: &str,
        new_expires_at: DateTime<Utc>,
        new_refresh_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&id) else {
            return Ok(false);
        };
        // The whole check-and-swap happens under one lock: of two racing
        // rotations exactly one sees the expected hash.
        if session.is_revoked() || session.refresh_token_hash != expected_hash {
            return Ok(false);
        }
        session.refresh_token_hash = new_hash.to_string();
        session.expires_at = new_expires_at;
        session.refresh_expires_at = new_refresh_expires_at;
        Ok(true)
    }

    async fn revoke(&self, id: Uuid, reason: RevocationReason) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&id) {
            if !session.is_revoked() {
                session.revoked_at = Some(Utc::now());
                session.revocation_reason = Some(reason);
            }
        }
        Ok(())
    }

    async fn revoke_all_for_user(&self, user_id: Uuid, reason: RevocationReason) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values_mut() {
            if session.user_id == user_id && !session.is_revoked() {
                session.revoked_at = Some(Utc::now());
                session.revocation_reason = Some(reason);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryRateLimitStore {
    states: Mutex<HashMap<String, RateLimitState>>,
}

impl InMemoryRateLimitStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn get(&self, key: &str) -> Result<Option<RateLimitState>> {
        Ok(self.states.lock().await.get(key).cloned())
    }

    async fn increment(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<RateLimitState> {
        let mut states = self.states.lock().await;

        let fresh = |now: DateTime<Utc>| RateLimitState {
            key: key.to_string(),
            attempts: 1,
            first_attempt_at: now,
            last_attempt_at: now,
            locked_until: None,
        };

        let state = match states.get(key) {
            // An expired lockout discards the whole prior window.
            Some(state) if state.locked_until.is_some_and(|until| now >= until) => fresh(now),
            // An active lockout keeps its state; counting continues.
            Some(state) if state.locked_until.is_some() => {
                let mut state = state.clone();
                state.attempts += 1;
                state.last_attempt_at = now;
                state
            }
            Some(state) if now - state.first_attempt_at < window => {
                let mut state = state.clone();
                state.attempts += 1;
                state.last_attempt_at = now;
                state
            }
            // Window elapsed without a lockout: start over.
            _ => fresh(now),
        };
        states.insert(key.to_string(), state.clone());
        Ok(state)
    }

    async fn set_lockout(&self, key: &str, until: DateTime<Utc>) -> Result<()> {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(key) {
            state.locked_until = Some(until);
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.states.lock().await.remove(key);
        Ok(())
    }
}
