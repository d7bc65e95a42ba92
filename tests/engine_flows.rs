//! End-to-end flows through the engine against the in-memory stores.
//!
//! Argon2 stays out of the loop here; a plain marker hasher keeps the
//! tests fast while exercising the same `SecretHasher` seam production
//! uses.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use gardi::memory::{InMemoryRateLimitStore, InMemorySessionStore, InMemoryUserStore};
use gardi::store::{Notifier, NoopAuditSink, SecretHasher, SessionStore, UserRecord, UserStore};
use gardi::{AuthConfig, AuthEngine, AuthError, OAuthProfile, Session, SignerConfig};

const EMAIL: &str = "parent@example.com";
const PASSWORD: &str = "Password1";

/// Marker-prefix hasher. Constant cost is irrelevant here; the tests
/// assert ordering and state, not timing.
struct PlainHasher;

#[async_trait]
impl SecretHasher for PlainHasher {
    async fn hash(&self, plaintext: &str) -> Result<String> {
        Ok(format!("plain:{plaintext}"))
    }

    async fn verify(&self, plaintext: &str, hash: &str) -> Result<bool> {
        Ok(hash == format!("plain:{plaintext}"))
    }
}

/// Captures outbound messages so tests can fish out reset tokens and
/// verification codes the way a real recipient would.
#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl RecordingNotifier {
    async fn last(&self) -> Option<(String, String, serde_json::Value)> {
        self.sent.lock().await.last().cloned()
    }

    async fn count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, to: &str, template_id: &str, variables: serde_json::Value) -> Result<()> {
        self.sent
            .lock()
            .await
            .push((to.to_string(), template_id.to_string(), variables));
        Ok(())
    }
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

struct Harness {
    engine: AuthEngine,
    users: Arc<InMemoryUserStore>,
    sessions: Arc<InMemorySessionStore>,
    notifier: Arc<RecordingNotifier>,
}

impl Harness {
    async fn new() -> Result<Self> {
        init_tracing();
        let config = AuthConfig::new(
            "https://auth.test".to_string(),
            "gardi".to_string(),
            SignerConfig::Hmac {
                key: vec![42u8; 32],
                kid: "test-key".to_string(),
            },
        );
        let users = Arc::new(InMemoryUserStore::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = AuthEngine::new(
            config,
            users.clone(),
            sessions.clone(),
            Arc::new(InMemoryRateLimitStore::new()),
            Arc::new(PlainHasher),
            notifier.clone(),
            Arc::new(NoopAuditSink),
        )
        .await?;
        Ok(Self {
            engine,
            users,
            sessions,
            notifier,
        })
    }

    async fn seed_user(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.users
            .seed(UserRecord {
                id,
                email: EMAIL.to_string(),
                password_hash: Some(format!("plain:{PASSWORD}")),
                disabled: false,
                email_verified: true,
            })
            .await;
        id
    }
}

fn secret(s: &str) -> SecretString {
    SecretString::from(s.to_string())
}

#[tokio::test]
async fn login_issues_a_verifiable_session() -> Result<()> {
    let harness = Harness::new().await?;
    let user_id = harness.seed_user().await;

    let issued = harness
        .engine
        .login(EMAIL, &secret(PASSWORD), false, Some("203.0.113.9"))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    assert_eq!(issued.session.user_id, user_id);
    assert_eq!(
        issued.session.refresh_expires_at - issued.session.created_at,
        Duration::days(7)
    );
    let claims = harness
        .engine
        .verify_access(&issued.access_token)
        .map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(claims.sub, user_id.to_string());

    let stored = harness.sessions.find_by_id(issued.session.id).await?;
    assert!(stored.is_some_and(|s| !s.is_revoked()));
    Ok(())
}

#[tokio::test]
async fn remember_me_extends_the_refresh_window_to_thirty_days() -> Result<()> {
    let harness = Harness::new().await?;
    harness.seed_user().await;

    let issued = harness
        .engine
        .login(EMAIL, &secret(PASSWORD), true, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(
        issued.session.refresh_expires_at - issued.session.created_at,
        Duration::days(30)
    );
    Ok(())
}

#[tokio::test]
async fn unknown_email_and_wrong_password_are_indistinguishable() -> Result<()> {
    let harness = Harness::new().await?;
    harness.seed_user().await;

    let unknown = harness
        .engine
        .login("nobody@example.com", &secret(PASSWORD), false, None)
        .await;
    let wrong = harness
        .engine
        .login(EMAIL, &secret("WrongPass1"), false, None)
        .await;

    // Same variant, same disclosed budget; nothing marks the account real.
    assert_eq!(
        unknown.err(),
        Some(AuthError::InvalidCredentials {
            attempts_remaining: Some(4),
        })
    );
    assert_eq!(
        wrong.err(),
        Some(AuthError::InvalidCredentials {
            attempts_remaining: Some(4),
        })
    );
    Ok(())
}

#[tokio::test]
async fn fifth_failure_locks_the_account_beyond_correct_credentials() -> Result<()> {
    let harness = Harness::new().await?;
    harness.seed_user().await;

    for expected_remaining in (1..=4u32).rev() {
        let result = harness
            .engine
            .login(EMAIL, &secret("WrongPass1"), false, None)
            .await;
        assert_eq!(
            result.err(),
            Some(AuthError::InvalidCredentials {
                attempts_remaining: Some(expected_remaining),
            })
        );
    }

    // Fifth wrong attempt exhausts the budget and triggers the lockout.
    let fifth = harness
        .engine
        .login(EMAIL, &secret("WrongPass1"), false, None)
        .await;
    assert_eq!(
        fifth.err(),
        Some(AuthError::InvalidCredentials {
            attempts_remaining: Some(0),
        })
    );

    // Correct credentials are rejected unseen while the lockout holds.
    let locked = harness
        .engine
        .login(EMAIL, &secret(PASSWORD), false, None)
        .await;
    assert!(matches!(locked, Err(AuthError::AccountLocked { .. })));
    Ok(())
}

#[tokio::test]
async fn success_clears_the_failure_budget() -> Result<()> {
    let harness = Harness::new().await?;
    harness.seed_user().await;

    for _ in 0..3 {
        let _ = harness
            .engine
            .login(EMAIL, &secret("WrongPass1"), false, None)
            .await;
    }
    harness
        .engine
        .login(EMAIL, &secret(PASSWORD), false, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    // The window restarted: a fresh failure reports a full budget again.
    let result = harness
        .engine
        .login(EMAIL, &secret("WrongPass1"), false, None)
        .await;
    assert_eq!(
        result.err(),
        Some(AuthError::InvalidCredentials {
            attempts_remaining: Some(4),
        })
    );
    Ok(())
}

#[tokio::test]
async fn ip_lockout_protects_across_accounts() -> Result<()> {
    let harness = Harness::new().await?;
    harness.seed_user().await;
    let ip = Some("198.51.100.7");

    // Twenty failures spread over twenty target emails, all one source.
    for n in 0..20 {
        let result = harness
            .engine
            .login(&format!("victim{n}@example.com"), &secret("Guess1aa"), false, ip)
            .await;
        assert!(matches!(
            result,
            Err(AuthError::InvalidCredentials { .. })
        ));
    }

    // The 21st attempt from that IP is refused even with valid credentials.
    let blocked = harness.engine.login(EMAIL, &secret(PASSWORD), false, ip).await;
    assert!(matches!(blocked, Err(AuthError::RateLimited { .. })));

    // A different source is unaffected.
    harness
        .engine
        .login(EMAIL, &secret(PASSWORD), false, Some("192.0.2.1"))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

#[tokio::test]
async fn malformed_input_never_reaches_the_limiters() -> Result<()> {
    let harness = Harness::new().await?;
    harness.seed_user().await;

    for _ in 0..30 {
        let result = harness
            .engine
            .login("not-an-email", &secret(PASSWORD), false, Some("198.51.100.7"))
            .await;
        assert_eq!(
            result.err(),
            Some(AuthError::InvalidCredentials {
                attempts_remaining: None,
            })
        );
    }

    // No budget was spent on the garbage.
    harness
        .engine
        .login(EMAIL, &secret(PASSWORD), false, Some("198.51.100.7"))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

#[tokio::test]
async fn refresh_rotates_and_replay_revokes_everything() -> Result<()> {
    let harness = Harness::new().await?;
    let user_id = harness.seed_user().await;

    let issued = harness
        .engine
        .login(EMAIL, &secret(PASSWORD), false, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let rotated = harness
        .engine
        .refresh(&issued.refresh_token)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(rotated.session.id, issued.session.id);
    assert_ne!(rotated.refresh_token, issued.refresh_token);
    harness
        .engine
        .verify_access(&rotated.access_token)
        .map_err(|e| anyhow::anyhow!(e))?;

    // Replaying the superseded token is a theft signal.
    let replay = harness.engine.refresh(&issued.refresh_token).await;
    assert_eq!(replay.err(), Some(AuthError::TokenInvalid));
    let all = harness.sessions.sessions_for_user(user_id).await;
    assert!(all.iter().all(Session::is_revoked));

    // The rotated token died with the rest.
    let after = harness.engine.refresh(&rotated.refresh_token).await;
    assert_eq!(after.err(), Some(AuthError::TokenInvalid));
    Ok(())
}

#[tokio::test]
async fn concurrent_rotations_have_exactly_one_winner() -> Result<()> {
    let harness = Harness::new().await?;
    harness.seed_user().await;

    let issued = harness
        .engine
        .login(EMAIL, &secret(PASSWORD), false, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let (first, second) = tokio::join!(
        harness.engine.refresh(&issued.refresh_token),
        harness.engine.refresh(&issued.refresh_token),
    );
    let winners = usize::from(first.is_ok()) + usize::from(second.is_ok());
    assert_eq!(winners, 1);
    let loser = if first.is_ok() { second } else { first };
    assert_eq!(loser.err(), Some(AuthError::TokenInvalid));
    Ok(())
}

#[tokio::test]
async fn garbage_refresh_tokens_are_invalid() -> Result<()> {
    let harness = Harness::new().await?;
    for token in ["", "nonsense", "not-a-uuid.secret"] {
        let result = harness.engine.refresh(token).await;
        assert_eq!(result.err(), Some(AuthError::TokenInvalid));
    }
    Ok(())
}

#[tokio::test]
async fn logout_is_idempotent_and_kills_the_refresh_token() -> Result<()> {
    let harness = Harness::new().await?;
    harness.seed_user().await;

    let issued = harness
        .engine
        .login(EMAIL, &secret(PASSWORD), false, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    harness
        .engine
        .logout(issued.session.id)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    harness
        .engine
        .logout(issued.session.id)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let result = harness.engine.refresh(&issued.refresh_token).await;
    assert_eq!(result.err(), Some(AuthError::TokenInvalid));
    Ok(())
}

#[tokio::test]
async fn register_enforces_format_strength_and_uniqueness() -> Result<()> {
    let harness = Harness::new().await?;

    let issued = harness
        .engine
        .register("New.User@Example.com", &secret("Sturdy1aa"), None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(issued.session.email, "new.user@example.com");

    let duplicate = harness
        .engine
        .register("new.user@example.com", &secret("Sturdy1aa"), None)
        .await;
    assert!(matches!(duplicate, Err(AuthError::Validation { .. })));

    let weak = harness
        .engine
        .register("other@example.com", &secret("alllowercase1"), None)
        .await;
    assert!(matches!(weak, Err(AuthError::Validation { .. })));

    let malformed = harness
        .engine
        .register("not-an-email", &secret("Sturdy1aa"), None)
        .await;
    assert!(matches!(malformed, Err(AuthError::Validation { .. })));
    Ok(())
}

#[tokio::test]
async fn oauth_login_finds_or_creates_the_account() -> Result<()> {
    let harness = Harness::new().await?;
    let profile = OAuthProfile {
        provider: "google".to_string(),
        subject: "oauth-subject-1".to_string(),
        email: "Linked@Example.com".to_string(),
    };

    let first = harness
        .engine
        .oauth_login(&profile, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    let created = harness
        .users
        .find_by_email("linked@example.com")
        .await?
        .expect("account created on first handoff");
    assert_eq!(created.password_hash, None);

    let second = harness
        .engine
        .oauth_login(&profile, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(second.session.user_id, first.session.user_id);
    Ok(())
}

#[tokio::test]
async fn change_password_revokes_every_session() -> Result<()> {
    let harness = Harness::new().await?;
    let user_id = harness.seed_user().await;

    harness
        .engine
        .login(EMAIL, &secret(PASSWORD), false, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    harness
        .engine
        .login(EMAIL, &secret(PASSWORD), true, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let wrong = harness
        .engine
        .change_password(user_id, &secret("WrongPass1"), &secret("Fresher1a"))
        .await;
    assert!(matches!(wrong, Err(AuthError::InvalidCredentials { .. })));

    harness
        .engine
        .change_password(user_id, &secret(PASSWORD), &secret("Fresher1a"))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let all = harness.sessions.sessions_for_user(user_id).await;
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(Session::is_revoked));

    let old = harness.engine.login(EMAIL, &secret(PASSWORD), false, None).await;
    assert!(matches!(old, Err(AuthError::InvalidCredentials { .. })));
    harness
        .engine
        .login(EMAIL, &secret("Fresher1a"), false, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

#[tokio::test]
async fn password_reset_round_trip_burns_the_token() -> Result<()> {
    let harness = Harness::new().await?;
    let user_id = harness.seed_user().await;
    harness
        .engine
        .login(EMAIL, &secret(PASSWORD), false, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let request = harness
        .engine
        .begin_password_reset(EMAIL, Some("203.0.113.9"))
        .await
        .map_err(|e| anyhow::anyhow!(e))?
        .expect("known account yields a request");

    // The raw token only travels through the notifier, like a real email.
    let (to, template, variables) = harness.notifier.last().await.expect("reset email sent");
    assert_eq!(to, EMAIL);
    assert_eq!(template, "password_reset");
    let raw_token = variables["token"].as_str().expect("token variable").to_string();

    let consumed = harness
        .engine
        .complete_password_reset(&raw_token, Some(request.clone()), &secret("Fresher1a"))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    assert!(consumed.is_used());

    let all = harness.sessions.sessions_for_user(user_id).await;
    assert!(all.iter().all(Session::is_revoked));
    harness
        .engine
        .login(EMAIL, &secret("Fresher1a"), false, None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    // The burned record rejects a second completion.
    let replay = harness
        .engine
        .complete_password_reset(&raw_token, Some(consumed), &secret("Another1a"))
        .await;
    assert_eq!(replay.err(), Some(AuthError::TokenInvalid));
    Ok(())
}

#[tokio::test]
async fn password_reset_never_confirms_account_existence() -> Result<()> {
    let harness = Harness::new().await?;
    harness.seed_user().await;

    let unknown = harness
        .engine
        .begin_password_reset("nobody@example.com", None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    assert!(unknown.is_none());

    let malformed = harness
        .engine
        .begin_password_reset("not-an-email", None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    assert!(malformed.is_none());

    // Nothing was sent for either probe.
    assert_eq!(harness.notifier.count().await, 0);
    Ok(())
}

#[tokio::test]
async fn phone_verification_round_trip() -> Result<()> {
    let harness = Harness::new().await?;

    let (mut request, raw_code) = harness
        .engine
        .request_phone_verification("+14155552671", None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(raw_code.len(), 6);

    // The SMS carries the code; the stored record only its hash.
    let (to, template, variables) = harness.notifier.last().await.expect("sms sent");
    assert_eq!(to, "+14155552671");
    assert_eq!(template, "phone_otp");
    assert_eq!(variables["code"].as_str(), Some(raw_code.as_str()));
    assert_ne!(request.otp_hash, raw_code);

    harness
        .engine
        .verify_phone(&raw_code, &mut request)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    assert!(request.is_verified());

    // Terminal record: a second submission of the same code fails.
    let replay = harness.engine.verify_phone(&raw_code, &mut request).await;
    assert_eq!(
        replay.err(),
        Some(AuthError::InvalidOtp {
            attempts_remaining: 0,
        })
    );
    Ok(())
}

#[tokio::test]
async fn otp_request_floods_lock_the_phone() -> Result<()> {
    let harness = Harness::new().await?;

    for _ in 0..5 {
        harness
            .engine
            .request_phone_verification("+14155552671", None)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    let flooded = harness
        .engine
        .request_phone_verification("+14155552671", None)
        .await;
    assert!(matches!(flooded, Err(AuthError::RateLimited { .. })));

    // Another number still goes through.
    harness
        .engine
        .request_phone_verification("+14155550000", None)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}
