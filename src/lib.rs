//! Authentication and session-lifecycle core.
//!
//! Credential verification, sliding-window rate limiting with lockouts,
//! dual-token session issuance and rotation, OTP phone verification, and
//! password-reset token management. Persistence, hashing, and delivery sit
//! behind the collaborator traits in [`store`]; the core holds no secrets
//! at rest and compares every secret in constant time.

pub mod compare;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod memory;
pub mod otp;
pub mod rate_limit;
pub mod reset;
pub mod session;
pub mod store;
pub mod token;

pub use config::{AuthConfig, SignerConfig};
pub use engine::{AuthEngine, OAuthProfile};
pub use error::AuthError;
pub use otp::{OtpManager, PhoneVerificationRequest};
pub use rate_limit::{KeyScope, RateLimitPolicy, RateLimitState, RateLimiter, rate_limit_key};
pub use reset::{PasswordResetManager, PasswordResetRequest, ResetTokenStatus};
pub use session::{IssuedSession, RevocationReason, Session, SessionManager};
pub use store::{
    AuditContext, AuditSink, Argon2Hasher, Notifier, RateLimitStore, SecretHasher, SessionStore,
    UserRecord, UserStore,
};
pub use token::{AccessClaims, TokenCodec};
