//! Auth core configuration.
//!
//! All knobs are explicit construction-time values; the core never reads
//! the environment or branches on hidden globals.

use chrono::Duration;

use crate::rate_limit::RateLimitPolicy;

const DEFAULT_ACCESS_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_REFRESH_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_REFRESH_TTL_REMEMBER_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_OTP_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_OTP_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_OTP_LOCKOUT_SECONDS: i64 = 15 * 60;
const DEFAULT_RESET_TTL_SECONDS: i64 = 60 * 60;

const EMAIL_MAX_FAILURES: u32 = 5;
const EMAIL_WINDOW_SECONDS: i64 = 15 * 60;
const EMAIL_LOCKOUT_SECONDS: i64 = 15 * 60;

const IP_MAX_FAILURES: u32 = 20;
const IP_WINDOW_SECONDS: i64 = 15 * 60;
const IP_LOCKOUT_SECONDS: i64 = 30 * 60;

/// Token signing material, selected at construction.
#[derive(Clone)]
pub enum SignerConfig {
    /// Symmetric HMAC-SHA256; the key is shared by every verifier.
    Hmac { key: Vec<u8>, kid: String },
    /// Asymmetric RS256; verifiers only need the public half.
    Rs256 {
        private_key_pem_or_der: Vec<u8>,
        kid: String,
    },
}

impl std::fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output.
        match self {
            Self::Hmac { kid, .. } => f.debug_struct("Hmac").field("kid", kid).finish(),
            Self::Rs256 { kid, .. } => f.debug_struct("Rs256").field("kid", kid).finish(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    issuer: String,
    audience: String,
    signer: SignerConfig,
    access_ttl: Duration,
    refresh_ttl: Duration,
    refresh_ttl_remember: Duration,
    otp_ttl: Duration,
    otp_max_attempts: u32,
    otp_lockout: Duration,
    reset_ttl: Duration,
    email_policy: RateLimitPolicy,
    ip_policy: RateLimitPolicy,
}

impl AuthConfig {
    #[must_use]
    pub fn new(issuer: String, audience: String, signer: SignerConfig) -> Self {
        Self {
            issuer,
            audience,
            signer,
            access_ttl: Duration::seconds(DEFAULT_ACCESS_TTL_SECONDS),
            refresh_ttl: Duration::seconds(DEFAULT_REFRESH_TTL_SECONDS),
            refresh_ttl_remember: Duration::seconds(DEFAULT_REFRESH_TTL_REMEMBER_SECONDS),
            otp_ttl: Duration::seconds(DEFAULT_OTP_TTL_SECONDS),
            otp_max_attempts: DEFAULT_OTP_MAX_ATTEMPTS,
            otp_lockout: Duration::seconds(DEFAULT_OTP_LOCKOUT_SECONDS),
            reset_ttl: Duration::seconds(DEFAULT_RESET_TTL_SECONDS),
            email_policy: RateLimitPolicy {
                max_attempts: EMAIL_MAX_FAILURES,
                window: Duration::seconds(EMAIL_WINDOW_SECONDS),
                lockout: Duration::seconds(EMAIL_LOCKOUT_SECONDS),
            },
            ip_policy: RateLimitPolicy {
                max_attempts: IP_MAX_FAILURES,
                window: Duration::seconds(IP_WINDOW_SECONDS),
                lockout: Duration::seconds(IP_LOCKOUT_SECONDS),
            },
        }
    }

    #[must_use]
    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_remember(mut self, ttl: Duration) -> Self {
        self.refresh_ttl_remember = ttl;
        self
    }

    #[must_use]
    pub fn with_otp_ttl(mut self, ttl: Duration) -> Self {
        self.otp_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_otp_max_attempts(mut self, max: u32) -> Self {
        self.otp_max_attempts = max;
        self
    }

    #[must_use]
    pub fn with_reset_ttl(mut self, ttl: Duration) -> Self {
        self.reset_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_email_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.email_policy = policy;
        self
    }

    #[must_use]
    pub fn with_ip_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.ip_policy = policy;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    #[must_use]
    pub fn signer(&self) -> &SignerConfig {
        &self.signer
    }

    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self, remember_me: bool) -> Duration {
        if remember_me {
            self.refresh_ttl_remember
        } else {
            self.refresh_ttl
        }
    }

    #[must_use]
    pub fn otp_ttl(&self) -> Duration {
        self.otp_ttl
    }

    #[must_use]
    pub fn otp_max_attempts(&self) -> u32 {
        self.otp_max_attempts
    }

    #[must_use]
    pub fn otp_lockout(&self) -> Duration {
        self.otp_lockout
    }

    #[must_use]
    pub fn reset_ttl(&self) -> Duration {
        self.reset_ttl
    }

    #[must_use]
    pub fn email_policy(&self) -> RateLimitPolicy {
        self.email_policy
    }

    #[must_use]
    pub fn ip_policy(&self) -> RateLimitPolicy {
        self.ip_policy
    }
}
