//! Token generation, signing, and verification.
//!
//! Two kinds of credential live here. Access tokens are short-lived signed
//! claim sets (HS256 or RS256, selected by configuration). Refresh and
//! reset tokens are opaque random values; only their SHA-256 digest is ever
//! stored, and a refresh token carries its session id in clear so a stale
//! replay can still be attributed to the session it was stolen from.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{Keypair, SignatureEncoding, Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::SignerConfig;
use crate::error::AuthError;

pub const TOKEN_VERSION: u8 = 1;

const OPAQUE_TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

impl TokenHeader {
    fn new(alg: &str, kid: &str) -> Self {
        Self {
            alg: alg.to_string(),
            typ: "JWT".to_string(),
            kid: kid.to_string(),
        }
    }
}

/// Claims carried by a short-lived access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub v: u8,
    pub iss: String,
    pub aud: String,
    /// User id.
    pub sub: String,
    pub email: String,
    /// Session id the token was issued under.
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Signs and verifies access tokens. Implementations are selected by
/// [`SignerConfig`]; callers depend only on this interface.
pub trait TokenCodec: Send + Sync {
    /// Serialize and sign a claim set.
    ///
    /// # Errors
    /// Returns an error if encoding or signing fails.
    fn sign(&self, claims: &AccessClaims) -> Result<String>;

    /// Verify a token and return its claims.
    ///
    /// # Errors
    /// `TokenInvalid` for malformed input, wrong signature, or claim
    /// mismatch; `TokenExpired` once `exp` has passed at `now`.
    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, AuthError>;
}

/// Build the configured codec.
///
/// # Errors
/// Returns an error if the configured key material cannot be parsed.
pub fn codec_from_config(issuer: &str, audience: &str, signer: &SignerConfig) -> Result<Box<dyn TokenCodec>> {
    match signer {
        SignerConfig::Hmac { key, kid } => Ok(Box::new(HmacTokenCodec::new(
            key,
            kid.clone(),
            issuer.to_string(),
            audience.to_string(),
        ))),
        SignerConfig::Rs256 {
            private_key_pem_or_der,
            kid,
        } => Ok(Box::new(RsaTokenCodec::new(
            private_key_pem_or_der,
            kid.clone(),
            issuer.to_string(),
            audience.to_string(),
        )?)),
    }
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value).context("failed to encode token segment")?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, AuthError> {
    let bytes = Base64UrlUnpadded::decode_vec(segment).map_err(|_| AuthError::TokenInvalid)?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::TokenInvalid)
}

fn split_jwt(token: &str) -> Result<(&str, &str, &str), AuthError> {
    let mut parts = token.split('.');
    let header = parts.next().ok_or(AuthError::TokenInvalid)?;
    let claims = parts.next().ok_or(AuthError::TokenInvalid)?;
    let signature = parts.next().ok_or(AuthError::TokenInvalid)?;
    if parts.next().is_some() {
        return Err(AuthError::TokenInvalid);
    }
    Ok((header, claims, signature))
}

fn check_claims(
    claims: &AccessClaims,
    issuer: &str,
    audience: &str,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    if claims.v != TOKEN_VERSION || claims.iss != issuer || claims.aud != audience {
        return Err(AuthError::TokenInvalid);
    }
    if claims.exp <= now.timestamp() {
        return Err(AuthError::TokenExpired);
    }
    Ok(())
}

/// HS256 codec. The shared key must stay server-side; anyone holding it can
/// mint tokens.
pub struct HmacTokenCodec {
    key: Vec<u8>,
    kid: String,
    issuer: String,
    audience: String,
}

impl HmacTokenCodec {
    #[must_use]
    pub fn new(key: &[u8], kid: String, issuer: String, audience: String) -> Self {
        Self {
            key: key.to_vec(),
            kid,
            issuer,
            audience,
        }
    }
}

impl TokenCodec for HmacTokenCodec {
    fn sign(&self, claims: &AccessClaims) -> Result<String> {
        let header = TokenHeader::new("HS256", &self.kid);
        let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(claims)?);
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).context("invalid hmac key")?;
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();
        Ok(format!(
            "{signing_input}.{}",
            Base64UrlUnpadded::encode_string(&signature)
        ))
    }

    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, AuthError> {
        let (header_b64, claims_b64, sig_b64) = split_jwt(token)?;
        let header: TokenHeader = b64d_json(header_b64)?;
        if header.alg != "HS256" {
            return Err(AuthError::TokenInvalid);
        }

        let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| AuthError::TokenInvalid)?;
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.key).map_err(|_| AuthError::TokenInvalid)?;
        mac.update(format!("{header_b64}.{claims_b64}").as_bytes());
        // verify_slice is a constant-time comparison.
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::TokenInvalid)?;

        let claims: AccessClaims = b64d_json(claims_b64)?;
        check_claims(&claims, &self.issuer, &self.audience, now)?;
        Ok(claims)
    }
}

/// RS256 codec. Verification needs only the public half, so stateless
/// verifiers can hold no signing capability.
pub struct RsaTokenCodec {
    signing_key: SigningKey<Sha256>,
    verifying_key: VerifyingKey<Sha256>,
    kid: String,
    issuer: String,
    audience: String,
}

impl RsaTokenCodec {
    /// # Errors
    /// Returns an error if the key is neither PKCS#8 nor PKCS#1, PEM or DER.
    pub fn new(
        private_key_pem_or_der: &[u8],
        kid: String,
        issuer: String,
        audience: String,
    ) -> Result<Self> {
        let private_key = decode_private_key(private_key_pem_or_der)?;
        let signing_key = SigningKey::<Sha256>::new(private_key);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
            kid,
            issuer,
            audience,
        })
    }
}

fn decode_private_key(pem_or_der: &[u8]) -> Result<RsaPrivateKey> {
    if pem_or_der.starts_with(b"-----BEGIN") {
        let s = std::str::from_utf8(pem_or_der).context("invalid key encoding")?;
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(s) {
            return Ok(key);
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(s) {
            return Ok(key);
        }
        anyhow::bail!("failed to parse RSA private key PEM");
    }

    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(pem_or_der) {
        return Ok(key);
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs1_der(pem_or_der) {
        return Ok(key);
    }
    anyhow::bail!("failed to parse RSA private key DER")
}

impl TokenCodec for RsaTokenCodec {
    fn sign(&self, claims: &AccessClaims) -> Result<String> {
        let header = TokenHeader::new("RS256", &self.kid);
        let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(claims)?);
        let signature: Signature = self.signing_key.sign(signing_input.as_bytes());
        Ok(format!(
            "{signing_input}.{}",
            Base64UrlUnpadded::encode_string(&signature.to_vec())
        ))
    }

    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, AuthError> {
        let (header_b64, claims_b64, sig_b64) = split_jwt(token)?;
        let header: TokenHeader = b64d_json(header_b64)?;
        if header.alg != "RS256" {
            return Err(AuthError::TokenInvalid);
        }

        let signature_bytes =
            Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| AuthError::TokenInvalid)?;
        let signature =
            Signature::try_from(signature_bytes.as_slice()).map_err(|_| AuthError::TokenInvalid)?;
        self.verifying_key
            .verify(format!("{header_b64}.{claims_b64}").as_bytes(), &signature)
            .map_err(|_| AuthError::TokenInvalid)?;

        let claims: AccessClaims = b64d_json(claims_b64)?;
        check_claims(&claims, &self.issuer, &self.audience, now)?;
        Ok(claims)
    }
}

/// Create a fresh opaque token: 32 random bytes, base64url without padding.
/// The raw value is only returned to the client; storage keeps a hash.
///
/// # Errors
/// Returns an error if the system randomness source fails.
pub fn generate_opaque_token() -> Result<String> {
    let mut bytes = [0u8; OPAQUE_TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate opaque token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Hash an opaque token so raw values never touch storage.
#[must_use]
pub fn hash_opaque_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    Base64UrlUnpadded::encode_string(&digest)
}

/// Build a refresh token: `{session_id}.{secret}`. The id prefix lets a
/// stale replay be traced back to its session for theft detection.
#[must_use]
pub fn compose_refresh_token(session_id: Uuid, secret: &str) -> String {
    format!("{session_id}.{secret}")
}

/// Split a presented refresh token into its session id and secret.
pub fn split_refresh_token(token: &str) -> Result<(Uuid, &str), AuthError> {
    let (id, secret) = token.split_once('.').ok_or(AuthError::TokenInvalid)?;
    let session_id = Uuid::parse_str(id).map_err(|_| AuthError::TokenInvalid)?;
    if secret.is_empty() {
        return Err(AuthError::TokenInvalid);
    }
    Ok((session_id, secret))
}
