//! Pure format and strength checks for credentials.
//!
//! No I/O and no storage dependencies; registration and OTP request paths
//! run exactly the same checks.

use regex::Regex;

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PHONE_DIGITS: usize = 15;

/// Normalize an email for lookup, uniqueness, and rate-limit keys.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
#[must_use]
pub fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Outcome of a password strength check, with one message per failed rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordStrength {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Check password strength: at least 8 characters with one uppercase, one
/// lowercase, and one digit.
#[must_use]
pub fn validate_password_strength(password: &str) -> PasswordStrength {
    let mut errors = Vec::new();
    if password.chars().count() < MIN_PASSWORD_LEN {
        errors.push(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        ));
    }
    if !password.chars().any(|ch| ch.is_ascii_uppercase()) {
        errors.push("password must contain an uppercase letter".to_string());
    }
    if !password.chars().any(|ch| ch.is_ascii_lowercase()) {
        errors.push("password must contain a lowercase letter".to_string());
    }
    if !password.chars().any(|ch| ch.is_ascii_digit()) {
        errors.push("password must contain a digit".to_string());
    }
    PasswordStrength {
        valid: errors.is_empty(),
        errors,
    }
}

/// E.164 phone check: optional leading `+`, 2-15 digits, first digit non-zero.
#[must_use]
pub fn valid_phone(phone: &str) -> bool {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if digits.len() < 2 || digits.len() > MAX_PHONE_DIGITS {
        return false;
    }
    if !digits.as_bytes().iter().all(u8::is_ascii_digit) {
        return false;
    }
    !digits.starts_with('0')
}

/// Mask a phone number for display: country hint plus the last two digits.
#[must_use]
pub fn mask_phone(phone: &str) -> String {
    let (prefix, digits) = match phone.strip_prefix('+') {
        Some(rest) => ("+", rest),
        None => ("", phone),
    };
    if digits.len() <= 4 {
        return format!("{prefix}{}", "*".repeat(digits.len()));
    }
    let (head, tail) = digits.split_at(digits.len() - 2);
    let visible_head = &head[..2.min(head.len())];
    let masked = "*".repeat(head.len() - visible_head.len());
    format!("{prefix}{visible_head}{masked}{tail}")
}
