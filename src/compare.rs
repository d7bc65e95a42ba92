//! Constant-time equality for secret material.

use subtle::ConstantTimeEq;

/// Compare two byte strings in constant time.
///
/// Unequal lengths never match, but the comparison still walks the shorter
/// input against itself so the timing profile does not collapse to a length
/// check. Every secret comparison in this crate goes through here.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        // Burn equivalent work; the result is already decided.
        let _ = a.ct_eq(a);
        return false;
    }
    a.ct_eq(b).into()
}

/// Constant-time comparison for string secrets (tokens, hex digests).
#[must_use]
pub fn constant_time_eq_str(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}
