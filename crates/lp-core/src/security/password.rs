//! Password hashing, login password policy, and session token generation.
//!
//! Hashes are bcrypt (cost 12). The policy checks run in a fixed order so
//! the rejection message for a given password is deterministic: length,
//! then uppercase, then lowercase, then digit.

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("Hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

/// A password policy violation. Display strings are the user-visible
/// messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("Password must be at least {0} characters long")]
    TooShort(usize),
    #[error("Password must contain at least one uppercase letter")]
    NoUppercase,
    #[error("Password must contain at least one lowercase letter")]
    NoLowercase,
    #[error("Password must contain at least one number")]
    NoDigit,
}

/// Check a candidate password against the login policy.
///
/// Rules are evaluated in a fixed order and the first violation is
/// returned, so identical inputs always produce identical messages.
pub fn validate_password_policy(password: &str, min_length: usize) -> Result<(), PolicyViolation> {
    if password.len() < min_length {
        return Err(PolicyViolation::TooShort(min_length));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(PolicyViolation::NoUppercase);
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(PolicyViolation::NoLowercase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(PolicyViolation::NoDigit);
    }
    Ok(())
}

/// Hash a password with bcrypt at cost 12.
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    Ok(bcrypt::hash(password, 12)?)
}

/// Verify a password against a stored bcrypt hash.
///
/// A malformed stored hash counts as a mismatch rather than an error so
/// the caller's lockout accounting stays uniform.
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Generate a 64-character hex token from 32 bytes of OS randomness.
///
/// Used for session identifiers and CSRF tokens.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Generate a random password guaranteed to satisfy the login policy.
///
/// Contains at least one character from each required category, then a
/// Fisher-Yates shuffle so category positions are not predictable.
pub fn generate_password(length: usize) -> String {
    let length = length.max(4);
    let mut rng = rand::thread_rng();

    const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    const DIGIT: &[u8] = b"0123456789";
    const ALL: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*()-_=+";

    let mut password = Vec::with_capacity(length);
    password.push(UPPER[rng.gen_range(0..UPPER.len())]);
    password.push(LOWER[rng.gen_range(0..LOWER.len())]);
    password.push(DIGIT[rng.gen_range(0..DIGIT.len())]);
    for _ in 3..length {
        password.push(ALL[rng.gen_range(0..ALL.len())]);
    }

    for i in (1..password.len()).rev() {
        let j = rng.gen_range(0..=i);
        password.swap(i, j);
    }

    String::from_utf8(password).expect("password bytes are all ASCII")
}

/// Constant-time string comparison for token checks.
///
/// Always touches every byte of both inputs so timing does not leak the
/// position of the first mismatch.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("Admin123").unwrap();
        assert!(hash.starts_with("$2"));
        assert!(verify_password("Admin123", &hash));
        assert!(!verify_password("admin123", &hash));
    }

    #[test]
    fn test_malformed_hash_is_mismatch() {
        assert!(!verify_password("anything", "not-a-bcrypt-hash"));
        assert!(!verify_password("anything", ""));
    }

    #[test]
    fn test_policy_order_is_fixed() {
        // Length violation wins even when other rules also fail.
        assert_eq!(
            validate_password_policy("ab1", 8),
            Err(PolicyViolation::TooShort(8))
        );
        assert_eq!(
            validate_password_policy("alllowercase1", 8),
            Err(PolicyViolation::NoUppercase)
        );
        assert_eq!(
            validate_password_policy("ALLUPPERCASE1", 8),
            Err(PolicyViolation::NoLowercase)
        );
        assert_eq!(
            validate_password_policy("NoDigitsHere", 8),
            Err(PolicyViolation::NoDigit)
        );
        assert_eq!(validate_password_policy("GoodPass1", 8), Ok(()));
    }

    #[test]
    fn test_policy_messages() {
        assert_eq!(
            PolicyViolation::TooShort(8).to_string(),
            "Password must be at least 8 characters long"
        );
        assert_eq!(
            PolicyViolation::NoUppercase.to_string(),
            "Password must contain at least one uppercase letter"
        );
        assert_eq!(
            PolicyViolation::NoLowercase.to_string(),
            "Password must contain at least one lowercase letter"
        );
        assert_eq!(
            PolicyViolation::NoDigit.to_string(),
            "Password must contain at least one number"
        );
    }

    #[test]
    fn test_generate_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_token(), token);
    }

    #[test]
    fn test_generated_password_passes_policy() {
        for _ in 0..50 {
            let pw = generate_password(12);
            assert_eq!(pw.len(), 12);
            assert!(validate_password_policy(&pw, 8).is_ok(), "failed: {}", pw);
        }
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("abc123", "abc12"));
        assert!(!constant_time_eq("", "a"));
        assert!(constant_time_eq("", ""));
    }
}
