//! Opaque bearer tokens for the Connection Gateway and HTTP surface.
//!
//! Credential issuance and password hashing are an external collaborator per
//! the system's scope (§1); `hash_password`/`verify_password` exist only so
//! this crate is runnable standalone, and should be replaced with a vetted
//! KDF (argon2/bcrypt) by a real deployment. Token generation and constant-
//! time comparison follow the same `/dev/urandom` CSPRNG pattern used
//! elsewhere in this codebase for secret material.

use sha2::{Digest, Sha256};
use std::io::Read;

/// Generate a random 64-character hex bearer token.
pub fn generate_token() -> String {
    random_hex(32)
}

fn random_hex(n_bytes: usize) -> String {
    use std::fmt::Write;
    let mut bytes = vec![0u8; n_bytes];
    let f = std::fs::File::open("/dev/urandom").expect("failed to open /dev/urandom");
    (&f).read_exact(&mut bytes).expect("failed to read random bytes");
    let mut hex = String::with_capacity(n_bytes * 2);
    for b in &bytes {
        write!(hex, "{b:02x}").unwrap();
    }
    hex
}

/// Salted SHA-256 password hash, stored as `"<salt_hex>$<digest_hex>"`.
pub fn hash_password(password: &str) -> String {
    let salt = random_hex(16);
    let digest = digest_with_salt(&salt, password);
    format!("{salt}${digest}")
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, expected)) = stored.split_once('$') else {
        return false;
    };
    let actual = digest_with_salt(salt, password);
    constant_time_eq(actual.as_bytes(), expected.as_bytes())
}

fn digest_with_salt(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let result = hasher.finalize();
    result.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
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
    fn token_is_64_hex_chars() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn token_is_unique() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn password_roundtrip() {
        let hash = hash_password("hunter2");
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn password_hash_is_salted() {
        // Same password hashed twice should differ due to random salts.
        assert_ne!(hash_password("hunter2"), hash_password("hunter2"));
    }

    #[test]
    fn verify_rejects_malformed_stored_hash() {
        assert!(!verify_password("anything", "no-dollar-sign-here"));
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
        assert!(!constant_time_eq(b"", b"a"));
        assert!(constant_time_eq(b"", b""));
    }
}
