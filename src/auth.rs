//! API-key and password hashing.
//!
//! Keys are stored hashed; the plaintext key is shown to the caller exactly
//! once (at signup or login) and authenticated afterwards by hashing the
//! presented key and looking the hash up in the catalog.

use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Canonical SHA-256 hex of an API key, used for storage and lookup.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// SHA-256 hex of a password.
///
/// Deliberately the same fast unsalted hash the catalog has always held;
/// upgrading to a salted KDF is a migration, not a drop-in change.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

pub fn verify_password(password: &str, hashed: &str) -> bool {
    hash_password(password) == hashed
}

/// Generate a fresh API key: 32 random bytes, hex-encoded.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_canonical_sha256() {
        assert_eq!(
            hash_api_key("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn hash_is_pure() {
        assert_eq!(hash_api_key("abc"), hash_api_key("abc"));
        assert_ne!(hash_api_key("abc"), hash_api_key("abd"));
    }

    #[test]
    fn password_round_trip() {
        let hashed = hash_password("hunter2");
        assert!(verify_password("hunter2", &hashed));
        assert!(!verify_password("hunter3", &hashed));
    }

    #[test]
    fn generated_keys_are_long_and_distinct() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
