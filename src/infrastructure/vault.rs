//! Symmetric encryption for stored datasource passwords.
//!
//! Ciphertexts are AES-256-GCM, laid out as `nonce(12) || ciphertext || tag`
//! in a single column. The key is derived from the process-wide secret by
//! deterministic padding/truncation to 32 bytes, so the same secret always
//! yields the same key across restarts.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use std::hash::{Hash, Hasher};
use thiserror::Error;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("credential encryption failed: {0}")]
    Encrypt(String),
    /// Usually means the process secret was rotated without re-encrypting
    /// stored credentials. Operator intervention required; never retried.
    #[error("credential unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("cipher", &"Aes256Gcm(redacted)")
            .finish()
    }
}

impl CredentialVault {
    pub fn new(secret: &str) -> Self {
        let key = derive_key(secret);
        let cipher = Aes256Gcm::new_from_slice(&key).expect("derived key is exactly 32 bytes");
        Self { cipher }
    }

    /// Encrypts a cleartext password. Every call draws a fresh random nonce,
    /// so identical passwords never share a ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|err| VaultError::Encrypt(err.to_string()))?;

        let mut stored = nonce_bytes.to_vec();
        stored.extend_from_slice(&ciphertext);
        Ok(stored)
    }

    pub fn decrypt(&self, stored: &[u8]) -> Result<String, VaultError> {
        if stored.len() < NONCE_SIZE {
            return Err(VaultError::Unavailable(
                "stored credential is too short to contain a nonce".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = stored.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|err| VaultError::Unavailable(format!("decryption failed: {err}")))?;

        String::from_utf8(plaintext).map_err(|err| {
            VaultError::Unavailable(format!("decrypted credential is not UTF-8: {err}"))
        })
    }
}

/// Pads with zero bytes or truncates the secret to exactly 32 bytes.
fn derive_key(secret: &str) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    let bytes = secret.as_bytes();
    let take = bytes.len().min(KEY_SIZE);
    key[..take].copy_from_slice(&bytes[..take]);
    key
}

/// Process-local fingerprint of a stored ciphertext, used to key backend
/// pools so a credential rotation rebuilds the pool. Not a cryptographic
/// commitment; only compared within one process lifetime.
pub fn fingerprint(stored: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    stored.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trip_preserves_password() {
        let vault = CredentialVault::new("gateway-secret");
        let stored = vault.encrypt("s3cr3t-p@ssword").unwrap();
        assert_eq!(vault.decrypt(&stored).unwrap(), "s3cr3t-p@ssword");
    }

    #[test]
    fn ciphertext_differs_from_plaintext_and_between_calls() {
        let vault = CredentialVault::new("gateway-secret");
        let a = vault.encrypt("password").unwrap();
        let b = vault.encrypt("password").unwrap();
        assert_ne!(a, b"password".to_vec());
        assert_ne!(a, b, "random nonces must make ciphertexts distinct");
    }

    #[test]
    fn wrong_secret_fails_decryption() {
        let stored = CredentialVault::new("original").encrypt("password").unwrap();
        let err = CredentialVault::new("rotated").decrypt(&stored).unwrap_err();
        assert!(matches!(err, VaultError::Unavailable(_)));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let vault = CredentialVault::new("gateway-secret");
        let mut stored = vault.encrypt("password").unwrap();
        let last = stored.len() - 1;
        stored[last] ^= 0x01;
        assert!(vault.decrypt(&stored).is_err());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let vault = CredentialVault::new("gateway-secret");
        assert!(matches!(
            vault.decrypt(&[0u8; 4]),
            Err(VaultError::Unavailable(_))
        ));
    }

    #[test]
    fn key_derivation_handles_any_secret_length() {
        let short = CredentialVault::new("s");
        let long = CredentialVault::new(&"x".repeat(100));
        assert_eq!(short.decrypt(&short.encrypt("p").unwrap()).unwrap(), "p");
        assert_eq!(long.decrypt(&long.encrypt("p").unwrap()).unwrap(), "p");
    }

    #[test]
    fn long_secrets_are_truncated_deterministically() {
        let base = "y".repeat(40);
        let a = CredentialVault::new(&base);
        // differs only beyond the 32-byte cut
        let b = CredentialVault::new(&format!("{}{}", &base[..32], "z".repeat(8)));
        let stored = a.encrypt("p").unwrap();
        assert_eq!(b.decrypt(&stored).unwrap(), "p");
    }

    #[test]
    fn fingerprint_tracks_ciphertext_changes() {
        let vault = CredentialVault::new("gateway-secret");
        let a = vault.encrypt("password").unwrap();
        let b = vault.encrypt("password").unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&a));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    proptest! {
        #[test]
        fn round_trip_is_identity_for_any_password(password in ".{0,64}") {
            let vault = CredentialVault::new("property-secret");
            let stored = vault.encrypt(&password).unwrap();
            prop_assert_ne!(&stored, &password.as_bytes().to_vec());
            prop_assert_eq!(vault.decrypt(&stored).unwrap(), password);
        }
    }
}
