use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use nexus_types::EncryptedBlob;
use rand::RngCore;
use zeroize::Zeroize;

use crate::VaultError;

/// The symmetric master key protecting all stored connection secrets.
///
/// Sourced once at startup from the process environment; the raw key
/// bytes are zeroized on drop and never appear in errors or logs.
pub struct MasterKey {
    key: [u8; 32],
}

impl MasterKey {
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Read a 64-hex-char key from the named environment variable.
    /// Absence or a malformed value is fatal at startup.
    pub fn from_env(var: &str) -> Result<Self, VaultError> {
        let raw = std::env::var(var).map_err(|_| VaultError::MissingKey(var.to_string()))?;
        let bytes = hex::decode(raw.trim()).map_err(|_| VaultError::InvalidKey)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| VaultError::InvalidKey)?;
        Ok(Self { key })
    }

    /// Encrypt plaintext with AES-256-GCM using a unique random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| VaultError::CredentialCorrupted)?;

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| VaultError::CredentialCorrupted)?;

        Ok(EncryptedBlob {
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt an AES-256-GCM blob. Any failure collapses into
    /// `CredentialCorrupted`: the error carries no key material and
    /// no hint of which byte failed authentication.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>, VaultError> {
        if blob.nonce.len() != 12 {
            return Err(VaultError::CredentialCorrupted);
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| VaultError::CredentialCorrupted)?;

        let nonce = Nonce::from_slice(&blob.nonce);
        cipher
            .decrypt(nonce, blob.ciphertext.as_ref())
            .map_err(|_| VaultError::CredentialCorrupted)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = MasterKey::from_bytes([42u8; 32]);
        let plaintext = b"hello, world!";
        let blob = key.encrypt(plaintext).unwrap();
        let decrypted = key.decrypt(&blob).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_roundtrip_arbitrary_bytes() {
        let key = MasterKey::from_bytes([7u8; 32]);
        for len in [0usize, 1, 31, 32, 33, 1024] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let blob = key.encrypt(&plaintext).unwrap();
            assert_eq!(key.decrypt(&blob).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_wrong_key_fails_opaquely() {
        let key1 = MasterKey::from_bytes([1u8; 32]);
        let key2 = MasterKey::from_bytes([2u8; 32]);
        let blob = key1.encrypt(b"secret").unwrap();
        match key2.decrypt(&blob) {
            Err(VaultError::CredentialCorrupted) => {}
            other => panic!("expected CredentialCorrupted, got {other:?}"),
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = MasterKey::from_bytes([3u8; 32]);
        let mut blob = key.encrypt(b"secret").unwrap();
        blob.ciphertext[0] ^= 0xff;
        assert!(key.decrypt(&blob).is_err());
    }

    #[test]
    fn test_unique_nonces() {
        let key = MasterKey::from_bytes([42u8; 32]);
        let b1 = key.encrypt(b"data").unwrap();
        let b2 = key.encrypt(b"data").unwrap();
        assert_ne!(b1.nonce, b2.nonce);
    }

    #[test]
    fn test_from_env_missing_is_fatal() {
        std::env::remove_var("NEXUS_TEST_MISSING_KEY");
        match MasterKey::from_env("NEXUS_TEST_MISSING_KEY") {
            Err(VaultError::MissingKey(var)) => assert_eq!(var, "NEXUS_TEST_MISSING_KEY"),
            other => panic!("expected MissingKey, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_from_env_rejects_short_key() {
        std::env::set_var("NEXUS_TEST_SHORT_KEY", "abcd");
        assert!(MasterKey::from_env("NEXUS_TEST_SHORT_KEY").is_err());
    }

    #[test]
    fn test_from_env_accepts_hex_key() {
        std::env::set_var("NEXUS_TEST_GOOD_KEY", "11".repeat(32));
        let key = MasterKey::from_env("NEXUS_TEST_GOOD_KEY").unwrap();
        let blob = key.encrypt(b"x").unwrap();
        assert_eq!(key.decrypt(&blob).unwrap(), b"x");
    }
}
