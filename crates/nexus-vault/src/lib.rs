pub mod crypto;
pub mod store;

use nexus_types::{AuthKind, ConnectionRecord, DecryptedCredentials, EncryptedBlob};
use std::sync::Arc;
use uuid::Uuid;

pub use crypto::MasterKey;
pub use store::{ConnectionStore, MemoryConnectionStore, SqliteConnectionStore};

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("master key environment variable {0} is not set")]
    MissingKey(String),

    #[error("master key must be 32 bytes of hex")]
    InvalidKey,

    /// Covers every decryption failure and every record whose
    /// ciphertext fields violate the auth-kind invariants. The
    /// message is deliberately uniform.
    #[error("stored credential is corrupted")]
    CredentialCorrupted,

    #[error("connection not found: {0}")]
    NotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(String),
}

// ── Vault ────────────────────────────────────────────────────────

/// Encrypts and decrypts stored connection secrets. Stateless apart
/// from the master key; safe to share across executors.
pub struct Vault {
    key: MasterKey,
    connections: Arc<dyn ConnectionStore>,
}

impl Vault {
    pub fn new(key: MasterKey, connections: Arc<dyn ConnectionStore>) -> Self {
        Self { key, connections }
    }

    pub fn connections(&self) -> &Arc<dyn ConnectionStore> {
        &self.connections
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, VaultError> {
        self.key.encrypt(plaintext)
    }

    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>, VaultError> {
        self.key.decrypt(blob)
    }

    /// Encrypt a UTF-8 secret for storage on a connection record.
    pub fn encrypt_str(&self, plaintext: &str) -> Result<EncryptedBlob, VaultError> {
        self.key.encrypt(plaintext.as_bytes())
    }

    fn decrypt_str(&self, blob: &EncryptedBlob) -> Result<String, VaultError> {
        let bytes = self.key.decrypt(blob)?;
        String::from_utf8(bytes).map_err(|_| VaultError::CredentialCorrupted)
    }

    /// Fetch a connection record and decrypt the credential fields its
    /// auth kind calls for. The decrypted composite is transient and
    /// must be dropped when the operation completes.
    pub async fn load(
        &self,
        connection_id: Uuid,
    ) -> Result<(ConnectionRecord, DecryptedCredentials), VaultError> {
        let record = self
            .connections
            .get(connection_id)
            .await?
            .ok_or(VaultError::NotFound(connection_id))?;

        let creds = self.decrypt_record(&record)?;
        Ok((record, creds))
    }

    /// Decrypt the fields applicable to the record's auth kind,
    /// enforcing the presence invariants along the way.
    pub fn decrypt_record(
        &self,
        record: &ConnectionRecord,
    ) -> Result<DecryptedCredentials, VaultError> {
        let mut creds = DecryptedCredentials::default();
        match record.auth_kind {
            AuthKind::None => {}
            AuthKind::Password => {
                let blob = record
                    .encrypted_password
                    .as_ref()
                    .ok_or(VaultError::CredentialCorrupted)?;
                creds.password = Some(self.decrypt_str(blob)?);
            }
            AuthKind::Key => {
                let blob = record
                    .encrypted_private_key
                    .as_ref()
                    .ok_or(VaultError::CredentialCorrupted)?;
                creds.private_key = Some(self.decrypt_str(blob)?);
                if let Some(blob) = record.encrypted_passphrase.as_ref() {
                    creds.passphrase = Some(self.decrypt_str(blob)?);
                }
            }
        }
        Ok(creds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn vault() -> Vault {
        Vault::new(
            MasterKey::from_bytes([9u8; 32]),
            Arc::new(MemoryConnectionStore::new()),
        )
    }

    fn base_record(kind: AuthKind) -> ConnectionRecord {
        ConnectionRecord {
            id: Uuid::new_v4(),
            name: "target".into(),
            host: "10.0.0.5".into(),
            port: 22,
            username: "deploy".into(),
            auth_kind: kind,
            encrypted_password: None,
            encrypted_private_key: None,
            encrypted_passphrase: None,
            proxy_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_load_password_connection() {
        let vault = vault();
        let mut record = base_record(AuthKind::Password);
        record.encrypted_password = Some(vault.encrypt_str("s3cret").unwrap());
        vault.connections().insert(&record).await.unwrap();

        let (loaded, creds) = vault.load(record.id).await.unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(creds.password.as_deref(), Some("s3cret"));
        assert!(creds.private_key.is_none());
    }

    #[tokio::test]
    async fn test_load_key_connection_with_passphrase() {
        let vault = vault();
        let mut record = base_record(AuthKind::Key);
        record.encrypted_private_key = Some(vault.encrypt_str("-----BEGIN KEY-----").unwrap());
        record.encrypted_passphrase = Some(vault.encrypt_str("phrase").unwrap());
        vault.connections().insert(&record).await.unwrap();

        let (_, creds) = vault.load(record.id).await.unwrap();
        assert_eq!(creds.private_key.as_deref(), Some("-----BEGIN KEY-----"));
        assert_eq!(creds.passphrase.as_deref(), Some("phrase"));
    }

    #[tokio::test]
    async fn test_password_kind_without_ciphertext_is_corrupted() {
        let vault = vault();
        let record = base_record(AuthKind::Password);
        vault.connections().insert(&record).await.unwrap();

        match vault.load(record.id).await {
            Err(VaultError::CredentialCorrupted) => {}
            other => panic!("expected CredentialCorrupted, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_load_unknown_connection() {
        let vault = vault();
        match vault.load(Uuid::new_v4()).await {
            Err(VaultError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_none_kind_decrypts_nothing() {
        let vault = vault();
        let record = base_record(AuthKind::None);
        vault.connections().insert(&record).await.unwrap();

        let (_, creds) = vault.load(record.id).await.unwrap();
        assert!(creds.password.is_none());
        assert!(creds.private_key.is_none());
        assert!(creds.passphrase.is_none());
    }
}
