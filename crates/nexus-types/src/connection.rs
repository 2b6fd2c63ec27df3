use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ── Authentication Kind ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    None,
    Password,
    Key,
}

impl std::fmt::Display for AuthKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Password => write!(f, "password"),
            Self::Key => write!(f, "key"),
        }
    }
}

// ── Encrypted Blob ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

// ── Connection Record ────────────────────────────────────────────
//
// Identifies a target host. Secrets are stored as opaque ciphertext
// blobs and only ever decrypted into a DecryptedCredentials that
// lives for the duration of a single operation.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    pub encrypted_password: Option<EncryptedBlob>,
    pub encrypted_private_key: Option<EncryptedBlob>,
    pub encrypted_passphrase: Option<EncryptedBlob>,
    pub proxy_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_ssh_port() -> u16 {
    22
}

// ── Decrypted Credentials ────────────────────────────────────────
//
// Transient, in-memory only. Deliberately does not derive Serialize
// so plaintext secrets cannot end up in a store or a log record by
// accident; the Debug impl only reports which fields are present.

#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct DecryptedCredentials {
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for DecryptedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedCredentials")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = DecryptedCredentials {
            password: Some("hunter2".into()),
            private_key: None,
            passphrase: None,
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_auth_kind_serde() {
        let json = serde_json::to_string(&AuthKind::Key).unwrap();
        assert_eq!(json, "\"key\"");
        let back: AuthKind = serde_json::from_str("\"password\"").unwrap();
        assert_eq!(back, AuthKind::Password);
    }
}
