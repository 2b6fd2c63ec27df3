use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── User ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    /// Base32 TOTP shared secret; present once 2FA setup is confirmed.
    pub totp_secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Passkey Record ───────────────────────────────────────────────
//
// One row per registered WebAuthn credential. `credential_json` is
// the verifier library's serialized credential; the columns next to
// it mirror the fields the control plane consults directly.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasskeyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Base64url of the raw credential id presented by the client.
    pub credential_id: String,
    pub credential_json: String,
    /// Signature counter. Monotonically non-decreasing; a presented
    /// counter that does not strictly exceed this value aborts
    /// authentication.
    pub counter: u32,
    pub transports: Vec<String>,
    pub name: String,
    pub backed_up: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}
