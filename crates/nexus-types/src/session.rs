use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Session ──────────────────────────────────────────────────────
//
// Server-side record; the session-cookie identifier is the sole
// client handle. The identifier is regenerated on every
// authentication-status transition, so a Session value is only valid
// until the next rotation.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub requires_second_factor: bool,
    pub pending_auth: Option<PendingAuth>,
    pub current_challenge: Option<ChallengeRecord>,
    /// Candidate TOTP secret held only while 2FA setup is in flight.
    pub temp_totp_secret: Option<String>,
    /// Cookie TTL in seconds.
    pub cookie_max_age_secs: i64,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some() && !self.requires_second_factor
    }
}

// ── Pending Authentication ───────────────────────────────────────
//
// Attached to a session after a successful password check for a
// user with TOTP enabled. The client must echo `temp_token` within
// the expiry window to complete the second factor.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuth {
    pub user_id: Uuid,
    pub username: String,
    /// 32 random bytes, hex-encoded.
    pub temp_token: String,
    pub remember_me: bool,
    pub expires_at: DateTime<Utc>,
}

// ── WebAuthn Challenge Record ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengePurpose {
    Registration,
    Authentication,
}

/// A pending WebAuthn ceremony. `state` is the verifier library's
/// serialized challenge state; it is opaque to the session layer.
/// Valid for at most five minutes from `issued_at` and consumed on
/// any verification attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRecord {
    pub purpose: ChallengePurpose,
    pub state: serde_json::Value,
    pub issued_at: DateTime<Utc>,
    /// Registration only: the user the challenge was bound to.
    pub user_handle: Option<Uuid>,
}
