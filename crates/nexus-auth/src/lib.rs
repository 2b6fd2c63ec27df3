pub mod captcha;
pub mod core;
pub mod password;
pub mod passkey;
pub mod session;
pub mod store;
pub mod throttle;
pub mod totp;

use subtle::ConstantTimeEq;

pub use crate::captcha::{CaptchaVerifier, NoCaptcha};
pub use crate::core::{AuthConfig, AuthCore, LoginOutcome, PasswordLogin};
pub use crate::passkey::Passkeys;
pub use crate::session::{MemorySessionStore, SessionStore};
pub use crate::store::{
    MemoryPasskeyStore, MemoryUserStore, PasskeyStore, SqlitePasskeyStore, SqliteUserStore,
    UserStore,
};
pub use crate::throttle::{LoginThrottle, MemoryLoginThrottle};

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Generic credential failure. Wrong username, wrong password,
    /// failed CAPTCHA and failed TOTP all collapse into this so the
    /// boundary cannot be used as an oracle.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The session is not in the state the operation requires
    /// (no pending 2FA, temp-token mismatch, missing challenge, …).
    #[error("invalid authentication state")]
    InvalidAuthState,

    #[error("challenge has expired")]
    ChallengeExpired,

    /// Presented signature counter did not strictly exceed the stored
    /// one; treated as a cloned authenticator.
    #[error("signature counter regression")]
    CounterRegression,

    #[error("too many failed attempts")]
    RateLimited,

    #[error("captcha verification failed")]
    CaptchaFailed,

    #[error("not found")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    /// Session-store failure during rotation or save. Surfaces as a
    /// 500 at the boundary; no partial state is left behind.
    #[error("session error: {0}")]
    Session(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Constant-time string equality for secrets (temp-tokens, TOTP codes).
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("abc123", "abc12"));
        assert!(!constant_time_eq("", "x"));
        assert!(constant_time_eq("", ""));
    }
}
