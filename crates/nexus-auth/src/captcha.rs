use async_trait::async_trait;

use crate::AuthError;

// ── CAPTCHA collaborator ─────────────────────────────────────────
//
// The actual provider lives outside the core; the login flow only
// needs a verdict. Implementations must error with `CaptchaFailed`
// on a missing or invalid token.

#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, token: Option<&str>, client_ip: &str) -> Result<(), AuthError>;
}

/// Used when CAPTCHA is disabled.
pub struct NoCaptcha;

#[async_trait]
impl CaptchaVerifier for NoCaptcha {
    async fn verify(&self, _token: Option<&str>, _client_ip: &str) -> Result<(), AuthError> {
        Ok(())
    }
}
