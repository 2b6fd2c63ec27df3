use base32::Alphabet;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use crate::constant_time_eq;

const TIME_STEP_SECS: u64 = 30;
const DIGITS: u32 = 6;

/// Generate a random 160-bit shared secret, base32-encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    base32::encode(Alphabet::Rfc4648 { padding: false }, &bytes)
}

/// `otpauth://` provisioning URI for authenticator-app enrollment.
pub fn provisioning_uri(issuer: &str, account: &str, secret: &str) -> String {
    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm=SHA1&digits={}&period={}",
        urlencoding::encode(issuer),
        urlencoding::encode(account),
        secret,
        urlencoding::encode(issuer),
        DIGITS,
        TIME_STEP_SECS,
    )
}

/// Verify a code against the shared secret, allowing `window` steps of
/// clock drift in both directions.
pub fn verify(secret: &str, code: &str, window: u64) -> bool {
    verify_at(secret, code, Utc::now().timestamp().max(0) as u64, window)
}

/// The code the shared secret produces at a given instant. Used by
/// enrollment tooling; verification goes through `verify`.
pub fn code_at(secret: &str, unix_time: u64) -> Option<String> {
    let secret_bytes = base32::decode(Alphabet::Rfc4648 { padding: false }, secret)?;
    Some(generate_code(&secret_bytes, unix_time / TIME_STEP_SECS))
}

pub fn verify_at(secret: &str, code: &str, unix_time: u64, window: u64) -> bool {
    let Some(secret_bytes) = base32::decode(Alphabet::Rfc4648 { padding: false }, secret) else {
        return false;
    };

    let current_step = unix_time / TIME_STEP_SECS;
    for drift in 0..=window {
        if constant_time_eq(&generate_code(&secret_bytes, current_step + drift), code) {
            return true;
        }
        if drift > 0
            && constant_time_eq(
                &generate_code(&secret_bytes, current_step.saturating_sub(drift)),
                code,
            )
        {
            return true;
        }
    }
    false
}

/// RFC 6238 code for one time step: HMAC-SHA1 + dynamic truncation.
fn generate_code(secret: &[u8], step: u64) -> String {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(&step.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[19] & 0x0f) as usize;
    let value = ((digest[offset] & 0x7f) as u32) << 24
        | (digest[offset + 1] as u32) << 16
        | (digest[offset + 2] as u32) << 8
        | digest[offset + 3] as u32;

    format!("{:06}", value % 10u32.pow(DIGITS))
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 test secret: ASCII "12345678901234567890".
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn test_rfc6238_vector() {
        // T = 59s → step 1 → 8-digit code 94287082; last six digits.
        assert!(verify_at(RFC_SECRET, "287082", 59, 0));
    }

    #[test]
    fn test_window_accepts_adjacent_steps() {
        let bytes = base32::decode(Alphabet::Rfc4648 { padding: false }, RFC_SECRET).unwrap();
        let now = 1_700_000_000u64;
        let step = now / TIME_STEP_SECS;

        let previous = generate_code(&bytes, step - 1);
        let next = generate_code(&bytes, step + 1);
        assert!(verify_at(RFC_SECRET, &previous, now, 1));
        assert!(verify_at(RFC_SECRET, &next, now, 1));
    }

    #[test]
    fn test_window_rejects_distant_steps() {
        let bytes = base32::decode(Alphabet::Rfc4648 { padding: false }, RFC_SECRET).unwrap();
        let now = 1_700_000_000u64;
        let stale = generate_code(&bytes, now / TIME_STEP_SECS - 2);
        assert!(!verify_at(RFC_SECRET, &stale, now, 1));
    }

    #[test]
    fn test_wrong_code_rejected() {
        let secret = generate_secret();
        assert!(!verify_at(&secret, "000000", 1_700_000_000, 1));
    }

    #[test]
    fn test_bad_secret_rejected() {
        assert!(!verify_at("not base32!!", "123456", 1_700_000_000, 1));
    }

    #[test]
    fn test_provisioning_uri_shape() {
        let uri = provisioning_uri("Nexus", "alice@example.com", RFC_SECRET);
        assert!(uri.starts_with("otpauth://totp/"));
        assert!(uri.contains(RFC_SECRET));
        assert!(uri.contains("digits=6"));
        assert!(uri.contains("period=30"));
    }
}
