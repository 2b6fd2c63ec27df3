use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use secrecy::{ExposeSecret, SecretString};

use crate::AuthError;

/// Verified against when the username does not exist, so unknown-user
/// and wrong-password requests take the same time.
const DUMMY_HASH: &str = "$argon2id$v=19$m=15000,t=2,p=1$\
    gZiV/M1gPc22ElAH/Jh1Hw$\
    CWOrkoo7oJBQ/iyh7uJ0LO2aLEfrHwTWllSAxT0zRno";

/// Hash a password with Argon2id and a fresh random salt.
pub fn hash_password(password: &SecretString) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Internal(format!("password hashing failed: {e}")))
}

/// Verify a candidate password against the stored PHC hash.
///
/// Runs on the blocking pool: Argon2 verification is CPU-bound and
/// must not stall the runtime. Returns `false` for a mismatch; only
/// a malformed stored hash is an error.
pub async fn verify_password(
    stored_hash: Option<String>,
    candidate: SecretString,
) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || {
        let known_user = stored_hash.is_some();
        let hash_string = stored_hash.unwrap_or_else(|| DUMMY_HASH.to_string());
        let parsed = PasswordHash::new(&hash_string)
            .map_err(|e| AuthError::Internal(format!("stored password hash invalid: {e}")))?;
        let matched = Argon2::default()
            .verify_password(candidate.expose_secret().as_bytes(), &parsed)
            .is_ok();
        Ok(matched && known_user)
    })
    .await
    .map_err(|e| AuthError::Internal(format!("verification task failed: {e}")))?
}
