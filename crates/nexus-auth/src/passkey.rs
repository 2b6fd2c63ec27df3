use base64::Engine;
use chrono::Utc;
use nexus_types::{ChallengePurpose, ChallengeRecord, PasskeyRecord, User};
use webauthn_rs::prelude::{
    AuthenticationResult, CreationChallengeResponse, Passkey, PasskeyAuthentication,
    PasskeyRegistration, PublicKeyCredential, RegisterPublicKeyCredential,
    RequestChallengeResponse, Url,
};
use webauthn_rs::{Webauthn, WebauthnBuilder};

use crate::AuthError;

// ── Passkey sequencing ───────────────────────────────────────────
//
// The control plane does not implement WebAuthn cryptography; it
// sequences ceremonies through the verifier library and enforces the
// lifecycle rules around them (challenge TTL, counter monotonicity).

#[derive(Debug, Clone)]
pub struct PasskeyConfig {
    pub rp_id: String,
    pub rp_origin: String,
    pub rp_name: String,
}

pub struct Passkeys {
    webauthn: Webauthn,
}

impl Passkeys {
    pub fn new(config: &PasskeyConfig) -> Result<Self, AuthError> {
        let origin = Url::parse(&config.rp_origin)
            .map_err(|e| AuthError::Internal(format!("invalid relying-party origin: {e}")))?;
        let webauthn = WebauthnBuilder::new(&config.rp_id, &origin)
            .map_err(|e| AuthError::Internal(format!("webauthn setup failed: {e}")))?
            .rp_name(&config.rp_name)
            .build()
            .map_err(|e| AuthError::Internal(format!("webauthn setup failed: {e}")))?;
        Ok(Self { webauthn })
    }

    /// Begin registration for an authenticated user. Existing
    /// credentials are excluded so the authenticator will not
    /// re-register one it already holds.
    pub fn start_registration(
        &self,
        user: &User,
        existing: &[PasskeyRecord],
    ) -> Result<(CreationChallengeResponse, ChallengeRecord), AuthError> {
        let exclude = existing
            .iter()
            .filter_map(|record| parse_stored_passkey(record).ok())
            .map(|pk| pk.cred_id().clone())
            .collect::<Vec<_>>();
        let exclude = if exclude.is_empty() { None } else { Some(exclude) };

        let (ccr, state) = self
            .webauthn
            .start_passkey_registration(user.id, &user.username, &user.username, exclude)
            .map_err(|e| AuthError::Internal(format!("registration options failed: {e}")))?;

        let challenge = ChallengeRecord {
            purpose: ChallengePurpose::Registration,
            state: serde_json::to_value(&state)
                .map_err(|e| AuthError::Internal(format!("challenge serialization: {e}")))?,
            issued_at: Utc::now(),
            user_handle: Some(user.id),
        };
        Ok((ccr, challenge))
    }

    pub fn finish_registration(
        &self,
        challenge: &ChallengeRecord,
        response: &RegisterPublicKeyCredential,
    ) -> Result<Passkey, AuthError> {
        let state: PasskeyRegistration = serde_json::from_value(challenge.state.clone())
            .map_err(|_| AuthError::InvalidAuthState)?;
        self.webauthn
            .finish_passkey_registration(response, &state)
            .map_err(|e| {
                tracing::debug!("passkey registration rejected: {e}");
                AuthError::InvalidCredentials
            })
    }

    /// Begin authentication against the given candidate credentials.
    pub fn start_authentication(
        &self,
        candidates: &[PasskeyRecord],
    ) -> Result<(RequestChallengeResponse, ChallengeRecord), AuthError> {
        let passkeys = candidates
            .iter()
            .filter_map(|record| parse_stored_passkey(record).ok())
            .collect::<Vec<_>>();
        if passkeys.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }

        let (rcr, state) = self
            .webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|e| AuthError::Internal(format!("authentication options failed: {e}")))?;

        let challenge = ChallengeRecord {
            purpose: ChallengePurpose::Authentication,
            state: serde_json::to_value(&state)
                .map_err(|e| AuthError::Internal(format!("challenge serialization: {e}")))?,
            issued_at: Utc::now(),
            user_handle: None,
        };
        Ok((rcr, challenge))
    }

    pub fn finish_authentication(
        &self,
        challenge: &ChallengeRecord,
        response: &PublicKeyCredential,
    ) -> Result<AuthenticationResult, AuthError> {
        let state: PasskeyAuthentication = serde_json::from_value(challenge.state.clone())
            .map_err(|_| AuthError::InvalidAuthState)?;
        self.webauthn
            .finish_passkey_authentication(response, &state)
            .map_err(|e| {
                tracing::debug!("passkey assertion rejected: {e}");
                AuthError::InvalidCredentials
            })
    }
}

/// Stored credential → library credential.
fn parse_stored_passkey(record: &PasskeyRecord) -> Result<Passkey, AuthError> {
    serde_json::from_str(&record.credential_json)
        .map_err(|e| AuthError::Storage(format!("stored passkey unreadable: {e}")))
}

/// Canonical string form of a raw credential id, used as the lookup
/// key in the passkey store.
pub fn credential_id_string(raw: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

/// Transport hints as reported by the client, flattened to strings.
pub fn transports_from_response(response: &RegisterPublicKeyCredential) -> Vec<String> {
    response
        .response
        .transports
        .as_ref()
        .map(|transports| {
            transports
                .iter()
                .filter_map(|t| {
                    serde_json::to_value(t)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PasskeyConfig {
        PasskeyConfig {
            rp_id: "example.com".into(),
            rp_origin: "https://example.com".into(),
            rp_name: "Nexus".into(),
        }
    }

    #[test]
    fn test_builder_accepts_valid_config() {
        assert!(Passkeys::new(&config()).is_ok());
    }

    #[test]
    fn test_builder_rejects_bad_origin() {
        let mut bad = config();
        bad.rp_origin = "not a url".into();
        assert!(Passkeys::new(&bad).is_err());
    }

    #[test]
    fn test_credential_id_string_is_base64url() {
        let id = credential_id_string(&[0xfb, 0xef, 0xff]);
        assert!(!id.contains('+'));
        assert!(!id.contains('/'));
        assert!(!id.contains('='));
    }

    #[test]
    fn test_start_authentication_requires_candidates() {
        let passkeys = Passkeys::new(&config()).unwrap();
        match passkeys.start_authentication(&[]) {
            Err(AuthError::InvalidCredentials) => {}
            other => panic!("expected InvalidCredentials, got {:?}", other.err()),
        }
    }
}
