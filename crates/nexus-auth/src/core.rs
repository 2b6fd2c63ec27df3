use chrono::{Duration, Utc};
use nexus_types::{
    ChallengePurpose, Event, EventBus, PasskeyRecord, PendingAuth, Session, User,
};
use rand::RngCore;
use secrecy::SecretString;
use std::sync::Arc;
use uuid::Uuid;
use webauthn_rs::prelude::{
    CreationChallengeResponse, PublicKeyCredential, RegisterPublicKeyCredential,
    RequestChallengeResponse,
};

use crate::captcha::CaptchaVerifier;
use crate::passkey::{credential_id_string, transports_from_response, PasskeyConfig, Passkeys};
use crate::session::{rotate, SessionStore};
use crate::store::{PasskeyStore, UserStore};
use crate::throttle::LoginThrottle;
use crate::{constant_time_eq, password, totp, AuthError};

/// Pending-2FA and WebAuthn challenges both live this long.
const CHALLENGE_TTL_MINUTES: i64 = 5;

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub rp_id: String,
    pub rp_origin: String,
    pub rp_name: String,
    /// Cookie TTL for a plain login, in seconds.
    pub default_cookie_ttl_secs: i64,
    /// Cookie TTL when remember-me is set (~30 days).
    pub remember_cookie_ttl_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            rp_id: "localhost".into(),
            rp_origin: "http://localhost".into(),
            rp_name: "Nexus".into(),
            default_cookie_ttl_secs: 24 * 60 * 60,
            remember_cookie_ttl_secs: 30 * 24 * 60 * 60,
        }
    }
}

// ── Requests and outcomes ────────────────────────────────────────

pub struct PasswordLogin {
    pub username: String,
    pub password: SecretString,
    pub remember_me: bool,
    pub captcha_token: Option<String>,
}

pub enum LoginOutcome {
    Authenticated { session: Session },
    /// Password accepted but the user has TOTP enabled. The client
    /// must echo the temp-token together with a valid code.
    SecondFactorRequired { session: Session, temp_token: String },
}

// ── Authentication Core ──────────────────────────────────────────
//
// Drives the three-stage state machine
// `Anonymous → Pending2FA? → Authenticated`. Every transition between
// authentication statuses rotates the session identifier before any
// new state is written.

pub struct AuthCore {
    users: Arc<dyn UserStore>,
    passkey_store: Arc<dyn PasskeyStore>,
    sessions: Arc<dyn SessionStore>,
    passkeys: Passkeys,
    throttle: Arc<dyn LoginThrottle>,
    captcha: Arc<dyn CaptchaVerifier>,
    bus: Arc<EventBus>,
    config: AuthConfig,
}

impl AuthCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: Arc<dyn UserStore>,
        passkey_store: Arc<dyn PasskeyStore>,
        sessions: Arc<dyn SessionStore>,
        throttle: Arc<dyn LoginThrottle>,
        captcha: Arc<dyn CaptchaVerifier>,
        bus: Arc<EventBus>,
        config: AuthConfig,
    ) -> Result<Self, AuthError> {
        let passkeys = Passkeys::new(&PasskeyConfig {
            rp_id: config.rp_id.clone(),
            rp_origin: config.rp_origin.clone(),
            rp_name: config.rp_name.clone(),
        })?;
        Ok(Self {
            users,
            passkey_store,
            sessions,
            passkeys,
            throttle,
            captcha,
            bus,
            config,
        })
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    // ── Password login ───────────────────────────────────────────

    pub async fn login(
        &self,
        session: Session,
        input: PasswordLogin,
        client_ip: &str,
    ) -> Result<LoginOutcome, AuthError> {
        self.throttle.check(client_ip).await?;

        // CAPTCHA first. Its failure is indistinguishable from a bad
        // password on the wire.
        if self
            .captcha
            .verify(input.captcha_token.as_deref(), client_ip)
            .await
            .is_err()
        {
            self.record_failure(client_ip, &input.username).await;
            return Err(AuthError::InvalidCredentials);
        }

        let user = self.users.find_by_username(&input.username).await?;
        let stored_hash = user.as_ref().map(|u| u.password_hash.clone());
        let verified = password::verify_password(stored_hash, input.password).await?;

        let Some(user) = user.filter(|_| verified) else {
            self.record_failure(client_ip, &input.username).await;
            return Err(AuthError::InvalidCredentials);
        };

        if user.totp_secret.is_none() {
            let session = self.establish(session, &user, input.remember_me).await?;
            self.throttle.reset(client_ip).await;
            Ok(LoginOutcome::Authenticated { session })
        } else {
            // Password accepted; hold the user behind a pending record
            // on a fresh session until the second factor lands.
            let mut token_bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut token_bytes);
            let temp_token = hex::encode(token_bytes);

            let mut fresh = rotate(self.sessions.as_ref(), session).await?;
            fresh.requires_second_factor = true;
            fresh.pending_auth = Some(PendingAuth {
                user_id: user.id,
                username: user.username.clone(),
                temp_token: temp_token.clone(),
                remember_me: input.remember_me,
                expires_at: Utc::now() + Duration::minutes(CHALLENGE_TTL_MINUTES),
            });
            self.sessions.save(&fresh).await?;

            Ok(LoginOutcome::SecondFactorRequired {
                session: fresh,
                temp_token,
            })
        }
    }

    // ── Second factor ────────────────────────────────────────────

    pub async fn verify_second_factor(
        &self,
        mut session: Session,
        temp_token: &str,
        code: &str,
        client_ip: &str,
    ) -> Result<Session, AuthError> {
        self.throttle.check(client_ip).await?;

        let Some(pending) = session.pending_auth.clone() else {
            self.throttle.record_failure(client_ip).await;
            return Err(AuthError::InvalidAuthState);
        };

        if !constant_time_eq(temp_token, &pending.temp_token) || Utc::now() > pending.expires_at {
            self.record_failure(client_ip, &pending.username).await;
            return Err(AuthError::InvalidAuthState);
        }

        let user = self
            .users
            .find_by_id(pending.user_id)
            .await?
            .ok_or(AuthError::InvalidAuthState)?;
        let secret = user
            .totp_secret
            .as_deref()
            .ok_or(AuthError::InvalidAuthState)?;

        if !totp::verify(secret, code, 1) {
            self.record_failure(client_ip, &pending.username).await;
            return Err(AuthError::InvalidCredentials);
        }

        // The pending record dies with the old session id here.
        session.pending_auth = None;
        let session = self.establish(session, &user, pending.remember_me).await?;
        self.throttle.reset(client_ip).await;
        Ok(session)
    }

    // ── Logout ───────────────────────────────────────────────────

    pub async fn logout(&self, session: Session) -> Result<(), AuthError> {
        self.sessions.destroy(&session.id).await
    }

    // ── Passkey registration ─────────────────────────────────────

    pub async fn start_passkey_registration(
        &self,
        mut session: Session,
    ) -> Result<(Session, CreationChallengeResponse), AuthError> {
        let user = self.authenticated_user(&session).await?;
        let existing = self.passkey_store.list_for_user(user.id).await?;

        let (ccr, challenge) = self.passkeys.start_registration(&user, &existing)?;
        session.current_challenge = Some(challenge);
        self.sessions.save(&session).await?;
        Ok((session, ccr))
    }

    pub async fn finish_passkey_registration(
        &self,
        mut session: Session,
        response: &RegisterPublicKeyCredential,
        name: &str,
    ) -> Result<(Session, PasskeyRecord), AuthError> {
        let challenge = self.consume_challenge(&mut session).await?;

        if challenge.purpose != ChallengePurpose::Registration {
            return Err(AuthError::InvalidAuthState);
        }
        check_challenge_age(&challenge)?;
        let user_handle = challenge.user_handle.ok_or(AuthError::InvalidAuthState)?;
        if session.user_id != Some(user_handle) {
            return Err(AuthError::InvalidAuthState);
        }

        let passkey = self.passkeys.finish_registration(&challenge, response)?;
        let record = PasskeyRecord {
            id: Uuid::new_v4(),
            user_id: user_handle,
            credential_id: credential_id_string(passkey.cred_id().as_ref()),
            credential_json: serde_json::to_string(&passkey)
                .map_err(|e| AuthError::Internal(format!("passkey serialization: {e}")))?,
            counter: 0,
            transports: transports_from_response(response),
            name: name.to_string(),
            backed_up: false,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.passkey_store.insert(&record).await?;

        self.bus.publish(&Event::PasskeyRegistered {
            user_id: user_handle,
            passkey_name: record.name.clone(),
        });
        Ok((session, record))
    }

    // ── Passkey authentication ───────────────────────────────────

    pub async fn start_passkey_authentication(
        &self,
        mut session: Session,
        username: Option<&str>,
    ) -> Result<(Session, RequestChallengeResponse), AuthError> {
        let candidates = match username {
            Some(name) => {
                let user = self
                    .users
                    .find_by_username(name)
                    .await?
                    .ok_or(AuthError::InvalidCredentials)?;
                self.passkey_store.list_for_user(user.id).await?
            }
            None => self.passkey_store.list_all().await?,
        };

        let (rcr, challenge) = self.passkeys.start_authentication(&candidates)?;
        session.current_challenge = Some(challenge);
        self.sessions.save(&session).await?;
        Ok((session, rcr))
    }

    pub async fn finish_passkey_authentication(
        &self,
        mut session: Session,
        response: &PublicKeyCredential,
        remember_me: bool,
        client_ip: &str,
    ) -> Result<Session, AuthError> {
        self.throttle.check(client_ip).await?;

        let challenge = match self.consume_challenge(&mut session).await {
            Ok(challenge) => challenge,
            Err(e) => {
                self.throttle.record_failure(client_ip).await;
                return Err(e);
            }
        };
        if challenge.purpose != ChallengePurpose::Authentication {
            self.throttle.record_failure(client_ip).await;
            return Err(AuthError::InvalidAuthState);
        }
        if let Err(e) = check_challenge_age(&challenge) {
            self.throttle.record_failure(client_ip).await;
            return Err(e);
        }

        let auth_result = match self.passkeys.finish_authentication(&challenge, response) {
            Ok(result) => result,
            Err(e) => {
                self.throttle.record_failure(client_ip).await;
                return Err(e);
            }
        };

        let credential_id = credential_id_string(auth_result.cred_id().as_ref());
        let record = self
            .passkey_store
            .find_by_credential_id(&credential_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        // A presented counter that does not strictly exceed the stored
        // one means a clone (or a replay); the stored value stays put.
        if auth_result.counter() <= record.counter {
            self.record_failure(client_ip, &record.name).await;
            return Err(AuthError::CounterRegression);
        }
        self.passkey_store
            .record_use(
                record.id,
                auth_result.counter(),
                auth_result.backup_state(),
                Utc::now(),
            )
            .await?;

        let user = self
            .users
            .find_by_id(record.user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        let session = self.establish(session, &user, remember_me).await?;
        self.throttle.reset(client_ip).await;
        Ok(session)
    }

    pub async fn has_passkeys(&self, username: &str) -> Result<bool, AuthError> {
        match self.users.find_by_username(username).await? {
            Some(user) => Ok(!self.passkey_store.list_for_user(user.id).await?.is_empty()),
            None => Ok(false),
        }
    }

    // ── Passkey management ───────────────────────────────────────

    pub async fn list_passkeys(&self, session: &Session) -> Result<Vec<PasskeyRecord>, AuthError> {
        let user = self.authenticated_user(session).await?;
        self.passkey_store.list_for_user(user.id).await
    }

    pub async fn rename_passkey(
        &self,
        session: &Session,
        passkey_id: Uuid,
        name: &str,
    ) -> Result<(), AuthError> {
        self.owned_passkey(session, passkey_id).await?;
        self.passkey_store.rename(passkey_id, name).await
    }

    pub async fn delete_passkey(
        &self,
        session: &Session,
        passkey_id: Uuid,
    ) -> Result<(), AuthError> {
        self.owned_passkey(session, passkey_id).await?;
        self.passkey_store.delete(passkey_id).await?;
        Ok(())
    }

    // ── TOTP enrollment ──────────────────────────────────────────

    /// Generate a candidate secret and park it on the session until
    /// the user proves their authenticator can produce codes for it.
    pub async fn start_totp_enrollment(
        &self,
        mut session: Session,
    ) -> Result<(Session, String, String), AuthError> {
        let user = self.authenticated_user(&session).await?;

        let secret = totp::generate_secret();
        let uri = totp::provisioning_uri(&self.config.rp_name, &user.username, &secret);
        session.temp_totp_secret = Some(secret.clone());
        self.sessions.save(&session).await?;
        Ok((session, secret, uri))
    }

    pub async fn confirm_totp_enrollment(
        &self,
        mut session: Session,
        code: &str,
    ) -> Result<Session, AuthError> {
        let user = self.authenticated_user(&session).await?;
        let secret = session
            .temp_totp_secret
            .clone()
            .ok_or(AuthError::InvalidAuthState)?;

        if !totp::verify(&secret, code, 1) {
            return Err(AuthError::InvalidCredentials);
        }

        self.users
            .set_totp_secret(user.id, Some(&secret))
            .await?;
        session.temp_totp_secret = None;
        self.sessions.save(&session).await?;
        Ok(session)
    }

    pub async fn disable_totp(&self, session: &Session) -> Result<(), AuthError> {
        let user = self.authenticated_user(session).await?;
        self.users.set_totp_secret(user.id, None).await
    }

    // ── Internal helpers ─────────────────────────────────────────

    /// Rotate to a fresh session id, bind the user, set the cookie
    /// TTL and write the state. The single path into Authenticated.
    async fn establish(
        &self,
        session: Session,
        user: &User,
        remember_me: bool,
    ) -> Result<Session, AuthError> {
        let mut fresh = rotate(self.sessions.as_ref(), session).await?;
        fresh.user_id = Some(user.id);
        fresh.username = Some(user.username.clone());
        fresh.requires_second_factor = false;
        fresh.cookie_max_age_secs = if remember_me {
            self.config.remember_cookie_ttl_secs
        } else {
            self.config.default_cookie_ttl_secs
        };
        self.sessions.save(&fresh).await?;

        self.bus.publish(&Event::LoginSuccess {
            user_id: user.id,
            username: user.username.clone(),
        });
        Ok(fresh)
    }

    async fn authenticated_user(&self, session: &Session) -> Result<User, AuthError> {
        if !session.is_authenticated() {
            return Err(AuthError::InvalidAuthState);
        }
        let user_id = session.user_id.ok_or(AuthError::InvalidAuthState)?;
        self.users
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::InvalidAuthState)
    }

    async fn owned_passkey(&self, session: &Session, passkey_id: Uuid) -> Result<(), AuthError> {
        let user = self.authenticated_user(session).await?;
        let records = self.passkey_store.list_for_user(user.id).await?;
        if records.iter().any(|r| r.id == passkey_id) {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }

    /// Challenges are single-use: pulled off the session and the
    /// session saved before any verification happens.
    async fn consume_challenge(
        &self,
        session: &mut Session,
    ) -> Result<nexus_types::ChallengeRecord, AuthError> {
        let challenge = session
            .current_challenge
            .take()
            .ok_or(AuthError::InvalidAuthState)?;
        self.sessions.save(session).await?;
        Ok(challenge)
    }

    async fn record_failure(&self, client_ip: &str, username: &str) {
        self.throttle.record_failure(client_ip).await;
        self.bus.publish(&Event::LoginFailure {
            username: username.to_string(),
            ip: client_ip.to_string(),
        });
    }
}

/// A challenge older than five minutes never verifies, regardless of
/// what the verifier library would say about it.
fn check_challenge_age(challenge: &nexus_types::ChallengeRecord) -> Result<(), AuthError> {
    if Utc::now() - challenge.issued_at > Duration::minutes(CHALLENGE_TTL_MINUTES) {
        return Err(AuthError::ChallengeExpired);
    }
    Ok(())
}
