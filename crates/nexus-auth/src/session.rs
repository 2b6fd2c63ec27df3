use async_trait::async_trait;
use chrono::Utc;
use nexus_types::Session;
use rand::RngCore;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::AuthError;

// ── Session Store ────────────────────────────────────────────────
//
// Server-side session records keyed by the cookie identifier. The
// identifier is the sole client handle; everything else stays on the
// server.

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Allocate a fresh anonymous session with a new random id.
    async fn create(&self, cookie_max_age_secs: i64) -> Result<Session, AuthError>;
    async fn get(&self, id: &str) -> Result<Option<Session>, AuthError>;
    /// Persist the record under its current id. Fails if the session
    /// no longer exists.
    async fn save(&self, session: &Session) -> Result<(), AuthError>;
    async fn destroy(&self, id: &str) -> Result<(), AuthError>;
}

/// Discard the old session identifier and return a fresh session.
///
/// The defining defense against session fixation: every
/// authentication-status transition goes through here before any new
/// state is written. Either the new session exists and the old one is
/// gone, or the call fails and nothing changed hands.
pub async fn rotate(store: &dyn SessionStore, old: Session) -> Result<Session, AuthError> {
    let fresh = store.create(old.cookie_max_age_secs).await?;
    store.destroy(&old.id).await?;
    Ok(fresh)
}

pub(crate) fn new_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ── In-memory implementation ─────────────────────────────────────

#[derive(Default)]
pub struct MemorySessionStore {
    inner: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, cookie_max_age_secs: i64) -> Result<Session, AuthError> {
        let session = Session {
            id: new_session_id(),
            user_id: None,
            username: None,
            requires_second_factor: false,
            pending_auth: None,
            current_challenge: None,
            temp_totp_secret: None,
            cookie_max_age_secs,
            created_at: Utc::now(),
        };
        self.inner
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>, AuthError> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn save(&self, session: &Session) -> Result<(), AuthError> {
        let mut inner = self.inner.write().await;
        if !inner.contains_key(&session.id) {
            return Err(AuthError::Session("session no longer exists".into()));
        }
        inner.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<(), AuthError> {
        self.inner.write().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_get_destroy() {
        let store = MemorySessionStore::new();
        let session = store.create(3600).await.unwrap();
        assert_eq!(session.id.len(), 64);
        assert!(!session.is_authenticated());

        assert!(store.get(&session.id).await.unwrap().is_some());
        store.destroy(&session.id).await.unwrap();
        assert!(store.get(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotate_changes_identifier_and_kills_old() {
        let store = MemorySessionStore::new();
        let old = store.create(3600).await.unwrap();
        let old_id = old.id.clone();

        let fresh = rotate(&store, old).await.unwrap();
        assert_ne!(fresh.id, old_id);
        assert!(store.get(&old_id).await.unwrap().is_none());
        assert!(store.get(&fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_after_destroy_fails() {
        let store = MemorySessionStore::new();
        let session = store.create(3600).await.unwrap();
        store.destroy(&session.id).await.unwrap();
        assert!(store.save(&session).await.is_err());
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let store = MemorySessionStore::new();
        let a = store.create(0).await.unwrap();
        let b = store.create(0).await.unwrap();
        assert_ne!(a.id, b.id);
    }
}
