use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_types::{PasskeyRecord, User};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::AuthError;

// ── User Store ───────────────────────────────────────────────────

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert(&self, user: &User) -> Result<(), AuthError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AuthError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError>;
    async fn set_totp_secret(&self, id: Uuid, secret: Option<&str>) -> Result<(), AuthError>;
}

// ── Passkey Store ────────────────────────────────────────────────

#[async_trait]
pub trait PasskeyStore: Send + Sync {
    async fn insert(&self, record: &PasskeyRecord) -> Result<(), AuthError>;
    async fn find_by_credential_id(
        &self,
        credential_id: &str,
    ) -> Result<Option<PasskeyRecord>, AuthError>;
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<PasskeyRecord>, AuthError>;
    async fn list_all(&self) -> Result<Vec<PasskeyRecord>, AuthError>;
    /// Write the post-authentication counter, last-used timestamp and
    /// backup state reported by the authenticator.
    async fn record_use(
        &self,
        id: Uuid,
        counter: u32,
        backed_up: bool,
        used_at: DateTime<Utc>,
    ) -> Result<(), AuthError>;
    async fn rename(&self, id: Uuid, name: &str) -> Result<(), AuthError>;
    async fn delete(&self, id: Uuid) -> Result<bool, AuthError>;
}

// ── In-memory implementations ────────────────────────────────────

#[derive(Default)]
pub struct MemoryUserStore {
    inner: RwLock<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn insert(&self, user: &User) -> Result<(), AuthError> {
        let mut inner = self.inner.write().await;
        if inner.values().any(|u| u.username == user.username) {
            return Err(AuthError::Storage(format!(
                "username already taken: {}",
                user.username
            )));
        }
        inner.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AuthError> {
        Ok(self.inner.read().await.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn set_totp_secret(&self, id: Uuid, secret: Option<&str>) -> Result<(), AuthError> {
        let mut inner = self.inner.write().await;
        let user = inner.get_mut(&id).ok_or(AuthError::NotFound)?;
        user.totp_secret = secret.map(str::to_string);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPasskeyStore {
    inner: RwLock<HashMap<Uuid, PasskeyRecord>>,
}

impl MemoryPasskeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PasskeyStore for MemoryPasskeyStore {
    async fn insert(&self, record: &PasskeyRecord) -> Result<(), AuthError> {
        self.inner.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn find_by_credential_id(
        &self,
        credential_id: &str,
    ) -> Result<Option<PasskeyRecord>, AuthError> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .find(|r| r.credential_id == credential_id)
            .cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<PasskeyRecord>, AuthError> {
        let mut records: Vec<PasskeyRecord> = self
            .inner
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn list_all(&self) -> Result<Vec<PasskeyRecord>, AuthError> {
        let mut records: Vec<PasskeyRecord> =
            self.inner.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn record_use(
        &self,
        id: Uuid,
        counter: u32,
        backed_up: bool,
        used_at: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let mut inner = self.inner.write().await;
        let record = inner.get_mut(&id).ok_or(AuthError::NotFound)?;
        record.counter = counter;
        record.backed_up = backed_up;
        record.last_used_at = Some(used_at);
        Ok(())
    }

    async fn rename(&self, id: Uuid, name: &str) -> Result<(), AuthError> {
        let mut inner = self.inner.write().await;
        let record = inner.get_mut(&id).ok_or(AuthError::NotFound)?;
        record.name = name.to_string();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AuthError> {
        Ok(self.inner.write().await.remove(&id).is_some())
    }
}

// ── SQLite implementations ───────────────────────────────────────

pub async fn init_schema(pool: &SqlitePool) -> Result<(), AuthError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            totp_secret TEXT,
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(storage_err)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS passkeys (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            credential_id TEXT NOT NULL UNIQUE,
            credential_json TEXT NOT NULL,
            counter INTEGER NOT NULL,
            transports TEXT NOT NULL,
            name TEXT NOT NULL,
            backed_up INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            last_used_at TEXT
        )",
    )
    .execute(pool)
    .await
    .map_err(storage_err)?;

    Ok(())
}

pub struct SqliteUserStore {
    pool: SqlitePool,
}

impl SqliteUserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, AuthError> {
        Ok(User {
            id: parse_uuid(row.try_get("id").map_err(storage_err)?)?,
            username: row.try_get("username").map_err(storage_err)?,
            password_hash: row.try_get("password_hash").map_err(storage_err)?,
            totp_secret: row.try_get("totp_secret").map_err(storage_err)?,
            created_at: parse_timestamp(row.try_get("created_at").map_err(storage_err)?)?,
        })
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn insert(&self, user: &User) -> Result<(), AuthError> {
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, totp_secret, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.totp_secret.as_deref())
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AuthError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(Self::row_to_user).transpose()
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(Self::row_to_user).transpose()
    }

    async fn set_totp_secret(&self, id: Uuid, secret: Option<&str>) -> Result<(), AuthError> {
        let result = sqlx::query("UPDATE users SET totp_secret = ? WHERE id = ?")
            .bind(secret)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound);
        }
        Ok(())
    }
}

pub struct SqlitePasskeyStore {
    pool: SqlitePool,
}

impl SqlitePasskeyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<PasskeyRecord, AuthError> {
        let transports: String = row.try_get("transports").map_err(storage_err)?;
        Ok(PasskeyRecord {
            id: parse_uuid(row.try_get("id").map_err(storage_err)?)?,
            user_id: parse_uuid(row.try_get("user_id").map_err(storage_err)?)?,
            credential_id: row.try_get("credential_id").map_err(storage_err)?,
            credential_json: row.try_get("credential_json").map_err(storage_err)?,
            counter: row.try_get::<i64, _>("counter").map_err(storage_err)? as u32,
            transports: serde_json::from_str(&transports).map_err(storage_err)?,
            name: row.try_get("name").map_err(storage_err)?,
            backed_up: row.try_get::<i64, _>("backed_up").map_err(storage_err)? != 0,
            created_at: parse_timestamp(row.try_get("created_at").map_err(storage_err)?)?,
            last_used_at: row
                .try_get::<Option<String>, _>("last_used_at")
                .map_err(storage_err)?
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

#[async_trait]
impl PasskeyStore for SqlitePasskeyStore {
    async fn insert(&self, record: &PasskeyRecord) -> Result<(), AuthError> {
        sqlx::query(
            "INSERT INTO passkeys (id, user_id, credential_id, credential_json, counter,
                transports, name, backed_up, created_at, last_used_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.user_id.to_string())
        .bind(&record.credential_id)
        .bind(&record.credential_json)
        .bind(record.counter as i64)
        .bind(serde_json::to_string(&record.transports).map_err(storage_err)?)
        .bind(&record.name)
        .bind(record.backed_up as i64)
        .bind(record.created_at.to_rfc3339())
        .bind(record.last_used_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn find_by_credential_id(
        &self,
        credential_id: &str,
    ) -> Result<Option<PasskeyRecord>, AuthError> {
        let row = sqlx::query("SELECT * FROM passkeys WHERE credential_id = ?")
            .bind(credential_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<PasskeyRecord>, AuthError> {
        let rows = sqlx::query("SELECT * FROM passkeys WHERE user_id = ? ORDER BY created_at")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn list_all(&self) -> Result<Vec<PasskeyRecord>, AuthError> {
        let rows = sqlx::query("SELECT * FROM passkeys ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn record_use(
        &self,
        id: Uuid,
        counter: u32,
        backed_up: bool,
        used_at: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let result = sqlx::query(
            "UPDATE passkeys SET counter = ?, backed_up = ?, last_used_at = ? WHERE id = ?",
        )
        .bind(counter as i64)
        .bind(backed_up as i64)
        .bind(used_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound);
        }
        Ok(())
    }

    async fn rename(&self, id: Uuid, name: &str) -> Result<(), AuthError> {
        let result = sqlx::query("UPDATE passkeys SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, AuthError> {
        let result = sqlx::query("DELETE FROM passkeys WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }
}

fn storage_err(err: impl std::fmt::Display) -> AuthError {
    AuthError::Storage(err.to_string())
}

fn parse_uuid(raw: String) -> Result<Uuid, AuthError> {
    raw.parse().map_err(storage_err)
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>, AuthError> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(storage_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn user(name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: name.to_string(),
            password_hash: "$argon2id$stub".into(),
            totp_secret: None,
            created_at: Utc::now(),
        }
    }

    fn passkey(user_id: Uuid, cred: &str) -> PasskeyRecord {
        PasskeyRecord {
            id: Uuid::new_v4(),
            user_id,
            credential_id: cred.to_string(),
            credential_json: "{}".into(),
            counter: 0,
            transports: vec!["usb".into()],
            name: "YubiKey".into(),
            backed_up: false,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn test_memory_user_unique_username() {
        let store = MemoryUserStore::new();
        store.insert(&user("alice")).await.unwrap();
        assert!(store.insert(&user("alice")).await.is_err());
        assert!(store
            .find_by_username("alice")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_sqlite_user_roundtrip() {
        let pool = memory_pool().await;
        init_schema(&pool).await.unwrap();
        let store = SqliteUserStore::new(pool);

        let mut u = user("bob");
        u.totp_secret = Some("SECRET".into());
        store.insert(&u).await.unwrap();

        let loaded = store.find_by_username("bob").await.unwrap().unwrap();
        assert_eq!(loaded.id, u.id);
        assert_eq!(loaded.totp_secret.as_deref(), Some("SECRET"));

        store.set_totp_secret(u.id, None).await.unwrap();
        let cleared = store.find_by_id(u.id).await.unwrap().unwrap();
        assert!(cleared.totp_secret.is_none());
    }

    #[tokio::test]
    async fn test_sqlite_passkey_roundtrip_and_use() {
        let pool = memory_pool().await;
        init_schema(&pool).await.unwrap();
        let store = SqlitePasskeyStore::new(pool);

        let uid = Uuid::new_v4();
        let rec = passkey(uid, "cred-abc");
        store.insert(&rec).await.unwrap();

        let loaded = store
            .find_by_credential_id("cred-abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.counter, 0);
        assert_eq!(loaded.transports, vec!["usb".to_string()]);

        let used_at = Utc::now();
        store.record_use(rec.id, 7, true, used_at).await.unwrap();
        let after = store.find_by_credential_id("cred-abc").await.unwrap().unwrap();
        assert_eq!(after.counter, 7);
        assert!(after.backed_up);
        assert!(after.last_used_at.is_some());

        assert_eq!(store.list_for_user(uid).await.unwrap().len(), 1);
        assert!(store.delete(rec.id).await.unwrap());
        assert!(!store.delete(rec.id).await.unwrap());
    }
}
