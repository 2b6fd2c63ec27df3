use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_types::{AuthKind, ConnectionRecord, EncryptedBlob};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::VaultError;

// ── Connection Store ─────────────────────────────────────────────
//
// Connection records are created via admin CRUD and referenced by id
// everywhere else, never embedded. The trait exists so tests can run
// against the in-memory store while the server uses SQLite.

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn insert(&self, record: &ConnectionRecord) -> Result<(), VaultError>;
    async fn get(&self, id: Uuid) -> Result<Option<ConnectionRecord>, VaultError>;
    async fn update(&self, record: &ConnectionRecord) -> Result<(), VaultError>;
    async fn delete(&self, id: Uuid) -> Result<bool, VaultError>;
    async fn list(&self) -> Result<Vec<ConnectionRecord>, VaultError>;
}

// ── In-memory implementation ─────────────────────────────────────

#[derive(Default)]
pub struct MemoryConnectionStore {
    inner: RwLock<HashMap<Uuid, ConnectionRecord>>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn insert(&self, record: &ConnectionRecord) -> Result<(), VaultError> {
        self.inner.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ConnectionRecord>, VaultError> {
        Ok(self.inner.read().await.get(&id).cloned())
    }

    async fn update(&self, record: &ConnectionRecord) -> Result<(), VaultError> {
        let mut inner = self.inner.write().await;
        if !inner.contains_key(&record.id) {
            return Err(VaultError::NotFound(record.id));
        }
        inner.insert(record.id, record.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, VaultError> {
        Ok(self.inner.write().await.remove(&id).is_some())
    }

    async fn list(&self) -> Result<Vec<ConnectionRecord>, VaultError> {
        let mut records: Vec<ConnectionRecord> = self.inner.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

// ── SQLite implementation ────────────────────────────────────────
//
// Ciphertext blobs are stored as JSON text columns; plaintext secrets
// never reach this layer.

pub struct SqliteConnectionStore {
    pool: SqlitePool,
}

impl SqliteConnectionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(pool: &SqlitePool) -> Result<(), VaultError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS connections (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                auth_kind TEXT NOT NULL,
                encrypted_password TEXT,
                encrypted_private_key TEXT,
                encrypted_passphrase TEXT,
                proxy_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<ConnectionRecord, VaultError> {
        Ok(ConnectionRecord {
            id: parse_uuid(row.try_get("id").map_err(storage_err)?)?,
            name: row.try_get("name").map_err(storage_err)?,
            host: row.try_get("host").map_err(storage_err)?,
            port: row.try_get::<i64, _>("port").map_err(storage_err)? as u16,
            username: row.try_get("username").map_err(storage_err)?,
            auth_kind: parse_auth_kind(row.try_get("auth_kind").map_err(storage_err)?)?,
            encrypted_password: parse_blob(row.try_get("encrypted_password").map_err(storage_err)?)?,
            encrypted_private_key: parse_blob(
                row.try_get("encrypted_private_key").map_err(storage_err)?,
            )?,
            encrypted_passphrase: parse_blob(
                row.try_get("encrypted_passphrase").map_err(storage_err)?,
            )?,
            proxy_id: match row.try_get::<Option<String>, _>("proxy_id").map_err(storage_err)? {
                Some(raw) => Some(parse_uuid(raw)?),
                None => None,
            },
            created_at: parse_timestamp(row.try_get("created_at").map_err(storage_err)?)?,
            updated_at: parse_timestamp(row.try_get("updated_at").map_err(storage_err)?)?,
        })
    }
}

#[async_trait]
impl ConnectionStore for SqliteConnectionStore {
    async fn insert(&self, record: &ConnectionRecord) -> Result<(), VaultError> {
        sqlx::query(
            "INSERT INTO connections (id, name, host, port, username, auth_kind,
                encrypted_password, encrypted_private_key, encrypted_passphrase,
                proxy_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.name)
        .bind(&record.host)
        .bind(record.port as i64)
        .bind(&record.username)
        .bind(record.auth_kind.to_string())
        .bind(encode_blob(record.encrypted_password.as_ref())?)
        .bind(encode_blob(record.encrypted_private_key.as_ref())?)
        .bind(encode_blob(record.encrypted_passphrase.as_ref())?)
        .bind(record.proxy_id.map(|id| id.to_string()))
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ConnectionRecord>, VaultError> {
        let row = sqlx::query("SELECT * FROM connections WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn update(&self, record: &ConnectionRecord) -> Result<(), VaultError> {
        let result = sqlx::query(
            "UPDATE connections SET name = ?, host = ?, port = ?, username = ?,
                auth_kind = ?, encrypted_password = ?, encrypted_private_key = ?,
                encrypted_passphrase = ?, proxy_id = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&record.name)
        .bind(&record.host)
        .bind(record.port as i64)
        .bind(&record.username)
        .bind(record.auth_kind.to_string())
        .bind(encode_blob(record.encrypted_password.as_ref())?)
        .bind(encode_blob(record.encrypted_private_key.as_ref())?)
        .bind(encode_blob(record.encrypted_passphrase.as_ref())?)
        .bind(record.proxy_id.map(|id| id.to_string()))
        .bind(record.updated_at.to_rfc3339())
        .bind(record.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(VaultError::NotFound(record.id));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, VaultError> {
        let result = sqlx::query("DELETE FROM connections WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<ConnectionRecord>, VaultError> {
        let rows = sqlx::query("SELECT * FROM connections ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(Self::row_to_record).collect()
    }
}

// ── Column codecs ────────────────────────────────────────────────

fn storage_err(err: impl std::fmt::Display) -> VaultError {
    VaultError::Storage(err.to_string())
}

fn encode_blob(blob: Option<&EncryptedBlob>) -> Result<Option<String>, VaultError> {
    blob.map(|b| serde_json::to_string(b).map_err(storage_err)).transpose()
}

fn parse_blob(raw: Option<String>) -> Result<Option<EncryptedBlob>, VaultError> {
    raw.map(|s| serde_json::from_str(&s).map_err(storage_err)).transpose()
}

fn parse_uuid(raw: String) -> Result<Uuid, VaultError> {
    raw.parse().map_err(storage_err)
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>, VaultError> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(storage_err)
}

fn parse_auth_kind(raw: String) -> Result<AuthKind, VaultError> {
    match raw.as_str() {
        "none" => Ok(AuthKind::None),
        "password" => Ok(AuthKind::Password),
        "key" => Ok(AuthKind::Key),
        other => Err(VaultError::Storage(format!("unknown auth kind: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    // In-memory SQLite is per-connection; a single-connection pool
    // keeps the schema visible across queries.
    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn record(name: &str) -> ConnectionRecord {
        ConnectionRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            host: "host.example.com".into(),
            port: 22,
            username: "ops".into(),
            auth_kind: AuthKind::Password,
            encrypted_password: Some(EncryptedBlob {
                nonce: vec![0u8; 12],
                ciphertext: vec![1, 2, 3],
            }),
            encrypted_private_key: None,
            encrypted_passphrase: None,
            proxy_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_crud() {
        let store = MemoryConnectionStore::new();
        let rec = record("web-1");

        store.insert(&rec).await.unwrap();
        assert_eq!(store.get(rec.id).await.unwrap().unwrap().name, "web-1");

        let mut updated = rec.clone();
        updated.name = "web-1b".into();
        store.update(&updated).await.unwrap();
        assert_eq!(store.get(rec.id).await.unwrap().unwrap().name, "web-1b");

        assert!(store.delete(rec.id).await.unwrap());
        assert!(!store.delete(rec.id).await.unwrap());
        assert!(store.get(rec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_crud_roundtrip() {
        let pool = memory_pool().await;
        SqliteConnectionStore::init_schema(&pool).await.unwrap();
        let store = SqliteConnectionStore::new(pool);

        let rec = record("db-1");
        store.insert(&rec).await.unwrap();

        let loaded = store.get(rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, rec.name);
        assert_eq!(loaded.auth_kind, AuthKind::Password);
        assert_eq!(loaded.encrypted_password, rec.encrypted_password);

        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.delete(rec.id).await.unwrap());
        assert!(store.get(rec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_update_missing_is_not_found() {
        let pool = memory_pool().await;
        SqliteConnectionStore::init_schema(&pool).await.unwrap();
        let store = SqliteConnectionStore::new(pool);

        match store.update(&record("ghost")).await {
            Err(VaultError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
