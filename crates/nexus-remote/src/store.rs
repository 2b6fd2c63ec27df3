use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_types::{
    BatchRequest, BatchSubtask, BatchSubtaskStatus, BatchTask, BatchTaskStatus, TransferTask,
};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),
}

// ── Task Store ───────────────────────────────────────────────────
//
// Uniform id → task store so the executors and their tests can swap
// implementations. Batch tasks are durable (SQLite); transfer tasks
// are RAM-only by design.

pub trait HasId {
    fn task_id(&self) -> Uuid;
}

impl HasId for BatchTask {
    fn task_id(&self) -> Uuid {
        self.id
    }
}

impl HasId for TransferTask {
    fn task_id(&self) -> Uuid {
        self.id
    }
}

#[async_trait]
pub trait TaskStore<T>: Send + Sync {
    /// Insert or replace the task under its id.
    async fn put(&self, task: &T) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<T>, StoreError>;
    async fn list(&self) -> Result<Vec<T>, StoreError>;
    async fn remove(&self, id: Uuid) -> Result<bool, StoreError>;
}

// ── In-memory implementation ─────────────────────────────────────

pub struct MemoryTaskStore<T> {
    inner: RwLock<HashMap<Uuid, T>>,
}

impl<T> MemoryTaskStore<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for MemoryTaskStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> TaskStore<T> for MemoryTaskStore<T>
where
    T: HasId + Clone + Send + Sync,
{
    async fn put(&self, task: &T) -> Result<(), StoreError> {
        self.inner.write().await.insert(task.task_id(), task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<T>, StoreError> {
        Ok(self.inner.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.inner.read().await.values().cloned().collect())
    }

    async fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.remove(&id).is_some())
    }
}

// ── SQLite batch store ───────────────────────────────────────────
//
// Task and sub-task rows are rewritten at every state transition so a
// crash-and-restart observer sees a consistent aggregate.

pub struct SqliteBatchStore {
    pool: SqlitePool,
}

impl SqliteBatchStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS batch_tasks (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                status TEXT NOT NULL,
                concurrency INTEGER NOT NULL,
                progress INTEGER NOT NULL,
                request TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT
            )",
        )
        .execute(pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS batch_subtasks (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                connection_id TEXT NOT NULL,
                connection_name TEXT NOT NULL,
                command TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL,
                exit_code INTEGER,
                output TEXT NOT NULL,
                message TEXT,
                started_at TEXT,
                ended_at TEXT
            )",
        )
        .execute(pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Sub-tasks left in flight by a previous process can never finish;
    /// surface them as failed with an `Interrupted` message and settle
    /// their parent tasks. Runs once at startup, before the executor
    /// accepts new work.
    pub async fn recover_interrupted(&self) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "UPDATE batch_subtasks
             SET status = 'failed', message = 'Interrupted', ended_at = ?
             WHERE status IN ('queued', 'connecting', 'running')",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        let interrupted = result.rows_affected() as usize;
        if interrupted > 0 {
            for mut task in self.list().await? {
                if !task.status.is_terminal() {
                    crate::batch::aggregate(&mut task);
                    task.updated_at = Utc::now();
                    self.put(&task).await?;
                }
            }
        }
        Ok(interrupted)
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<BatchTask, StoreError> {
        let request: String = row.try_get("request").map_err(storage_err)?;
        let request: BatchRequest = serde_json::from_str(&request).map_err(storage_err)?;
        Ok(BatchTask {
            id: parse_uuid(row.try_get("id").map_err(storage_err)?)?,
            owner: parse_uuid(row.try_get("owner").map_err(storage_err)?)?,
            status: parse_task_status(row.try_get("status").map_err(storage_err)?)?,
            concurrency: row.try_get::<i64, _>("concurrency").map_err(storage_err)? as usize,
            progress: row.try_get::<i64, _>("progress").map_err(storage_err)? as u8,
            counts: Default::default(),
            request,
            created_at: parse_timestamp(row.try_get("created_at").map_err(storage_err)?)?,
            updated_at: parse_timestamp(row.try_get("updated_at").map_err(storage_err)?)?,
            started_at: parse_opt_timestamp(row.try_get("started_at").map_err(storage_err)?)?,
            ended_at: parse_opt_timestamp(row.try_get("ended_at").map_err(storage_err)?)?,
            subtasks: Vec::new(),
        })
    }

    fn row_to_subtask(row: &sqlx::sqlite::SqliteRow) -> Result<BatchSubtask, StoreError> {
        Ok(BatchSubtask {
            id: parse_uuid(row.try_get("id").map_err(storage_err)?)?,
            task_id: parse_uuid(row.try_get("task_id").map_err(storage_err)?)?,
            connection_id: parse_uuid(row.try_get("connection_id").map_err(storage_err)?)?,
            connection_name: row.try_get("connection_name").map_err(storage_err)?,
            command: row.try_get("command").map_err(storage_err)?,
            status: parse_subtask_status(row.try_get("status").map_err(storage_err)?)?,
            progress: row.try_get::<i64, _>("progress").map_err(storage_err)? as u8,
            exit_code: row
                .try_get::<Option<i64>, _>("exit_code")
                .map_err(storage_err)?
                .map(|c| c as i32),
            output: row.try_get("output").map_err(storage_err)?,
            message: row.try_get("message").map_err(storage_err)?,
            started_at: parse_opt_timestamp(row.try_get("started_at").map_err(storage_err)?)?,
            ended_at: parse_opt_timestamp(row.try_get("ended_at").map_err(storage_err)?)?,
        })
    }

    async fn load_subtasks(&self, task: &mut BatchTask) -> Result<(), StoreError> {
        let rows = sqlx::query("SELECT * FROM batch_subtasks WHERE task_id = ? ORDER BY position")
            .bind(task.id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        task.subtasks = rows
            .iter()
            .map(Self::row_to_subtask)
            .collect::<Result<_, _>>()?;

        task.counts.total = task.subtasks.len();
        for sub in &task.subtasks {
            match sub.status {
                BatchSubtaskStatus::Completed => task.counts.completed += 1,
                BatchSubtaskStatus::Failed => task.counts.failed += 1,
                BatchSubtaskStatus::Cancelled => task.counts.cancelled += 1,
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore<BatchTask> for SqliteBatchStore {
    async fn put(&self, task: &BatchTask) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            "INSERT OR REPLACE INTO batch_tasks
                (id, owner, status, concurrency, progress, request,
                 created_at, updated_at, started_at, ended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(task.owner.to_string())
        .bind(task_status_str(task.status))
        .bind(task.concurrency as i64)
        .bind(task.progress as i64)
        .bind(serde_json::to_string(&task.request).map_err(storage_err)?)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.ended_at.map(|t| t.to_rfc3339()))
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query("DELETE FROM batch_subtasks WHERE task_id = ?")
            .bind(task.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        for (position, sub) in task.subtasks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO batch_subtasks
                    (id, task_id, position, connection_id, connection_name, command,
                     status, progress, exit_code, output, message, started_at, ended_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(sub.id.to_string())
            .bind(sub.task_id.to_string())
            .bind(position as i64)
            .bind(sub.connection_id.to_string())
            .bind(&sub.connection_name)
            .bind(&sub.command)
            .bind(subtask_status_str(sub.status))
            .bind(sub.progress as i64)
            .bind(sub.exit_code.map(|c| c as i64))
            .bind(&sub.output)
            .bind(sub.message.as_deref())
            .bind(sub.started_at.map(|t| t.to_rfc3339()))
            .bind(sub.ended_at.map(|t| t.to_rfc3339()))
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)
    }

    async fn get(&self, id: Uuid) -> Result<Option<BatchTask>, StoreError> {
        let row = sqlx::query("SELECT * FROM batch_tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut task = Self::row_to_task(&row)?;
        self.load_subtasks(&mut task).await?;
        Ok(Some(task))
    }

    async fn list(&self) -> Result<Vec<BatchTask>, StoreError> {
        let rows = sqlx::query("SELECT * FROM batch_tasks ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut task = Self::row_to_task(row)?;
            self.load_subtasks(&mut task).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    async fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        sqlx::query("DELETE FROM batch_subtasks WHERE task_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        let result = sqlx::query("DELETE FROM batch_tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }
}

// ── Column codecs ────────────────────────────────────────────────

fn storage_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(err.to_string())
}

fn parse_uuid(raw: String) -> Result<Uuid, StoreError> {
    raw.parse().map_err(storage_err)
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(storage_err)
}

fn parse_opt_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(parse_timestamp).transpose()
}

fn task_status_str(status: BatchTaskStatus) -> &'static str {
    match status {
        BatchTaskStatus::Queued => "queued",
        BatchTaskStatus::InProgress => "in-progress",
        BatchTaskStatus::PartiallyCompleted => "partially-completed",
        BatchTaskStatus::Completed => "completed",
        BatchTaskStatus::Failed => "failed",
        BatchTaskStatus::Cancelled => "cancelled",
    }
}

fn parse_task_status(raw: String) -> Result<BatchTaskStatus, StoreError> {
    match raw.as_str() {
        "queued" => Ok(BatchTaskStatus::Queued),
        "in-progress" => Ok(BatchTaskStatus::InProgress),
        "partially-completed" => Ok(BatchTaskStatus::PartiallyCompleted),
        "completed" => Ok(BatchTaskStatus::Completed),
        "failed" => Ok(BatchTaskStatus::Failed),
        "cancelled" => Ok(BatchTaskStatus::Cancelled),
        other => Err(StoreError::Storage(format!("unknown task status: {other}"))),
    }
}

fn subtask_status_str(status: BatchSubtaskStatus) -> &'static str {
    match status {
        BatchSubtaskStatus::Queued => "queued",
        BatchSubtaskStatus::Connecting => "connecting",
        BatchSubtaskStatus::Running => "running",
        BatchSubtaskStatus::Completed => "completed",
        BatchSubtaskStatus::Failed => "failed",
        BatchSubtaskStatus::Cancelled => "cancelled",
    }
}

fn parse_subtask_status(raw: String) -> Result<BatchSubtaskStatus, StoreError> {
    match raw.as_str() {
        "queued" => Ok(BatchSubtaskStatus::Queued),
        "connecting" => Ok(BatchSubtaskStatus::Connecting),
        "running" => Ok(BatchSubtaskStatus::Running),
        "completed" => Ok(BatchSubtaskStatus::Completed),
        "failed" => Ok(BatchSubtaskStatus::Failed),
        "cancelled" => Ok(BatchSubtaskStatus::Cancelled),
        other => Err(StoreError::Storage(format!(
            "unknown sub-task status: {other}"
        ))),
    }
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

    fn task_with_subtasks(statuses: &[BatchSubtaskStatus]) -> BatchTask {
        let task_id = Uuid::new_v4();
        let subtasks = statuses
            .iter()
            .map(|status| BatchSubtask {
                id: Uuid::new_v4(),
                task_id,
                connection_id: Uuid::new_v4(),
                connection_name: "host".into(),
                command: "uptime".into(),
                status: *status,
                progress: 0,
                exit_code: None,
                output: String::new(),
                message: None,
                started_at: None,
                ended_at: None,
            })
            .collect::<Vec<_>>();
        BatchTask {
            id: task_id,
            owner: Uuid::new_v4(),
            status: BatchTaskStatus::InProgress,
            concurrency: 5,
            progress: 0,
            counts: Default::default(),
            request: BatchRequest {
                command: "uptime".into(),
                connection_ids: subtasks.iter().map(|s| s.connection_id).collect(),
                concurrency: None,
                timeout_secs: None,
                env: Default::default(),
                workdir: None,
                sudo: false,
                login_shell: false,
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: Some(Utc::now()),
            ended_at: None,
            subtasks,
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store: MemoryTaskStore<BatchTask> = MemoryTaskStore::new();
        let task = task_with_subtasks(&[BatchSubtaskStatus::Queued]);
        store.put(&task).await.unwrap();
        assert!(store.get(task.id).await.unwrap().is_some());
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.remove(task.id).await.unwrap());
        assert!(store.get(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_preserves_order_and_counts() {
        let pool = memory_pool().await;
        SqliteBatchStore::init_schema(&pool).await.unwrap();
        let store = SqliteBatchStore::new(pool);

        let mut task = task_with_subtasks(&[
            BatchSubtaskStatus::Completed,
            BatchSubtaskStatus::Failed,
            BatchSubtaskStatus::Queued,
        ]);
        task.subtasks[0].exit_code = Some(0);
        task.subtasks[0].output = "ok\n".into();
        store.put(&task).await.unwrap();

        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.subtasks.len(), 3);
        // Submission order survives the store.
        assert_eq!(loaded.subtasks[0].id, task.subtasks[0].id);
        assert_eq!(loaded.subtasks[2].id, task.subtasks[2].id);
        assert_eq!(loaded.counts.completed, 1);
        assert_eq!(loaded.counts.failed, 1);
        assert_eq!(loaded.subtasks[0].exit_code, Some(0));
        assert_eq!(loaded.subtasks[0].output, "ok\n");
    }

    #[tokio::test]
    async fn test_recover_interrupted_fails_in_flight_subtasks() {
        let pool = memory_pool().await;
        SqliteBatchStore::init_schema(&pool).await.unwrap();
        let store = SqliteBatchStore::new(pool);

        let task = task_with_subtasks(&[
            BatchSubtaskStatus::Completed,
            BatchSubtaskStatus::Running,
            BatchSubtaskStatus::Queued,
        ]);
        store.put(&task).await.unwrap();

        let interrupted = store.recover_interrupted().await.unwrap();
        assert_eq!(interrupted, 2);

        let loaded = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.subtasks[1].status, BatchSubtaskStatus::Failed);
        assert_eq!(loaded.subtasks[1].message.as_deref(), Some("Interrupted"));
        assert_eq!(loaded.subtasks[2].status, BatchSubtaskStatus::Failed);
        // The completed sub-task is untouched and the aggregate settles.
        assert_eq!(loaded.subtasks[0].status, BatchSubtaskStatus::Completed);
        assert_eq!(loaded.status, BatchTaskStatus::PartiallyCompleted);
        assert!(loaded.ended_at.is_some());
    }
}
