use chrono::Utc;
use nexus_types::{
    BatchCounts, BatchRequest, BatchSubtask, BatchSubtaskStatus, BatchTask, BatchTaskStatus,
    Event, EventBus,
};
use nexus_vault::Vault;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dialer::{DialError, Dialer, ExecEvent};
use crate::shell::{self, CommandOptions};
use crate::store::{StoreError, TaskStore};

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const MAX_CONCURRENCY: usize = 50;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Captured stdout ∪ stderr cap per sub-task.
const MAX_CAPTURED_OUTPUT: usize = 128 * 1024;

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    NotFound(Uuid),

    #[error("forbidden")]
    Forbidden,

    #[error("task already finished")]
    AlreadyTerminal,

    #[error("task is still active")]
    StillActive,

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for BatchError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

// ── Aggregation ──────────────────────────────────────────────────

/// Recompute a task's counts, overall progress and status from its
/// sub-tasks. The status is a pure function of the sub-task statuses,
/// with one exception: a task the cancel API already pinned to
/// `cancelled` keeps that status.
pub fn aggregate(task: &mut BatchTask) {
    let total = task.subtasks.len();
    let mut counts = BatchCounts {
        total,
        ..Default::default()
    };
    let mut progress_sum: u32 = 0;
    let mut all_terminal = total > 0;
    let mut any_started = false;

    for sub in &task.subtasks {
        match sub.status {
            BatchSubtaskStatus::Completed => counts.completed += 1,
            BatchSubtaskStatus::Failed => counts.failed += 1,
            BatchSubtaskStatus::Cancelled => counts.cancelled += 1,
            BatchSubtaskStatus::Queued => all_terminal = false,
            BatchSubtaskStatus::Connecting | BatchSubtaskStatus::Running => {
                all_terminal = false;
                any_started = true;
            }
        }
        progress_sum += if sub.status == BatchSubtaskStatus::Completed {
            100
        } else {
            sub.progress.min(100) as u32
        };
    }

    task.counts = counts;
    task.progress = if total == 0 {
        0
    } else {
        (progress_sum / total as u32).min(100) as u8
    };

    if task.status == BatchTaskStatus::Cancelled {
        // Pinned by the cancel API; only the bookkeeping above moves.
    } else if all_terminal {
        task.status = if counts.completed == total {
            BatchTaskStatus::Completed
        } else if counts.failed == total {
            BatchTaskStatus::Failed
        } else if counts.completed > 0 {
            BatchTaskStatus::PartiallyCompleted
        } else if counts.cancelled > 0 {
            BatchTaskStatus::Cancelled
        } else {
            BatchTaskStatus::Failed
        };
    } else if any_started || task.started_at.is_some() {
        task.status = BatchTaskStatus::InProgress;
    }

    if all_terminal && task.ended_at.is_none() {
        task.ended_at = Some(Utc::now());
    }
}

// ── Shared task state ────────────────────────────────────────────
//
// The canonical in-flight task. Every mutation re-aggregates and
// persists under one lock, so no intermediate aggregate is ever
// observable.

struct TaskState {
    task: Mutex<BatchTask>,
    store: Arc<dyn TaskStore<BatchTask>>,
    bus: Arc<EventBus>,
}

impl TaskState {
    async fn mutate<F>(&self, f: F) -> BatchTask
    where
        F: FnOnce(&mut BatchTask),
    {
        let snapshot = {
            let mut task = self.task.lock().await;
            f(&mut task);
            aggregate(&mut task);
            task.updated_at = Utc::now();
            task.clone()
        };
        if let Err(e) = self.store.put(&snapshot).await {
            tracing::warn!(task_id = %snapshot.id, "failed to persist batch task: {e}");
        }
        snapshot
    }

    /// Apply a sub-task transition. A terminal sub-task status is
    /// never overwritten.
    async fn update_subtask<F>(&self, index: usize, f: F)
    where
        F: FnOnce(&mut BatchSubtask),
    {
        let snapshot = self
            .mutate(|task| {
                let sub = &mut task.subtasks[index];
                if sub.status.is_terminal() {
                    return;
                }
                f(sub);
            })
            .await;

        let sub = &snapshot.subtasks[index];
        self.bus.publish(&Event::BatchSubtaskUpdate {
            task_id: snapshot.id,
            subtask_id: sub.id,
            status: sub.status,
            progress: sub.progress,
        });
    }
}

// ── Batch Fan-out Executor ───────────────────────────────────────

struct RunningTask {
    state: Arc<TaskState>,
    token: CancellationToken,
}

type RunningMap = Arc<Mutex<HashMap<Uuid, RunningTask>>>;

pub struct BatchExecutor {
    vault: Arc<Vault>,
    dialer: Dialer,
    store: Arc<dyn TaskStore<BatchTask>>,
    bus: Arc<EventBus>,
    running: RunningMap,
}

impl BatchExecutor {
    pub fn new(
        vault: Arc<Vault>,
        dialer: Dialer,
        store: Arc<dyn TaskStore<BatchTask>>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            vault,
            dialer,
            store,
            bus,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate, persist and start a batch. Returns the task record
    /// synchronously; execution proceeds in the background.
    pub async fn submit(
        &self,
        owner: Uuid,
        request: BatchRequest,
    ) -> Result<BatchTask, BatchError> {
        let concurrency = validate_request(&request)?;

        // Resolve display names up front; an unknown target fails the
        // whole submission before anything runs.
        let mut names = Vec::with_capacity(request.connection_ids.len());
        for id in &request.connection_ids {
            let record = self
                .vault
                .connections()
                .get(*id)
                .await
                .map_err(|e| BatchError::Storage(e.to_string()))?
                .ok_or_else(|| BatchError::Validation(format!("unknown connection: {id}")))?;
            names.push(record.name);
        }

        let now = Utc::now();
        let task_id = Uuid::new_v4();
        let subtasks = request
            .connection_ids
            .iter()
            .zip(names)
            .map(|(connection_id, connection_name)| BatchSubtask {
                id: Uuid::new_v4(),
                task_id,
                connection_id: *connection_id,
                connection_name,
                command: request.command.clone(),
                status: BatchSubtaskStatus::Queued,
                progress: 0,
                exit_code: None,
                output: String::new(),
                message: None,
                started_at: None,
                ended_at: None,
            })
            .collect::<Vec<_>>();

        let task = BatchTask {
            id: task_id,
            owner,
            status: BatchTaskStatus::Queued,
            concurrency,
            progress: 0,
            counts: BatchCounts {
                total: subtasks.len(),
                ..Default::default()
            },
            request,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            subtasks,
        };
        self.store.put(&task).await?;

        let state = Arc::new(TaskState {
            task: Mutex::new(task.clone()),
            store: self.store.clone(),
            bus: self.bus.clone(),
        });
        let token = CancellationToken::new();
        self.running.lock().await.insert(
            task_id,
            RunningTask {
                state: state.clone(),
                token: token.clone(),
            },
        );

        self.bus.publish(&Event::BatchStarted {
            task_id,
            targets: task.counts.total,
        });

        let ctx = RunContext {
            vault: self.vault.clone(),
            dialer: self.dialer.clone(),
            bus: self.bus.clone(),
            running: self.running.clone(),
            state,
            token,
        };
        tokio::spawn(run_task(ctx));

        Ok(task)
    }

    pub async fn get(&self, owner: Uuid, task_id: Uuid) -> Result<BatchTask, BatchError> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or(BatchError::NotFound(task_id))?;
        if task.owner != owner {
            return Err(BatchError::Forbidden);
        }
        Ok(task)
    }

    pub async fn list(&self, owner: Uuid) -> Result<Vec<BatchTask>, BatchError> {
        let mut tasks: Vec<BatchTask> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|t| t.owner == owner)
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    /// Cancel a task. Idempotent: cancelling an already-cancelled task
    /// returns it unchanged; any other terminal state refuses.
    pub async fn cancel(&self, owner: Uuid, task_id: Uuid) -> Result<BatchTask, BatchError> {
        let entry = {
            let running = self.running.lock().await;
            running
                .get(&task_id)
                .map(|r| (r.state.clone(), r.token.clone()))
        };

        if let Some((state, token)) = entry {
            {
                let task = state.task.lock().await;
                if task.owner != owner {
                    return Err(BatchError::Forbidden);
                }
                if task.status == BatchTaskStatus::Cancelled {
                    return Ok(task.clone());
                }
                if task.status.is_terminal() {
                    return Err(BatchError::AlreadyTerminal);
                }
            }
            let snapshot = state
                .mutate(|task| task.status = BatchTaskStatus::Cancelled)
                .await;
            token.cancel();
            return Ok(snapshot);
        }

        // Not running in this process (finished, or predates a
        // restart): settle directly against the store.
        let mut task = self
            .store
            .get(task_id)
            .await?
            .ok_or(BatchError::NotFound(task_id))?;
        if task.owner != owner {
            return Err(BatchError::Forbidden);
        }
        if task.status == BatchTaskStatus::Cancelled {
            return Ok(task);
        }
        if task.status.is_terminal() {
            return Err(BatchError::AlreadyTerminal);
        }

        let now = Utc::now();
        task.status = BatchTaskStatus::Cancelled;
        for sub in &mut task.subtasks {
            if !sub.status.is_terminal() {
                sub.status = BatchSubtaskStatus::Cancelled;
                sub.ended_at = Some(now);
            }
        }
        aggregate(&mut task);
        task.updated_at = now;
        self.store.put(&task).await?;
        Ok(task)
    }

    /// Remove a finished task and its sub-tasks.
    pub async fn delete(&self, owner: Uuid, task_id: Uuid) -> Result<(), BatchError> {
        let task = self.get(owner, task_id).await?;
        if !task.status.is_terminal() {
            return Err(BatchError::StillActive);
        }
        self.store.remove(task_id).await?;
        Ok(())
    }
}

// ── Execution ────────────────────────────────────────────────────

struct RunContext {
    vault: Arc<Vault>,
    dialer: Dialer,
    bus: Arc<EventBus>,
    running: RunningMap,
    state: Arc<TaskState>,
    token: CancellationToken,
}

async fn run_task(ctx: RunContext) {
    let RunContext {
        vault,
        dialer,
        bus,
        running,
        state,
        token,
    } = ctx;

    let (task_id, concurrency, count, options, timeout) = {
        let task = state.task.lock().await;
        (
            task.id,
            task.concurrency,
            task.subtasks.len(),
            command_options(&task.request),
            Duration::from_secs(task.request.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
        )
    };

    state
        .mutate(|task| {
            if task.status == BatchTaskStatus::Queued {
                task.status = BatchTaskStatus::InProgress;
            }
            task.started_at = Some(Utc::now());
        })
        .await;

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut units = JoinSet::new();

    // Dispatch in submission order; the semaphore caps how many
    // sub-tasks are active at once.
    for index in 0..count {
        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        if token.is_cancelled() {
            break;
        }

        let unit = SubtaskUnit {
            state: state.clone(),
            vault: vault.clone(),
            dialer: dialer.clone(),
            bus: bus.clone(),
            token: token.clone(),
            options: options.clone(),
            timeout,
        };
        units.spawn(async move {
            let _permit = permit;
            unit.run(index).await;
        });
    }

    while units.join_next().await.is_some() {}

    // Sub-tasks that never got dispatched are cancelled outright.
    let snapshot = state
        .mutate(|task| {
            let now = Utc::now();
            for sub in &mut task.subtasks {
                if sub.status == BatchSubtaskStatus::Queued {
                    sub.status = BatchSubtaskStatus::Cancelled;
                    sub.ended_at = Some(now);
                }
            }
        })
        .await;

    running.lock().await.remove(&task_id);
    bus.publish(&Event::BatchCompleted {
        task_id,
        status: snapshot.status,
    });
}

fn validate_request(request: &BatchRequest) -> Result<usize, BatchError> {
    if request.command.trim().is_empty() {
        return Err(BatchError::Validation("command must not be empty".into()));
    }
    if request.connection_ids.is_empty() {
        return Err(BatchError::Validation(
            "at least one target connection is required".into(),
        ));
    }
    let concurrency = request.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
    if !(1..=MAX_CONCURRENCY).contains(&concurrency) {
        return Err(BatchError::Validation(format!(
            "concurrency must be between 1 and {MAX_CONCURRENCY}"
        )));
    }
    if let Some(timeout) = request.timeout_secs {
        if !(1..=MAX_TIMEOUT_SECS).contains(&timeout) {
            return Err(BatchError::Validation(format!(
                "timeout must be between 1 and {MAX_TIMEOUT_SECS} seconds"
            )));
        }
    }
    for name in request.env.keys() {
        if !shell::is_valid_env_name(name) {
            return Err(BatchError::Validation(format!(
                "invalid environment variable name: {name}"
            )));
        }
    }
    Ok(concurrency)
}

fn command_options(request: &BatchRequest) -> CommandOptions {
    let mut env: Vec<(String, String)> = request
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.sort();
    CommandOptions {
        env,
        workdir: request.workdir.clone(),
        sudo: request.sudo,
        login_shell: request.login_shell,
    }
}

// ── Sub-task unit ────────────────────────────────────────────────

struct SubtaskUnit {
    state: Arc<TaskState>,
    vault: Arc<Vault>,
    dialer: Dialer,
    bus: Arc<EventBus>,
    token: CancellationToken,
    options: CommandOptions,
    timeout: Duration,
}

impl SubtaskUnit {
    async fn run(&self, index: usize) {
        if self.token.is_cancelled() {
            self.finish_cancelled(index).await;
            return;
        }

        let (task_id, subtask_id, connection_id, command) = {
            let task = self.state.task.lock().await;
            let sub = &task.subtasks[index];
            (task.id, sub.id, sub.connection_id, sub.command.clone())
        };

        self.state
            .update_subtask(index, |sub| {
                sub.status = BatchSubtaskStatus::Connecting;
                sub.started_at = Some(Utc::now());
            })
            .await;

        let (record, creds) = match self.vault.load(connection_id).await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.finish_failed(index, None, e.to_string()).await;
                return;
            }
        };

        let session = match self.dialer.connect(&record, &creds, &self.token).await {
            Ok(session) => session,
            Err(DialError::Cancelled) => {
                self.finish_cancelled(index).await;
                return;
            }
            Err(e) => {
                self.finish_failed(index, None, e.to_string()).await;
                return;
            }
        };
        drop(creds);

        self.state
            .update_subtask(index, |sub| sub.status = BatchSubtaskStatus::Running)
            .await;

        let full_command = shell::build_exec_command(&command, &self.options);
        let mut stream = match session.exec(&full_command, false, &self.token).await {
            Ok(stream) => stream,
            Err(DialError::Cancelled) => {
                session.close().await;
                self.finish_cancelled(index).await;
                return;
            }
            Err(e) => {
                session.close().await;
                self.finish_failed(index, None, e.to_string()).await;
                return;
            }
        };

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    session.close().await;
                    self.finish_cancelled(index).await;
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    session.close().await;
                    self.finish_failed(index, None, "Timeout".into()).await;
                    return;
                }
                event = stream.next() => match event {
                    Some(ExecEvent::Stdout(chunk)) | Some(ExecEvent::Stderr(chunk)) => {
                        let text = String::from_utf8_lossy(&chunk).into_owned();
                        self.state
                            .update_subtask(index, |sub| {
                                append_bounded(&mut sub.output, &text, MAX_CAPTURED_OUTPUT);
                                sub.progress = (sub.progress + 5).min(90);
                            })
                            .await;
                        self.bus.publish(&Event::BatchSubtaskLog {
                            task_id,
                            subtask_id,
                            chunk: text,
                        });
                    }
                    Some(ExecEvent::Exit(code)) => {
                        session.close().await;
                        if code == 0 {
                            self.finish_completed(index, code as i32).await;
                        } else {
                            self.finish_failed(
                                index,
                                Some(code as i32),
                                format!("exited with status {code}"),
                            )
                            .await;
                        }
                        return;
                    }
                    None => {
                        session.close().await;
                        self.finish_failed(index, None, "connection closed".into()).await;
                        return;
                    }
                }
            }
        }
    }

    async fn finish_completed(&self, index: usize, exit_code: i32) {
        self.state
            .update_subtask(index, |sub| {
                sub.status = BatchSubtaskStatus::Completed;
                sub.progress = 100;
                sub.exit_code = Some(exit_code);
                sub.ended_at = Some(Utc::now());
            })
            .await;
    }

    async fn finish_failed(&self, index: usize, exit_code: Option<i32>, message: String) {
        self.state
            .update_subtask(index, |sub| {
                sub.status = BatchSubtaskStatus::Failed;
                sub.exit_code = exit_code;
                sub.message = Some(message);
                sub.ended_at = Some(Utc::now());
            })
            .await;
    }

    async fn finish_cancelled(&self, index: usize) {
        self.state
            .update_subtask(index, |sub| {
                sub.status = BatchSubtaskStatus::Cancelled;
                sub.ended_at = Some(Utc::now());
            })
            .await;
    }
}

fn append_bounded(buffer: &mut String, chunk: &str, max: usize) {
    if buffer.len() >= max {
        return;
    }
    let remaining = max - buffer.len();
    if chunk.len() <= remaining {
        buffer.push_str(chunk);
    } else {
        let mut end = remaining;
        while !chunk.is_char_boundary(end) {
            end -= 1;
        }
        buffer.push_str(&chunk[..end]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask(status: BatchSubtaskStatus, progress: u8) -> BatchSubtask {
        BatchSubtask {
            id: Uuid::new_v4(),
            task_id: Uuid::nil(),
            connection_id: Uuid::new_v4(),
            connection_name: "host".into(),
            command: "true".into(),
            status,
            progress,
            exit_code: None,
            output: String::new(),
            message: None,
            started_at: None,
            ended_at: None,
        }
    }

    fn task(subtasks: Vec<BatchSubtask>) -> BatchTask {
        BatchTask {
            id: Uuid::new_v4(),
            owner: Uuid::new_v4(),
            status: BatchTaskStatus::InProgress,
            concurrency: 5,
            progress: 0,
            counts: Default::default(),
            request: BatchRequest {
                command: "true".into(),
                connection_ids: vec![Uuid::new_v4()],
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

    #[test]
    fn test_aggregate_all_completed() {
        let mut t = task(vec![
            subtask(BatchSubtaskStatus::Completed, 100),
            subtask(BatchSubtaskStatus::Completed, 100),
        ]);
        aggregate(&mut t);
        assert_eq!(t.status, BatchTaskStatus::Completed);
        assert_eq!(t.progress, 100);
        assert_eq!(t.counts.completed, 2);
        assert!(t.ended_at.is_some());
    }

    #[test]
    fn test_aggregate_mixed_outcomes_is_partial() {
        let mut t = task(vec![
            subtask(BatchSubtaskStatus::Completed, 100),
            subtask(BatchSubtaskStatus::Completed, 100),
            subtask(BatchSubtaskStatus::Completed, 100),
            subtask(BatchSubtaskStatus::Failed, 100),
        ]);
        aggregate(&mut t);
        assert_eq!(t.status, BatchTaskStatus::PartiallyCompleted);
        assert_eq!(t.progress, 100);
        assert_eq!(t.counts.completed, 3);
        assert_eq!(t.counts.failed, 1);
    }

    #[test]
    fn test_aggregate_all_failed() {
        let mut t = task(vec![
            subtask(BatchSubtaskStatus::Failed, 0),
            subtask(BatchSubtaskStatus::Failed, 50),
        ]);
        aggregate(&mut t);
        assert_eq!(t.status, BatchTaskStatus::Failed);
        assert_eq!(t.progress, 25);
    }

    #[test]
    fn test_aggregate_in_progress_mean() {
        let mut t = task(vec![
            subtask(BatchSubtaskStatus::Completed, 100),
            subtask(BatchSubtaskStatus::Running, 40),
            subtask(BatchSubtaskStatus::Queued, 0),
        ]);
        aggregate(&mut t);
        assert_eq!(t.status, BatchTaskStatus::InProgress);
        assert_eq!(t.progress, 46); // (100 + 40 + 0) / 3
        assert!(t.ended_at.is_none());
    }

    #[test]
    fn test_aggregate_completed_counts_as_hundred() {
        // A completed sub-task contributes 100 even if its recorded
        // progress lagged behind.
        let mut t = task(vec![subtask(BatchSubtaskStatus::Completed, 15)]);
        aggregate(&mut t);
        assert_eq!(t.progress, 100);
    }

    #[test]
    fn test_aggregate_respects_api_cancel_pin() {
        let mut t = task(vec![
            subtask(BatchSubtaskStatus::Completed, 100),
            subtask(BatchSubtaskStatus::Cancelled, 10),
        ]);
        t.status = BatchTaskStatus::Cancelled;
        aggregate(&mut t);
        assert_eq!(t.status, BatchTaskStatus::Cancelled);
        assert!(t.ended_at.is_some());
    }

    #[test]
    fn test_aggregate_all_cancelled() {
        let mut t = task(vec![
            subtask(BatchSubtaskStatus::Cancelled, 0),
            subtask(BatchSubtaskStatus::Cancelled, 0),
        ]);
        aggregate(&mut t);
        assert_eq!(t.status, BatchTaskStatus::Cancelled);
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        let base = BatchRequest {
            command: "uptime".into(),
            connection_ids: vec![Uuid::new_v4()],
            concurrency: None,
            timeout_secs: None,
            env: Default::default(),
            workdir: None,
            sudo: false,
            login_shell: false,
        };

        assert_eq!(validate_request(&base).unwrap(), DEFAULT_CONCURRENCY);

        let mut bad = base.clone();
        bad.command = "   ".into();
        assert!(validate_request(&bad).is_err());

        let mut bad = base.clone();
        bad.connection_ids.clear();
        assert!(validate_request(&bad).is_err());

        let mut bad = base.clone();
        bad.concurrency = Some(0);
        assert!(validate_request(&bad).is_err());

        let mut bad = base.clone();
        bad.concurrency = Some(51);
        assert!(validate_request(&bad).is_err());

        let mut bad = base.clone();
        bad.timeout_secs = Some(0);
        assert!(validate_request(&bad).is_err());

        let mut bad = base.clone();
        bad.timeout_secs = Some(3601);
        assert!(validate_request(&bad).is_err());

        let mut bad = base.clone();
        bad.env.insert("BAD NAME".into(), "v".into());
        assert!(validate_request(&bad).is_err());

        let mut ok = base;
        ok.concurrency = Some(50);
        ok.timeout_secs = Some(3600);
        assert_eq!(validate_request(&ok).unwrap(), 50);
    }

    #[test]
    fn test_append_bounded_truncates() {
        let mut buf = String::new();
        append_bounded(&mut buf, "0123456789", 4);
        assert_eq!(buf, "0123");
        append_bounded(&mut buf, "x", 4);
        assert_eq!(buf, "0123");
    }

    #[test]
    fn test_append_bounded_respects_char_boundaries() {
        let mut buf = String::new();
        append_bounded(&mut buf, "aé", 2); // 'é' is two bytes
        assert_eq!(buf, "a");
    }
}
