use chrono::Utc;
use nexus_types::{
    Event, EventBus, TransferMethod, TransferRequest, TransferSubtask, TransferSubtaskStatus,
    TransferTask, TransferTaskStatus,
};
use nexus_vault::Vault;
use rand::RngCore;
use regex::Regex;
use russh_sftp::protocol::FileAttributes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dialer::{DialError, Dialer, ExecEvent, RemoteSession};
use crate::shell::{self, TargetEndpoint};
use crate::store::{StoreError, TaskStore};

/// Worker pool size; fixed, unlike the batch executor's user-chosen
/// concurrency.
pub const WORKER_LIMIT: usize = 5;
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const KEY_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

const EPHEMERAL_KEY_PREFIX: &str = "/tmp/nexus_target_key_";

/// Tail of stderr kept on a failed sub-task.
const MAX_STDERR_TAIL: usize = 8 * 1024;

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    NotFound(Uuid),

    #[error("forbidden")]
    Forbidden,

    #[error("task already finished")]
    AlreadyTerminal,

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

// ── Aggregation ──────────────────────────────────────────────────

/// Counts, overall progress and status from the sub-tasks. While the
/// cancel API holds the task in `cancelling`, status promotion is
/// deferred to the run loop's final step.
pub fn aggregate(task: &mut TransferTask) {
    let total = task.subtasks.len();
    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut cancelled = 0usize;
    let mut progress_sum: u32 = 0;
    let mut all_terminal = total > 0;
    let mut any_started = false;

    for sub in &task.subtasks {
        match sub.status {
            TransferSubtaskStatus::Completed => completed += 1,
            TransferSubtaskStatus::Failed => failed += 1,
            TransferSubtaskStatus::Cancelled => cancelled += 1,
            TransferSubtaskStatus::Queued => all_terminal = false,
            TransferSubtaskStatus::Connecting | TransferSubtaskStatus::Transferring => {
                all_terminal = false;
                any_started = true;
            }
        }
        progress_sum += if sub.status == TransferSubtaskStatus::Completed {
            100
        } else {
            sub.progress.min(100) as u32
        };
    }

    task.progress = if total == 0 {
        0
    } else {
        (progress_sum / total as u32).min(100) as u8
    };

    match task.status {
        TransferTaskStatus::Cancelled | TransferTaskStatus::Cancelling => {}
        _ => {
            if all_terminal {
                task.status = if completed == total {
                    TransferTaskStatus::Completed
                } else if failed == total {
                    TransferTaskStatus::Failed
                } else if completed > 0 {
                    TransferTaskStatus::PartiallyCompleted
                } else if cancelled > 0 {
                    TransferTaskStatus::Cancelled
                } else {
                    TransferTaskStatus::Failed
                };
            } else if any_started || task.started_at.is_some() {
                task.status = TransferTaskStatus::InProgress;
            }
        }
    }

    if all_terminal && task.ended_at.is_none() {
        task.ended_at = Some(Utc::now());
    }
}

// ── Shared task state ────────────────────────────────────────────

struct TransferState {
    task: Mutex<TransferTask>,
    store: Arc<dyn TaskStore<TransferTask>>,
    bus: Arc<EventBus>,
}

impl TransferState {
    async fn mutate<F>(&self, f: F) -> TransferTask
    where
        F: FnOnce(&mut TransferTask),
    {
        let snapshot = {
            let mut task = self.task.lock().await;
            f(&mut task);
            aggregate(&mut task);
            task.updated_at = Utc::now();
            task.clone()
        };
        if let Err(e) = self.store.put(&snapshot).await {
            tracing::warn!(task_id = %snapshot.id, "failed to persist transfer task: {e}");
        }
        snapshot
    }

    async fn update_subtask<F>(&self, index: usize, f: F)
    where
        F: FnOnce(&mut TransferSubtask),
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
        self.bus.publish(&Event::TransferSubtaskUpdate {
            task_id: snapshot.id,
            subtask_id: sub.id,
            status: sub.status,
            progress: sub.progress,
        });
    }
}

// ── Cross-Host Transfer Orchestrator ─────────────────────────────
//
// Bytes never pass through the control plane. One SSH session is
// opened to the source host, which pushes each item to each target
// with its own rsync or scp, authenticated by ephemeral material
// provisioned for the duration of the sub-task.

struct RunningTransfer {
    state: Arc<TransferState>,
    token: CancellationToken,
}

type RunningMap = Arc<Mutex<HashMap<Uuid, RunningTransfer>>>;

pub struct TransferOrchestrator {
    vault: Arc<Vault>,
    dialer: Dialer,
    store: Arc<dyn TaskStore<TransferTask>>,
    bus: Arc<EventBus>,
    running: RunningMap,
    progress_re: Regex,
}

impl TransferOrchestrator {
    pub fn new(
        vault: Arc<Vault>,
        dialer: Dialer,
        store: Arc<dyn TaskStore<TransferTask>>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            vault,
            dialer,
            store,
            bus,
            running: Arc::new(Mutex::new(HashMap::new())),
            progress_re: Regex::new(r"(\d{1,3})%").expect("progress pattern is valid"),
        }
    }

    /// Validate, register and start a transfer. One sub-task per
    /// (target connection, source item).
    pub async fn submit(
        &self,
        owner: Uuid,
        request: TransferRequest,
    ) -> Result<TransferTask, TransferError> {
        validate_request(&request)?;

        let now = Utc::now();
        let task_id = Uuid::new_v4();
        let mut subtasks = Vec::with_capacity(
            request.connection_ids.len() * request.source_items.len(),
        );
        for target_id in &request.connection_ids {
            for item in &request.source_items {
                subtasks.push(TransferSubtask {
                    id: Uuid::new_v4(),
                    task_id,
                    target_connection_id: *target_id,
                    item_name: item.name.clone(),
                    status: TransferSubtaskStatus::Queued,
                    progress: 0,
                    method_used: None,
                    message: None,
                    started_at: None,
                    ended_at: None,
                });
            }
        }

        let task = TransferTask {
            id: task_id,
            owner,
            status: TransferTaskStatus::Queued,
            progress: 0,
            request: request.clone(),
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            subtasks,
        };
        self.store.put(&task).await?;

        let state = Arc::new(TransferState {
            task: Mutex::new(task.clone()),
            store: self.store.clone(),
            bus: self.bus.clone(),
        });
        let token = CancellationToken::new();
        self.running.lock().await.insert(
            task_id,
            RunningTransfer {
                state: state.clone(),
                token: token.clone(),
            },
        );

        self.bus.publish(&Event::TransferStarted {
            task_id,
            targets: request.connection_ids.len(),
            items: request.source_items.len(),
        });

        let ctx = RunContext {
            vault: self.vault.clone(),
            dialer: self.dialer.clone(),
            bus: self.bus.clone(),
            running: self.running.clone(),
            progress_re: self.progress_re.clone(),
            state,
            token,
        };
        tokio::spawn(run_task(ctx));

        Ok(task)
    }

    pub async fn get(&self, owner: Uuid, task_id: Uuid) -> Result<TransferTask, TransferError> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or(TransferError::NotFound(task_id))?;
        if task.owner != owner {
            return Err(TransferError::Forbidden);
        }
        Ok(task)
    }

    pub async fn list(&self, owner: Uuid) -> Result<Vec<TransferTask>, TransferError> {
        let mut tasks: Vec<TransferTask> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|t| t.owner == owner)
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    /// Cancel a transfer. The task moves to `cancelling` and the abort
    /// signal fires; the run loop settles it to `cancelled` once no
    /// sub-task is active. An explicit cancel resolves the task to
    /// `cancelled` even when earlier sub-tasks completed.
    pub async fn cancel(&self, owner: Uuid, task_id: Uuid) -> Result<TransferTask, TransferError> {
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
                    return Err(TransferError::Forbidden);
                }
                match task.status {
                    TransferTaskStatus::Cancelled | TransferTaskStatus::Cancelling => {
                        return Ok(task.clone());
                    }
                    status if status.is_terminal() => return Err(TransferError::AlreadyTerminal),
                    _ => {}
                }
            }
            let snapshot = state
                .mutate(|task| task.status = TransferTaskStatus::Cancelling)
                .await;
            token.cancel();
            return Ok(snapshot);
        }

        let mut task = self
            .store
            .get(task_id)
            .await?
            .ok_or(TransferError::NotFound(task_id))?;
        if task.owner != owner {
            return Err(TransferError::Forbidden);
        }
        if task.status == TransferTaskStatus::Cancelled {
            return Ok(task);
        }
        if task.status.is_terminal() {
            return Err(TransferError::AlreadyTerminal);
        }

        let now = Utc::now();
        task.status = TransferTaskStatus::Cancelled;
        for sub in &mut task.subtasks {
            if !sub.status.is_terminal() {
                sub.status = TransferSubtaskStatus::Cancelled;
                sub.ended_at = Some(now);
            }
        }
        aggregate(&mut task);
        task.updated_at = now;
        self.store.put(&task).await?;
        Ok(task)
    }

}

// ── Execution ────────────────────────────────────────────────────

struct RunContext {
    vault: Arc<Vault>,
    dialer: Dialer,
    bus: Arc<EventBus>,
    running: RunningMap,
    progress_re: Regex,
    state: Arc<TransferState>,
    token: CancellationToken,
}

async fn run_task(ctx: RunContext) {
    let RunContext {
        vault,
        dialer,
        bus,
        running,
        progress_re,
        state,
        token,
    } = ctx;

    let (task_id, request, count) = {
        let task = state.task.lock().await;
        (task.id, Arc::new(task.request.clone()), task.subtasks.len())
    };

    state
        .mutate(|task| {
            if task.status == TransferTaskStatus::Queued {
                task.status = TransferTaskStatus::InProgress;
            }
            task.started_at = Some(Utc::now());
        })
        .await;

    // One session to the source host for the whole task.
    let source = match open_source(&vault, &dialer, &request, &token).await {
        Ok(session) => Arc::new(session),
        Err(outcome) => {
            let now = Utc::now();
            let failure = match outcome {
                SubOutcome::Failed(message) => Some(message),
                _ => None,
            };
            let snapshot = state
                .mutate(|task| {
                    for sub in &mut task.subtasks {
                        if sub.status.is_terminal() {
                            continue;
                        }
                        match &failure {
                            Some(message) => {
                                sub.status = TransferSubtaskStatus::Failed;
                                sub.message = Some(message.clone());
                            }
                            None => sub.status = TransferSubtaskStatus::Cancelled,
                        }
                        sub.ended_at = Some(now);
                    }
                    if task.status == TransferTaskStatus::Cancelling {
                        task.status = TransferTaskStatus::Cancelled;
                    }
                })
                .await;
            running.lock().await.remove(&task_id);
            bus.publish(&Event::TransferCompleted {
                task_id,
                status: snapshot.status,
            });
            return;
        }
    };

    let semaphore = Arc::new(Semaphore::new(WORKER_LIMIT));
    let mut units = JoinSet::new();

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

        let unit = TransferUnit {
            state: state.clone(),
            vault: vault.clone(),
            dialer: dialer.clone(),
            token: token.clone(),
            source: source.clone(),
            request: request.clone(),
            progress_re: progress_re.clone(),
        };
        units.spawn(async move {
            let _permit = permit;
            unit.run(index).await;
        });
    }

    while units.join_next().await.is_some() {}

    let snapshot = state
        .mutate(|task| {
            let now = Utc::now();
            for sub in &mut task.subtasks {
                if sub.status == TransferSubtaskStatus::Queued {
                    sub.status = TransferSubtaskStatus::Cancelled;
                    sub.ended_at = Some(now);
                }
            }
            if task.status == TransferTaskStatus::Cancelling {
                task.status = TransferTaskStatus::Cancelled;
            }
        })
        .await;

    // Single terminal cleanup step for the source session.
    source.close().await;

    running.lock().await.remove(&task_id);
    bus.publish(&Event::TransferCompleted {
        task_id,
        status: snapshot.status,
    });
}

async fn open_source(
    vault: &Vault,
    dialer: &Dialer,
    request: &TransferRequest,
    token: &CancellationToken,
) -> Result<RemoteSession, SubOutcome> {
    let (record, creds) = vault
        .load(request.source_connection_id)
        .await
        .map_err(|e| SubOutcome::Failed(format!("source connection: {e}")))?;
    match dialer.connect(&record, &creds, token).await {
        Ok(session) => Ok(session),
        Err(DialError::Cancelled) => Err(SubOutcome::Cancelled),
        Err(e) => Err(SubOutcome::Failed(format!("source connection: {e}"))),
    }
}

fn validate_request(request: &TransferRequest) -> Result<(), TransferError> {
    if request.connection_ids.is_empty() {
        return Err(TransferError::Validation(
            "at least one target connection is required".into(),
        ));
    }
    if request.source_items.is_empty() {
        return Err(TransferError::Validation(
            "at least one source item is required".into(),
        ));
    }
    for item in &request.source_items {
        if item.name.trim().is_empty() {
            return Err(TransferError::Validation("item name must not be empty".into()));
        }
        if !item.path.starts_with('/') {
            return Err(TransferError::Validation(format!(
                "item path must be absolute: {}",
                item.path
            )));
        }
    }
    if request.remote_target_path.trim().is_empty() {
        return Err(TransferError::Validation(
            "remote target path must not be empty".into(),
        ));
    }
    Ok(())
}

// ── Transfer unit ────────────────────────────────────────────────

enum SubOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

struct TransferUnit {
    state: Arc<TransferState>,
    vault: Arc<Vault>,
    dialer: Dialer,
    token: CancellationToken,
    source: Arc<RemoteSession>,
    request: Arc<TransferRequest>,
    progress_re: Regex,
}

impl TransferUnit {
    async fn run(&self, index: usize) {
        if self.token.is_cancelled() {
            self.finish(index, SubOutcome::Cancelled).await;
            return;
        }

        self.state
            .update_subtask(index, |sub| {
                sub.status = TransferSubtaskStatus::Connecting;
                sub.started_at = Some(Utc::now());
            })
            .await;

        // The key upload path is remembered outside the state machine
        // so the file is removed on every exit, including cancel.
        let mut uploaded_key: Option<String> = None;
        let outcome = self.execute(index, &mut uploaded_key).await;

        if let Some(path) = uploaded_key {
            self.remove_ephemeral_key(&path).await;
        }
        self.finish(index, outcome).await;
    }

    async fn execute(&self, index: usize, uploaded_key: &mut Option<String>) -> SubOutcome {
        let items = &self.request.source_items;
        let target_id = self.request.connection_ids[index / items.len()];
        let item = &items[index % items.len()];

        let (target_record, target_creds) = match self.vault.load(target_id).await {
            Ok(loaded) => loaded,
            Err(e) => return SubOutcome::Failed(format!("target connection: {e}")),
        };

        // Tool probes on the source.
        let has_sshpass = match self.probe_source("sshpass").await {
            Ok(present) => present,
            Err(outcome) => return outcome,
        };
        let has_rsync_source = match self.probe_source("rsync").await {
            Ok(present) => present,
            Err(outcome) => return outcome,
        };
        let has_scp = match self.probe_source("scp").await {
            Ok(present) => present,
            Err(outcome) => return outcome,
        };

        // Short-lived session to the target: rsync probe (when the
        // method could resolve to rsync) and target directory setup.
        let target_session = match self.dialer.connect(&target_record, &target_creds, &self.token).await
        {
            Ok(session) => session,
            Err(DialError::Cancelled) => return SubOutcome::Cancelled,
            Err(e) => return SubOutcome::Failed(format!("target connection: {e}")),
        };

        let needs_target_probe = matches!(
            self.request.method,
            TransferMethod::Auto | TransferMethod::Rsync
        );
        let target_has_rsync = if needs_target_probe {
            match self.probe(&target_session, "rsync").await {
                Ok(present) => present,
                Err(outcome) => {
                    target_session.close().await;
                    return outcome;
                }
            }
        } else {
            false
        };

        let mkdir = shell::mkdir_command(&self.request.remote_target_path);
        let mkdir_result = target_session.exec_collect(&mkdir, &self.token).await;
        target_session.close().await;
        match mkdir_result {
            Ok((0, _, _)) => {}
            Ok((code, _, stderr)) => {
                return SubOutcome::Failed(format!(
                    "failed to create target directory (exit {code}): {}",
                    stderr.trim()
                ));
            }
            Err(DialError::Cancelled) => return SubOutcome::Cancelled,
            Err(e) => return SubOutcome::Failed(format!("failed to create target directory: {e}")),
        }

        // Method resolution.
        let method = match self.request.method {
            TransferMethod::Rsync => {
                if !has_rsync_source {
                    return SubOutcome::Failed("rsync not available on source host".into());
                }
                if !target_has_rsync {
                    return SubOutcome::Failed("rsync not available on target host".into());
                }
                TransferMethod::Rsync
            }
            TransferMethod::Scp => {
                if !has_scp {
                    return SubOutcome::Failed("scp not available on source host".into());
                }
                TransferMethod::Scp
            }
            TransferMethod::Auto => {
                if has_rsync_source && target_has_rsync {
                    TransferMethod::Rsync
                } else if has_scp {
                    TransferMethod::Scp
                } else {
                    return SubOutcome::Failed(
                        "no transfer tool available on source host".into(),
                    );
                }
            }
        };

        // Ephemeral auth material on the source, per the target's kind.
        let mut wrapper_secret: Option<String> = None;
        match target_record.auth_kind {
            nexus_types::AuthKind::Key => {
                let Some(key) = target_creds.private_key.clone() else {
                    return SubOutcome::Failed("target private key unavailable".into());
                };
                if let Some(passphrase) = target_creds.passphrase.clone() {
                    if !has_sshpass {
                        return SubOutcome::Failed(
                            "sshpass not available on source host (required for passphrase-protected key)"
                                .into(),
                        );
                    }
                    wrapper_secret = Some(passphrase);
                }

                let mut suffix = [0u8; 8];
                rand::thread_rng().fill_bytes(&mut suffix);
                let path = format!("{EPHEMERAL_KEY_PREFIX}{}", hex::encode(suffix));
                *uploaded_key = Some(path.clone());
                if let Err(outcome) = self.upload_key(&path, &key).await {
                    return outcome;
                }
            }
            nexus_types::AuthKind::Password => {
                if !has_sshpass {
                    return SubOutcome::Failed(
                        "sshpass not available on source host (required for password auth)".into(),
                    );
                }
                let Some(password) = target_creds.password.clone() else {
                    return SubOutcome::Failed("target password unavailable".into());
                };
                wrapper_secret = Some(password);
            }
            nexus_types::AuthKind::None => {}
        }

        // Build the transfer command; every operand is escaped.
        let endpoint = TargetEndpoint {
            user: &target_record.username,
            host: &target_record.host,
            port: target_record.port,
        };
        let mut command = match method {
            TransferMethod::Rsync => shell::rsync_command(
                item,
                &endpoint,
                &self.request.remote_target_path,
                uploaded_key.as_deref(),
            ),
            _ => shell::scp_command(
                item,
                &endpoint,
                &self.request.remote_target_path,
                uploaded_key.as_deref(),
            ),
        };
        if let Some(secret) = &wrapper_secret {
            command = shell::sshpass_wrap(secret, &command);
        }

        self.state
            .update_subtask(index, |sub| {
                sub.status = TransferSubtaskStatus::Transferring;
                sub.method_used = Some(method);
                if method == TransferMethod::Scp {
                    // scp has no progress stream; report the midpoint.
                    sub.progress = 50;
                }
            })
            .await;

        let mut stream = match self.source.exec(&command, false, &self.token).await {
            Ok(stream) => stream,
            Err(DialError::Cancelled) => return SubOutcome::Cancelled,
            Err(e) => return SubOutcome::Failed(format!("transfer exec failed: {e}")),
        };

        let deadline = tokio::time::Instant::now() + EXEC_TIMEOUT;
        let mut stderr_tail = String::new();
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return SubOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    return SubOutcome::Failed("Timeout".into());
                }
                event = stream.next() => match event {
                    Some(ExecEvent::Stdout(chunk)) => {
                        if method == TransferMethod::Rsync {
                            let text = String::from_utf8_lossy(&chunk);
                            if let Some(progress) = parse_progress(&self.progress_re, &text) {
                                self.state
                                    .update_subtask(index, |sub| {
                                        sub.progress = progress.min(99).max(sub.progress);
                                    })
                                    .await;
                            }
                        }
                    }
                    Some(ExecEvent::Stderr(chunk)) => {
                        let text = String::from_utf8_lossy(&chunk);
                        if stderr_tail.len() < MAX_STDERR_TAIL {
                            stderr_tail.push_str(&text);
                        }
                    }
                    Some(ExecEvent::Exit(0)) => return SubOutcome::Completed,
                    Some(ExecEvent::Exit(code)) => {
                        return SubOutcome::Failed(format!(
                            "transfer exited with status {code}: {}",
                            stderr_tail.trim()
                        ));
                    }
                    None => return SubOutcome::Failed("transfer channel closed".into()),
                }
            }
        }
    }

    async fn finish(&self, index: usize, outcome: SubOutcome) {
        self.state
            .update_subtask(index, |sub| {
                let now = Utc::now();
                match outcome {
                    SubOutcome::Completed => {
                        sub.status = TransferSubtaskStatus::Completed;
                        sub.progress = 100;
                    }
                    SubOutcome::Failed(message) => {
                        sub.status = TransferSubtaskStatus::Failed;
                        sub.message = Some(message);
                    }
                    SubOutcome::Cancelled => {
                        sub.status = TransferSubtaskStatus::Cancelled;
                    }
                }
                sub.ended_at = Some(now);
            })
            .await;
    }

    async fn probe_source(&self, tool: &str) -> Result<bool, SubOutcome> {
        self.probe(&self.source, tool).await
    }

    /// `command -v` on the given session; exit 0 means present.
    async fn probe(&self, session: &RemoteSession, tool: &str) -> Result<bool, SubOutcome> {
        match session
            .exec_collect(&shell::probe_command(tool), &self.token)
            .await
        {
            Ok((code, _, _)) => Ok(code == 0),
            Err(DialError::Cancelled) => Err(SubOutcome::Cancelled),
            Err(e) => Err(SubOutcome::Failed(format!("tool probe failed: {e}"))),
        }
    }

    /// SFTP-upload the target's private key to the source, mode 0600.
    async fn upload_key(&self, path: &str, key: &str) -> Result<(), SubOutcome> {
        let upload = async {
            let sftp = self.source.sftp(&self.token).await?;
            let mut file = sftp
                .create(path)
                .await
                .map_err(|e| DialError::Protocol(format!("sftp create failed: {e}")))?;
            file.write_all(key.as_bytes())
                .await
                .map_err(|e| DialError::Protocol(format!("sftp write failed: {e}")))?;
            file.shutdown()
                .await
                .map_err(|e| DialError::Protocol(format!("sftp close failed: {e}")))?;
            sftp.set_metadata(
                path,
                FileAttributes {
                    permissions: Some(0o600),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| DialError::Protocol(format!("sftp chmod failed: {e}")))?;
            Ok::<(), DialError>(())
        };

        match tokio::time::timeout(KEY_UPLOAD_TIMEOUT, upload).await {
            Err(_) => Err(SubOutcome::Failed("timed out uploading ephemeral key".into())),
            Ok(Err(DialError::Cancelled)) => Err(SubOutcome::Cancelled),
            Ok(Err(e)) => Err(SubOutcome::Failed(format!("ephemeral key upload: {e}"))),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Delete the uploaded key from the source. Runs on every exit
    /// path, including cancellation, so it ignores the task token.
    async fn remove_ephemeral_key(&self, path: &str) {
        let detached = CancellationToken::new();
        let removal = async {
            let sftp = self.source.sftp(&detached).await?;
            sftp.remove_file(path)
                .await
                .map_err(|e| DialError::Protocol(format!("sftp remove failed: {e}")))
        };
        match tokio::time::timeout(KEY_UPLOAD_TIMEOUT, removal).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(path, "failed to remove ephemeral key: {e}"),
            Err(_) => tracing::warn!(path, "timed out removing ephemeral key"),
        }
    }
}

/// Last `NNN%` token in an rsync stdout chunk, clamped to 100.
fn parse_progress(re: &Regex, text: &str) -> Option<u8> {
    re.captures_iter(text)
        .last()
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .map(|p| p.min(100) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_types::{SourceItem, SourceItemKind};

    fn subtask(status: TransferSubtaskStatus, progress: u8) -> TransferSubtask {
        TransferSubtask {
            id: Uuid::new_v4(),
            task_id: Uuid::nil(),
            target_connection_id: Uuid::new_v4(),
            item_name: "data".into(),
            status,
            progress,
            method_used: None,
            message: None,
            started_at: None,
            ended_at: None,
        }
    }

    fn request() -> TransferRequest {
        TransferRequest {
            source_connection_id: Uuid::new_v4(),
            connection_ids: vec![Uuid::new_v4()],
            source_items: vec![SourceItem {
                name: "data".into(),
                path: "/var/data".into(),
                kind: SourceItemKind::Directory,
            }],
            remote_target_path: "/backup".into(),
            method: TransferMethod::Auto,
        }
    }

    fn task(subtasks: Vec<TransferSubtask>) -> TransferTask {
        TransferTask {
            id: Uuid::new_v4(),
            owner: Uuid::new_v4(),
            status: TransferTaskStatus::InProgress,
            progress: 0,
            request: request(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: Some(Utc::now()),
            ended_at: None,
            subtasks,
        }
    }

    #[test]
    fn test_aggregate_promotion() {
        let mut t = task(vec![
            subtask(TransferSubtaskStatus::Completed, 100),
            subtask(TransferSubtaskStatus::Failed, 30),
        ]);
        aggregate(&mut t);
        assert_eq!(t.status, TransferTaskStatus::PartiallyCompleted);
        assert_eq!(t.progress, 65);
        assert!(t.ended_at.is_some());
    }

    #[test]
    fn test_aggregate_holds_cancelling_for_run_loop() {
        let mut t = task(vec![
            subtask(TransferSubtaskStatus::Completed, 100),
            subtask(TransferSubtaskStatus::Cancelled, 10),
        ]);
        t.status = TransferTaskStatus::Cancelling;
        aggregate(&mut t);
        // Promotion out of cancelling is the run loop's final step.
        assert_eq!(t.status, TransferTaskStatus::Cancelling);
    }

    #[test]
    fn test_aggregate_in_progress() {
        let mut t = task(vec![
            subtask(TransferSubtaskStatus::Transferring, 40),
            subtask(TransferSubtaskStatus::Queued, 0),
        ]);
        aggregate(&mut t);
        assert_eq!(t.status, TransferTaskStatus::InProgress);
        assert_eq!(t.progress, 20);
        assert!(t.ended_at.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        assert!(validate_request(&request()).is_ok());

        let mut bad = request();
        bad.connection_ids.clear();
        assert!(validate_request(&bad).is_err());

        let mut bad = request();
        bad.source_items.clear();
        assert!(validate_request(&bad).is_err());

        let mut bad = request();
        bad.source_items[0].path = "relative/path".into();
        assert!(validate_request(&bad).is_err());

        let mut bad = request();
        bad.remote_target_path = "  ".into();
        assert!(validate_request(&bad).is_err());
    }

    #[test]
    fn test_parse_progress_takes_last_token() {
        let re = Regex::new(r"(\d{1,3})%").unwrap();
        assert_eq!(parse_progress(&re, "  1,024,000  12%  1.2MB/s"), Some(12));
        assert_eq!(parse_progress(&re, "5%  ... 42%  ... 87%"), Some(87));
        assert_eq!(parse_progress(&re, "no progress here"), None);
        assert_eq!(parse_progress(&re, "999% bogus"), Some(100));
    }
}
