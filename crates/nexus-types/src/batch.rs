use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ── Status lattices ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchTaskStatus {
    Queued,
    InProgress,
    PartiallyCompleted,
    Completed,
    Failed,
    Cancelled,
}

impl BatchTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PartiallyCompleted | Self::Completed | Self::Failed | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchSubtaskStatus {
    Queued,
    Connecting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchSubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

// ── Batch Request ────────────────────────────────────────────────

/// The submission payload, kept verbatim on the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub command: String,
    pub connection_ids: Vec<Uuid>,
    /// Concurrent sub-task limit, 1–50. Defaults to 5.
    pub concurrency: Option<usize>,
    /// Per-host wall-clock deadline in seconds, 1–3600.
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub workdir: Option<String>,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default)]
    pub login_shell: bool,
}

// ── Batch Task ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTask {
    pub id: Uuid,
    pub owner: Uuid,
    pub status: BatchTaskStatus,
    pub concurrency: usize,
    /// Overall progress 0–100, the clamped integer mean of the
    /// sub-task progresses.
    pub progress: u8,
    pub counts: BatchCounts,
    pub request: BatchRequest,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Ordered by submission; dispatch follows this order.
    pub subtasks: Vec<BatchSubtask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub connection_id: Uuid,
    pub connection_name: String,
    pub command: String,
    pub status: BatchSubtaskStatus,
    pub progress: u8,
    pub exit_code: Option<i32>,
    /// Captured stdout ∪ stderr, bounded.
    pub output: String,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&BatchTaskStatus::PartiallyCompleted).unwrap(),
            "\"partially-completed\""
        );
        assert_eq!(
            serde_json::to_string(&BatchSubtaskStatus::Connecting).unwrap(),
            "\"connecting\""
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(BatchSubtaskStatus::Completed.is_terminal());
        assert!(BatchSubtaskStatus::Failed.is_terminal());
        assert!(BatchSubtaskStatus::Cancelled.is_terminal());
        assert!(!BatchSubtaskStatus::Running.is_terminal());
        assert!(!BatchTaskStatus::InProgress.is_terminal());
        assert!(BatchTaskStatus::PartiallyCompleted.is_terminal());
    }
}
