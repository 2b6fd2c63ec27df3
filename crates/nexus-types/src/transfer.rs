use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Status lattices ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferTaskStatus {
    Queued,
    InProgress,
    PartiallyCompleted,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

impl TransferTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PartiallyCompleted | Self::Completed | Self::Failed | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferSubtaskStatus {
    Queued,
    Connecting,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferSubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

// ── Transfer method ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    Auto,
    Rsync,
    Scp,
}

// ── Source items ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceItemKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceItem {
    pub name: String,
    /// Absolute path on the source host.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: SourceItemKind,
}

// ── Transfer Request ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_connection_id: Uuid,
    pub connection_ids: Vec<Uuid>,
    pub source_items: Vec<SourceItem>,
    pub remote_target_path: String,
    pub method: TransferMethod,
}

// ── Transfer Task ────────────────────────────────────────────────
//
// One sub-task per (target connection, source item). Bytes never
// touch the control plane; the source host pushes directly to each
// target.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: Uuid,
    pub owner: Uuid,
    pub status: TransferTaskStatus,
    pub progress: u8,
    pub request: TransferRequest,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub subtasks: Vec<TransferSubtask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSubtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub target_connection_id: Uuid,
    pub item_name: String,
    pub status: TransferSubtaskStatus,
    pub progress: u8,
    /// Tool that actually ran, once method resolution has happened.
    pub method_used: Option<TransferMethod>,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelling_is_not_terminal() {
        assert!(!TransferTaskStatus::Cancelling.is_terminal());
        assert!(TransferTaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_source_item_wire_format() {
        let item: SourceItem =
            serde_json::from_str(r#"{"name":"logs","path":"/var/log","type":"directory"}"#)
                .unwrap();
        assert_eq!(item.kind, SourceItemKind::Directory);
    }
}
