use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{EntryStatus, RemediationStatus, StageStatus};

/// One stage run of a job. Retries reuse the row and bump `retry_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    pub id: String,
    pub job_id: String,
    pub stage: String,
    /// Index of the stage inside the job's sequence.
    pub position: u32,
    pub status: StageStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The queue slot for one child of a decomposed parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubJobQueueEntry {
    pub id: String,
    pub parent_id: String,
    pub child_id: String,
    pub execution_order: i64,
    pub status: EntryStatus,
    /// Sibling entry ids that must be completed first.
    pub depends_on: BTreeSet<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-status entry counts for a parent's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl QueueStatus {
    pub fn from_entries(entries: &[SubJobQueueEntry]) -> Self {
        let mut status = QueueStatus::default();
        for entry in entries {
            match entry.status {
                EntryStatus::Pending => status.pending += 1,
                EntryStatus::InProgress => status.in_progress += 1,
                EntryStatus::Completed => status.completed += 1,
                EntryStatus::Failed => status.failed += 1,
                EntryStatus::Skipped => status.skipped += 1,
            }
        }
        status
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.skipped
    }

    pub fn is_exhausted(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAttempt {
    pub id: String,
    pub job_id: String,
    pub status: RemediationStatus,
    pub root_cause: Option<String>,
    /// Checkpoint marker of the committed fix.
    pub artifact: Option<String>,
    pub new_job_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: EntryStatus) -> SubJobQueueEntry {
        let now = Utc::now();
        SubJobQueueEntry {
            id: "e".into(),
            parent_id: "p".into(),
            child_id: "c".into(),
            execution_order: 0,
            status,
            depends_on: BTreeSet::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn queue_status_counts() {
        let entries = vec![
            entry(EntryStatus::Completed),
            entry(EntryStatus::Completed),
            entry(EntryStatus::Failed),
            entry(EntryStatus::Pending),
        ];
        let status = QueueStatus::from_entries(&entries);
        assert_eq!(status.completed, 2);
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 1);
        assert_eq!(status.total(), 4);
        assert!(!status.is_exhausted());
    }
}
