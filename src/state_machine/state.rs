use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a job.
///
/// ```text
/// pending ──> running ──> completed | completed_with_warnings | failed
///    │           ▲ │
///    │           │ ▼
///    └───────> paused
/// any non-terminal ──> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    CompletedWithWarnings,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::CompletedWithWarnings,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::CompletedWithWarnings
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the job state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (from, Cancelled) => !from.is_terminal(),
            (Pending, Running) | (Pending, Paused) => true,
            (Running, Paused) => true,
            (Paused, Running) => true,
            // A paused parent can still be rolled up by its last child, and a
            // stage already in flight when the pause landed can still fail.
            (Running | Paused, Completed | CompletedWithWarnings | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithWarnings => "completed_with_warnings",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Status of one stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub const ALL: [StageStatus; 4] = [
        StageStatus::Queued,
        StageStatus::Running,
        StageStatus::Completed,
        StageStatus::Failed,
    ];

    pub fn can_transition_to(self, next: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Failed) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Queued => "queued",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a slot in a parent's sub-job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl EntryStatus {
    pub const ALL: [EntryStatus; 5] = [
        EntryStatus::Pending,
        EntryStatus::InProgress,
        EntryStatus::Completed,
        EntryStatus::Failed,
        EntryStatus::Skipped,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntryStatus::Completed | EntryStatus::Failed | EntryStatus::Skipped
        )
    }

    /// True for outcomes that block dependents.
    pub fn is_blocking(self) -> bool {
        matches!(self, EntryStatus::Failed | EntryStatus::Skipped)
    }

    pub fn can_transition_to(self, next: EntryStatus) -> bool {
        use EntryStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::InProgress => "in_progress",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
            EntryStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one remediation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    Investigating,
    Fixing,
    Testing,
    Success,
    Failed,
}

impl RemediationStatus {
    pub const ALL: [RemediationStatus; 5] = [
        RemediationStatus::Investigating,
        RemediationStatus::Fixing,
        RemediationStatus::Testing,
        RemediationStatus::Success,
        RemediationStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, RemediationStatus::Success | RemediationStatus::Failed)
    }

    pub fn can_transition_to(self, next: RemediationStatus) -> bool {
        use RemediationStatus::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Investigating, Fixing) | (Fixing, Testing) | (Testing, Success) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RemediationStatus::Investigating => "investigating",
            RemediationStatus::Fixing => "fixing",
            RemediationStatus::Testing => "testing",
            RemediationStatus::Success => "success",
            RemediationStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl fmt::Display for RemediationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
