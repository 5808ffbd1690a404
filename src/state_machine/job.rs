use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plan::DecompositionPlan;
use super::records::StageExecution;
use super::state::{JobStatus, StageStatus};
use crate::error::FailureClass;

/// Kind of work a job performs. Selects the stage sequence.
///
/// Unknown names are kept as [`JobType::Other`] so new types only need a
/// sequence table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    Feature,
    NewModule,
    BugFix,
    Refactor,
    Test,
    Documentation,
    Other(String),
}

impl JobType {
    pub fn as_str(&self) -> &str {
        match self {
            JobType::Feature => "feature",
            JobType::NewModule => "new_module",
            JobType::BugFix => "bug_fix",
            JobType::Refactor => "refactor",
            JobType::Test => "test",
            JobType::Documentation => "documentation",
            JobType::Other(name) => name,
        }
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "feature" => JobType::Feature,
            "new_module" => JobType::NewModule,
            "bug_fix" | "bugfix" => JobType::BugFix,
            "refactor" => JobType::Refactor,
            "test" => JobType::Test,
            "documentation" | "docs" => JobType::Documentation,
            other => JobType::Other(other.to_string()),
        }
    }
}

impl From<String> for JobType {
    fn from(value: String) -> Self {
        JobType::from(value.as_str())
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One schedulable unit progressing through an ordered stage sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub parent_id: Option<String>,
    pub depth: u32,
    pub execution_order: i64,
    pub target: String,
    pub description: String,
    pub plan: Option<DecompositionPlan>,
    pub auto_execute_children: bool,
    pub checkpoint: Option<String>,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub last_error: Option<String>,
    pub failure_class: Option<FailureClass>,
    /// Set on replacement jobs created by the auto-repair loop.
    pub remediation_of: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: String,
    pub job_type: JobType,
    pub target: String,
    pub description: String,
    pub auto_execute_children: bool,
    pub parent_id: Option<String>,
    pub execution_order: i64,
    pub remediation_of: Option<String>,
}

impl NewJob {
    pub fn new(job_type: impl Into<JobType>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            target: String::new(),
            description: description.into(),
            auto_execute_children: true,
            parent_id: None,
            execution_order: 0,
            remediation_of: None,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn auto_execute_children(mut self, enabled: bool) -> Self {
        self.auto_execute_children = enabled;
        self
    }

    pub fn child_of(mut self, parent_id: impl Into<String>, execution_order: i64) -> Self {
        self.parent_id = Some(parent_id.into());
        self.execution_order = execution_order;
        self
    }

    /// Copy the original parameters of `job` into a brand-new job id.
    pub fn replacement_for(job: &Job) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job.job_type.clone(),
            target: job.target.clone(),
            description: job.description.clone(),
            auto_execute_children: job.auto_execute_children,
            parent_id: None,
            execution_order: 0,
            remediation_of: Some(job.id.clone()),
        }
    }
}

/// Summary of one stage inside an [`AuditRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub status: StageStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured audit record for a job, used by `status` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: String,
    pub job_type: JobType,
    pub description: String,
    pub status: JobStatus,
    pub stages: Vec<StageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl AuditRecord {
    pub fn from_job(job: &Job, stages: &[StageExecution]) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            description: job.description.clone(),
            status: job.status,
            stages: stages
                .iter()
                .map(|s| StageSummary {
                    stage: s.stage.clone(),
                    status: s.status,
                    retry_count: s.retry_count,
                    error: s.error.clone(),
                })
                .collect(),
            checkpoint: job.checkpoint.clone(),
            last_error: job.last_error.clone(),
            started_at: job.created_at,
            updated_at: job.updated_at,
            duration_ms: (job.updated_at - job.created_at).num_milliseconds(),
        }
    }
}
