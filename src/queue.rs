//! Dependency-aware, single-flight queue over a decomposed parent's children.
//!
//! Children share the parent's working tree, so at most one entry per parent
//! is `in_progress`. An entry becomes executable once every entry it depends
//! on is `completed`; pending entries downstream of a failed or skipped
//! sibling are skipped so the queue always drains. When nothing is left
//! pending or in progress the parent's status is rolled up from the entries.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{ForgeError, Result};
use crate::state_machine::{
    DecompositionPlan, EntryStatus, Job, JobStatus, JobType, NewJob, QueueStatus, SubJobQueueEntry,
};
use crate::store::JobStore;

/// What one `advance_queue` call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueAdvance {
    /// Entry that was moved to `in_progress` and whose child should run next.
    pub next: Option<SubJobQueueEntry>,
    /// Parent status written by the roll-up, if this call performed it.
    pub rolled_up: Option<JobStatus>,
}

enum Selection {
    NoQueue,
    Busy,
    Ready(SubJobQueueEntry),
    Drained(Option<JobStatus>),
}

#[derive(Clone)]
pub struct SubJobQueue {
    store: JobStore,
    clock: Arc<dyn Clock>,
}

impl SubJobQueue {
    pub fn new(store: JobStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create one child job and one pending entry per sub-task of `plan`.
    ///
    /// Children inherit the parent's target and `auto_execute_children`;
    /// a sub-task without a job type takes the parent's.
    pub fn materialize_children(
        &self,
        parent: &Job,
        plan: &DecompositionPlan,
    ) -> Result<Vec<SubJobQueueEntry>> {
        if plan.is_empty() {
            return Err(ForgeError::Validation(format!(
                "decomposition plan for {} has no sub-tasks",
                parent.id
            )));
        }
        plan.validate()?;

        let children: Vec<(NewJob, Vec<usize>)> = plan
            .subtasks
            .iter()
            .enumerate()
            .map(|(i, task)| {
                let job_type = task
                    .job_type
                    .as_deref()
                    .map(JobType::from)
                    .unwrap_or_else(|| parent.job_type.clone());
                let child = NewJob::new(job_type, task.task_description())
                    .target(parent.target.clone())
                    .auto_execute_children(parent.auto_execute_children)
                    .child_of(&parent.id, i as i64);
                (child, task.depends_on.clone())
            })
            .collect();

        let now = self.clock.now();
        let entries = self.store.insert_children(&parent.id, &children, now)?;
        self.store.set_plan(&parent.id, plan, now)?;
        info!(
            parent_id = %parent.id,
            children = entries.len(),
            "materialized sub-job queue"
        );
        Ok(entries)
    }

    /// The entry whose child should run next, or `None`.
    ///
    /// Returns `None` while any entry is in progress. Skips unreachable
    /// entries and rolls the parent up when the queue has drained.
    pub fn get_next_executable(&self, parent_id: &str) -> Result<Option<SubJobQueueEntry>> {
        match self.select(parent_id)? {
            Selection::Ready(entry) => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    /// Record finished children, then claim the next executable entry.
    ///
    /// Nothing new is claimed while the parent is paused or terminal.
    pub fn advance_queue(&self, parent_id: &str) -> Result<QueueAdvance> {
        for entry in self.store.queue_entries(parent_id)? {
            if entry.status == EntryStatus::InProgress && !self.record_child_result(&entry)? {
                debug!(parent_id, child_id = %entry.child_id, "child still running");
                return Ok(QueueAdvance::default());
            }
        }

        let parent = self.store.get_job(parent_id)?;
        if parent.status.is_terminal() {
            return Ok(QueueAdvance::default());
        }
        if parent.status == JobStatus::Paused || parent.paused {
            debug!(parent_id, "parent paused; not starting another child");
            return Ok(QueueAdvance::default());
        }

        match self.select(parent_id)? {
            Selection::Ready(entry) => self.claim(entry),
            Selection::Drained(rolled_up) => Ok(QueueAdvance {
                next: None,
                rolled_up,
            }),
            Selection::NoQueue | Selection::Busy => Ok(QueueAdvance::default()),
        }
    }

    pub fn queue_status(&self, parent_id: &str) -> Result<QueueStatus> {
        self.store.get_job(parent_id)?;
        Ok(QueueStatus::from_entries(
            &self.store.queue_entries(parent_id)?,
        ))
    }

    /// Skip every pending entry of `parent_id` and cancel its child.
    pub fn skip_pending(&self, parent_id: &str, reason: &str) -> Result<Vec<SubJobQueueEntry>> {
        let now = self.clock.now();
        let mut skipped = Vec::new();
        for entry in self.store.queue_entries(parent_id)? {
            if entry.status == EntryStatus::Pending
                && self.store.transition_entry(
                    &entry.id,
                    EntryStatus::Pending,
                    EntryStatus::Skipped,
                    Some(reason),
                    now,
                )?
            {
                self.store
                    .transition_job(&entry.child_id, JobStatus::Cancelled, now)?;
                skipped.push(entry);
            }
        }
        Ok(skipped)
    }

    /// Mirror the child's terminal status onto its in-progress entry.
    /// Returns `false` while the child has not finished.
    fn record_child_result(&self, entry: &SubJobQueueEntry) -> Result<bool> {
        let child = self.store.get_job(&entry.child_id)?;
        let (next, error) = match child.status {
            JobStatus::Completed | JobStatus::CompletedWithWarnings => (EntryStatus::Completed, None),
            JobStatus::Failed => (
                EntryStatus::Failed,
                Some(
                    child
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "child job failed".to_string()),
                ),
            ),
            JobStatus::Cancelled => (EntryStatus::Failed, Some("child job cancelled".to_string())),
            JobStatus::Pending | JobStatus::Running | JobStatus::Paused => return Ok(false),
        };
        if self.store.transition_entry(
            &entry.id,
            EntryStatus::InProgress,
            next,
            error.as_deref(),
            self.clock.now(),
        )? {
            info!(
                parent_id = %entry.parent_id,
                child_id = %entry.child_id,
                status = %next,
                "sub-job finished"
            );
        }
        Ok(true)
    }

    fn claim(&self, entry: SubJobQueueEntry) -> Result<QueueAdvance> {
        let claimed = match self.store.transition_entry(
            &entry.id,
            EntryStatus::Pending,
            EntryStatus::InProgress,
            None,
            self.clock.now(),
        ) {
            Ok(claimed) => claimed,
            // Another caller claimed a sibling first.
            Err(ForgeError::ConstraintViolation(_)) => false,
            Err(err) => return Err(err),
        };
        if !claimed {
            debug!(parent_id = %entry.parent_id, entry_id = %entry.id, "lost claim race");
            return Ok(QueueAdvance::default());
        }
        info!(
            parent_id = %entry.parent_id,
            child_id = %entry.child_id,
            order = entry.execution_order,
            "starting sub-job"
        );
        Ok(QueueAdvance {
            next: Some(SubJobQueueEntry {
                status: EntryStatus::InProgress,
                ..entry
            }),
            rolled_up: None,
        })
    }

    fn select(&self, parent_id: &str) -> Result<Selection> {
        let entries = self.store.queue_entries(parent_id)?;
        if entries.is_empty() {
            self.store.get_job(parent_id)?;
            return Ok(Selection::NoQueue);
        }
        if entries.iter().any(|e| e.status == EntryStatus::InProgress) {
            return Ok(Selection::Busy);
        }

        let completed: HashSet<&str> = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Completed)
            .map(|e| e.id.as_str())
            .collect();
        // Entries arrive ordered by execution_order, so the first match wins.
        if let Some(ready) = entries.iter().find(|e| {
            e.status == EntryStatus::Pending && e.depends_on.iter().all(|d| completed.contains(d.as_str()))
        }) {
            return Ok(Selection::Ready(ready.clone()));
        }

        if entries.iter().any(|e| e.status == EntryStatus::Pending) {
            self.skip_unreachable(&entries)?;
        }
        Ok(Selection::Drained(self.roll_up(parent_id)?))
    }

    /// Skip pending entries downstream of a failed or skipped sibling, then
    /// any pending entry still left with no path forward.
    fn skip_unreachable(&self, entries: &[SubJobQueueEntry]) -> Result<()> {
        let mut blocked: HashSet<&str> = entries
            .iter()
            .filter(|e| e.status.is_blocking())
            .map(|e| e.id.as_str())
            .collect();
        loop {
            let before = blocked.len();
            for entry in entries.iter().filter(|e| e.status == EntryStatus::Pending) {
                if entry.depends_on.iter().any(|d| blocked.contains(d.as_str())) {
                    blocked.insert(entry.id.as_str());
                }
            }
            if blocked.len() == before {
                break;
            }
        }

        let now = self.clock.now();
        for entry in entries.iter().filter(|e| e.status == EntryStatus::Pending) {
            let reason = if blocked.contains(entry.id.as_str()) {
                "skipped: a dependency failed or was skipped"
            } else {
                warn!(
                    parent_id = %entry.parent_id,
                    entry_id = %entry.id,
                    "queue entry can never run; skipping"
                );
                "skipped: dependency deadlock"
            };
            if self.store.transition_entry(
                &entry.id,
                EntryStatus::Pending,
                EntryStatus::Skipped,
                Some(reason),
                now,
            )? {
                self.store
                    .transition_job(&entry.child_id, JobStatus::Cancelled, now)?;
                warn!(
                    parent_id = %entry.parent_id,
                    child_id = %entry.child_id,
                    "sub-job skipped"
                );
            }
        }
        Ok(())
    }

    /// Write the parent's aggregate status once the queue has drained.
    /// Returns the status written, or `None` if the parent had already left
    /// running/paused.
    fn roll_up(&self, parent_id: &str) -> Result<Option<JobStatus>> {
        let status = QueueStatus::from_entries(&self.store.queue_entries(parent_id)?);
        if status.total() == 0 || !status.is_exhausted() {
            return Ok(None);
        }

        let target = if status.completed == status.total() {
            JobStatus::Completed
        } else if status.completed == 0 {
            JobStatus::Failed
        } else {
            JobStatus::CompletedWithWarnings
        };

        let parent = self.store.get_job(parent_id)?;
        if !matches!(parent.status, JobStatus::Running | JobStatus::Paused) {
            return Ok(None);
        }

        let now = self.clock.now();
        let previous = if target == JobStatus::Failed {
            let error = format!(
                "no sub-job completed ({} failed, {} skipped)",
                status.failed, status.skipped
            );
            self.store.fail_job(parent_id, &error, None, now)?
        } else {
            if target == JobStatus::CompletedWithWarnings {
                self.store.set_last_error(
                    parent_id,
                    &format!(
                        "{} of {} sub-jobs failed or were skipped",
                        status.failed + status.skipped,
                        status.total()
                    ),
                    now,
                )?;
            }
            self.store.transition_job(parent_id, target, now)?
        };

        if previous.is_some() {
            info!(parent_id, status = %target, "parent rolled up from sub-job queue");
            Ok(Some(target))
        } else {
            Ok(None)
        }
    }
}
