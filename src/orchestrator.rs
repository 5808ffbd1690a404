//! Drives jobs through their stage sequence, hands decomposed work to the
//! sub-job queue, and triggers auto-repair when a job fails.
//!
//! Every status change goes through the store's compare-and-set, so any
//! number of callers (CLI invocations, timers, handlers) can share one
//! database. Between stages the job row is re-read: a `paused` or
//! `cancelled` job does not start another stage.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::agent::{AgentInvoker, AgentRegistry, StageOutcome};
use crate::clock::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::config::ForgeConfig;
use crate::error::{FailureClass, ForgeError, Result};
use crate::git::VersionControl;
use crate::queue::{QueueAdvance, SubJobQueue};
use crate::repair::{AutoRepair, Remediator};
use crate::sequencer::StageSequencer;
use crate::state_machine::{
    AuditRecord, DecompositionPlan, EntryStatus, Job, JobStatus, NewJob, QueueStatus,
    RemediationAttempt, StageStatus, SubJobQueueEntry,
};
use crate::store::JobStore;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Collects the collaborators of an [`Orchestrator`].
pub struct OrchestratorBuilder {
    store: JobStore,
    config: ForgeConfig,
    registry: AgentRegistry,
    remediator: Option<Arc<dyn Remediator>>,
    vcs: Option<Arc<dyn VersionControl>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl OrchestratorBuilder {
    pub fn remediator(mut self, remediator: Arc<dyn Remediator>) -> Self {
        self.remediator = Some(remediator);
        self
    }

    pub fn version_control(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> Orchestrator {
        let invoker = AgentInvoker::new(
            self.store.clone(),
            self.registry,
            self.config.retry.clone(),
            self.config.stages.timeout(),
            self.config.workspace.clone(),
            self.clock.clone(),
            self.sleeper,
        );
        let repair = self.remediator.map(|remediator| {
            AutoRepair::new(
                self.store.clone(),
                self.config.auto_fix.clone(),
                remediator,
                self.vcs.clone(),
                self.clock.clone(),
            )
        });
        Orchestrator {
            inner: Arc::new(Inner {
                sequencer: StageSequencer::new(&self.config.stages.sequences),
                queue: SubJobQueue::new(self.store.clone(), self.clock.clone()),
                invoker,
                repair,
                vcs: self.vcs,
                clock: self.clock,
                store: self.store,
                config: self.config,
            }),
        }
    }
}

struct Inner {
    store: JobStore,
    config: ForgeConfig,
    sequencer: StageSequencer,
    invoker: AgentInvoker,
    queue: SubJobQueue,
    repair: Option<AutoRepair>,
    vcs: Option<Arc<dyn VersionControl>>,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(store: JobStore, config: ForgeConfig, registry: AgentRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            config,
            registry,
            remediator: None,
            vcs: None,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.clock.now()
    }

    /// Persist a new `pending` job.
    pub fn create_job(&self, new: NewJob) -> Result<Job> {
        if new.description.trim().is_empty() {
            return Err(ForgeError::Validation("job description must not be empty".into()));
        }
        if !self.inner.sequencer.knows(&new.job_type) {
            warn!(job_type = %new.job_type, "no stage sequence for job type; default will be used");
        }
        let job = self.inner.store.create_job(&new, self.now())?;
        info!(job_id = %job.id, job_type = %job.job_type, "job created");
        Ok(job)
    }

    /// Start a pending job, or continue a running one, until it reaches a
    /// terminal status, pauses, or waits on its sub-job queue.
    pub fn run_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<Job>> {
        Box::pin(async move {
            let job = self.inner.store.get_job(job_id)?;
            if !job.status.is_terminal() {
                self.ensure_queue_slot(&job)?;
            }
            match job.status {
                JobStatus::Pending => {
                    if !self.inner.store.compare_and_set_job_status(
                        job_id,
                        JobStatus::Pending,
                        JobStatus::Running,
                        self.now(),
                    )? {
                        debug!(job_id, "job was started by another caller");
                        return self.inner.store.get_job(job_id);
                    }
                    info!(job_id, job_type = %job.job_type, depth = job.depth, "job started");
                }
                JobStatus::Running => {
                    debug!(job_id, "continuing running job");
                }
                _ => {
                    debug!(job_id, status = %job.status, "job not runnable");
                    return Ok(job);
                }
            }
            self.drive(job_id).await
        })
    }

    /// A queued child may only run while its own entry is in progress.
    fn ensure_queue_slot(&self, job: &Job) -> Result<()> {
        if job.parent_id.is_none() {
            return Ok(());
        }
        match self.inner.store.entry_for_child(&job.id)? {
            Some(entry) if entry.status != EntryStatus::InProgress => {
                Err(ForgeError::InvalidTransition {
                    id: job.id.clone(),
                    from: format!("{} (queue entry {})", job.status, entry.status),
                    to: JobStatus::Running.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn drive<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<Job>> {
        Box::pin(async move {
            let store = &self.inner.store;
            if store.has_queue(job_id)? {
                return self.drive_queue(job_id).await;
            }

            let job = store.get_job(job_id)?;
            let stages = self.inner.sequencer.stages_for(&job.job_type).to_vec();
            let done: HashSet<u32> = store
                .stages_of(job_id)?
                .into_iter()
                .filter(|s| s.status == StageStatus::Completed)
                .map(|s| s.position)
                .collect();

            for (position, stage) in stages.iter().enumerate() {
                let position = position as u32;
                if done.contains(&position) {
                    continue;
                }
                let current = store.get_job(job_id)?;
                if current.status != JobStatus::Running {
                    info!(job_id, status = %current.status, next_stage = %stage, "stopping between stages");
                    return Ok(current);
                }

                match self.inner.invoker.invoke(&current, stage, position).await? {
                    StageOutcome::Completed { plan, .. } => {
                        self.checkpoint(&current, stage);
                        if let Some(plan) = plan
                            && let Some(decomposed) = self.decompose(&current, &plan).await?
                        {
                            return Ok(decomposed);
                        }
                    }
                    StageOutcome::Failed { error, class } => {
                        let error = format!("stage '{stage}' failed: {error}");
                        store.fail_job(job_id, &error, Some(class), self.now())?;
                        return self.finish(job_id).await;
                    }
                    StageOutcome::Discarded => return store.get_job(job_id),
                }
            }

            if store
                .transition_job(job_id, JobStatus::Completed, self.now())?
                .is_none()
            {
                return store.get_job(job_id);
            }
            self.finish(job_id).await
        })
    }

    /// Hand `plan` to the sub-job queue when decomposition applies. Returns
    /// the job once its own stage list should stop.
    async fn decompose(&self, job: &Job, plan: &DecompositionPlan) -> Result<Option<Job>> {
        let max_depth = self.inner.config.decomposition.max_depth;
        if plan.is_empty() || !job.auto_execute_children || job.depth >= max_depth {
            debug!(
                job_id = %job.id,
                depth = job.depth,
                auto_execute_children = job.auto_execute_children,
                "decomposition plan not applied"
            );
            return Ok(None);
        }
        match self.inner.queue.materialize_children(job, plan) {
            Ok(_) => Ok(Some(self.drive_queue(&job.id).await?)),
            Err(err @ (ForgeError::ConstraintViolation(_) | ForgeError::Validation(_))) => {
                let error = format!("invalid decomposition plan: {err}");
                self.inner
                    .store
                    .fail_job(&job.id, &error, Some(FailureClass::Validation), self.now())?;
                Ok(Some(self.finish(&job.id).await?))
            }
            Err(err) => Err(err),
        }
    }

    fn drive_queue<'a>(&'a self, parent_id: &'a str) -> BoxFuture<'a, Result<Job>> {
        Box::pin(async move {
            self.advance_queue(parent_id).await?;
            self.inner.store.get_job(parent_id)
        })
    }

    /// Record finished children of `parent_id`, then start the next
    /// executable child or finish the parent when the queue has drained.
    /// Each child's terminal transition chains the following one.
    pub fn advance_queue<'a>(&'a self, parent_id: &'a str) -> BoxFuture<'a, Result<QueueAdvance>> {
        Box::pin(async move {
            let advance = self.inner.queue.advance_queue(parent_id)?;
            if let Some(entry) = &advance.next {
                let child = self.run_job(&entry.child_id).await?;
                // A child that was already terminal when claimed never reaches
                // `finish`, so its entry is recorded here.
                if child.status.is_terminal()
                    && self
                        .inner
                        .store
                        .entry_for_child(&child.id)?
                        .is_some_and(|e| e.status == EntryStatus::InProgress)
                {
                    self.advance_queue(parent_id).await?;
                }
            } else if advance.rolled_up.is_some() {
                self.finish(parent_id).await?;
            }
            Ok(advance)
        })
    }

    /// Terminal-transition hook: auto-repair on failure, then advance the
    /// parent's queue.
    fn finish<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<Job>> {
        Box::pin(async move {
            let job = self.inner.store.get_job(job_id)?;
            if !job.status.is_terminal() {
                return Ok(job);
            }
            match job.status {
                JobStatus::Failed => warn!(
                    job_id,
                    error = job.last_error.as_deref().unwrap_or(""),
                    "job failed"
                ),
                status => info!(job_id, %status, "job finished"),
            }

            if job.status == JobStatus::Failed
                && let Some(repair) = &self.inner.repair
            {
                match repair.trigger(job_id, true).await {
                    Ok(Some(outcome)) => {
                        if let Some(replacement) = outcome.replacement {
                            self.start_replacement(&replacement).await;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(job_id, error = %err, "auto-repair errored"),
                }
            }

            if let Some(parent_id) = &job.parent_id {
                self.advance_queue(parent_id).await?;
            }
            self.inner.store.get_job(job_id)
        })
    }

    async fn start_replacement(&self, replacement: &Job) {
        if !self.inner.config.auto_fix.run_replacement {
            info!(replacement_id = %replacement.id, "replacement job created; not started");
            return;
        }
        match self.run_job(&replacement.id).await {
            Ok(job) => info!(replacement_id = %job.id, status = %job.status, "replacement job ran"),
            Err(err) => warn!(replacement_id = %replacement.id, error = %err, "replacement job errored"),
        }
    }

    fn checkpoint(&self, job: &Job, stage: &str) {
        let marker = match &self.inner.vcs {
            Some(vcs) => match vcs.commit(&format!("jobforge: [{stage}] {}", job.description)) {
                Ok(hash) => hash,
                Err(err) => {
                    warn!(job_id = %job.id, stage, error = %err, "checkpoint commit failed");
                    return;
                }
            },
            None => stage.to_string(),
        };
        if let Err(err) = self.inner.store.set_checkpoint(&job.id, &marker, self.now()) {
            warn!(job_id = %job.id, stage, error = %err, "could not record checkpoint");
        }
    }

    /// Stop the job before its next stage (or next child).
    pub fn pause(&self, job_id: &str, reason: &str) -> Result<Job> {
        let store = &self.inner.store;
        if store.transition_job(job_id, JobStatus::Paused, self.now())?.is_none() {
            let job = store.get_job(job_id)?;
            return Err(ForgeError::InvalidTransition {
                id: job_id.to_string(),
                from: job.status.to_string(),
                to: JobStatus::Paused.to_string(),
            });
        }
        store.set_pause(job_id, true, Some(reason), self.now())?;
        info!(job_id, reason, "job paused");
        store.get_job(job_id)
    }

    /// Continue a paused job at its first stage without a completed run, or
    /// re-drive its sub-job queue.
    pub fn resume<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<Job>> {
        Box::pin(async move {
            let store = &self.inner.store;
            if !store.compare_and_set_job_status(
                job_id,
                JobStatus::Paused,
                JobStatus::Running,
                self.now(),
            )? {
                let job = store.get_job(job_id)?;
                return Err(ForgeError::InvalidTransition {
                    id: job_id.to_string(),
                    from: job.status.to_string(),
                    to: JobStatus::Running.to_string(),
                });
            }
            store.set_pause(job_id, false, None, self.now())?;
            info!(job_id, "job resumed");
            self.drive(job_id).await
        })
    }

    /// Cancel a job and everything below it. Pending children are skipped;
    /// an in-flight stage has its result discarded when it returns.
    pub fn cancel<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<Job>> {
        Box::pin(async move {
            let store = &self.inner.store;
            if store
                .transition_job(job_id, JobStatus::Cancelled, self.now())?
                .is_none()
            {
                let job = store.get_job(job_id)?;
                debug!(job_id, status = %job.status, "cancel had nothing to do");
                return Ok(job);
            }
            store.set_pause(job_id, false, None, self.now())?;
            info!(job_id, "job cancelled");

            let skipped = self.inner.queue.skip_pending(job_id, "parent cancelled")?;
            if !skipped.is_empty() {
                debug!(job_id, skipped = skipped.len(), "pending sub-jobs skipped");
            }
            let running: Vec<SubJobQueueEntry> = store
                .queue_entries(job_id)?
                .into_iter()
                .filter(|e| e.status == EntryStatus::InProgress)
                .collect();
            for entry in running {
                self.cancel(&entry.child_id).await?;
            }
            // Records the cancelled children on their entries.
            self.inner.queue.advance_queue(job_id)?;

            let job = store.get_job(job_id)?;
            if let Some(parent_id) = &job.parent_id {
                self.advance_queue(parent_id).await?;
            }
            Ok(job)
        })
    }

    pub fn queue_status(&self, job_id: &str) -> Result<QueueStatus> {
        self.inner.queue.queue_status(job_id)
    }

    pub fn next_executable(&self, job_id: &str) -> Result<Option<SubJobQueueEntry>> {
        self.inner.queue.get_next_executable(job_id)
    }

    /// Manually request a remediation attempt for a failed job. Returns
    /// `None` when the job is ineligible or held back by the cap or cooldown.
    pub async fn trigger_auto_fix(&self, job_id: &str) -> Result<Option<RemediationAttempt>> {
        let repair = self
            .inner
            .repair
            .as_ref()
            .ok_or_else(|| ForgeError::Config("auto-repair is not configured".into()))?;
        let Some(outcome) = repair.trigger(job_id, false).await? else {
            return Ok(None);
        };
        if let Some(replacement) = &outcome.replacement {
            self.start_replacement(replacement).await;
        }
        Ok(Some(outcome.attempt))
    }

    /// Running jobs that have not been updated within `stages.stale_after_secs`.
    pub fn stale_jobs(&self) -> Result<Vec<Job>> {
        let threshold = chrono::Duration::seconds(self.inner.config.stages.stale_after_secs as i64);
        self.inner.store.stale_jobs(threshold, self.now())
    }

    pub fn audit(&self, job_id: &str) -> Result<AuditRecord> {
        let job = self.inner.store.get_job(job_id)?;
        let stages = self.inner.store.stages_of(job_id)?;
        Ok(AuditRecord::from_job(&job, &stages))
    }
}
