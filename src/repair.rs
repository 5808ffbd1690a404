//! Bounded auto-repair of failed jobs.
//!
//! An eligible failure opens a remediation attempt, asks a [`Remediator`] for
//! the root cause and a patch, applies and commits the patch, rebuilds, and
//! finally creates a brand-new job with the original parameters. The failed
//! job is never resurrected. Attempts are capped per job and spaced by a
//! cooldown; both checks happen in the store inside the same transaction
//! that opens the attempt.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::anthropic::{MessageSender, MessagesRequest, extract_json_object};
use crate::clock::Clock;
use crate::config::AutoFixConfig;
use crate::error::{AgentError, FailureClass, ForgeError, Result};
use crate::git::VersionControl;
use crate::state_machine::{
    Job, JobStatus, JobType, NewJob, RemediationAttempt, RemediationStatus, StageExecution,
};
use crate::store::{JobStore, RemediationGate};

/// Everything a remediator gets to look at.
#[derive(Debug, Clone)]
pub struct RemediationContext {
    pub job: Job,
    pub stages: Vec<StageExecution>,
    pub diff: String,
    /// Filled in once investigation has finished.
    pub root_cause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Investigation {
    pub root_cause: String,
    pub fixable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Fix {
    pub patch: String,
    pub description: String,
}

#[async_trait]
pub trait Remediator: Send + Sync {
    async fn investigate(&self, ctx: &RemediationContext) -> Result<Investigation, AgentError>;
    async fn generate_fix(&self, ctx: &RemediationContext) -> Result<Fix, AgentError>;
}

/// Why a failed job is or is not a repair candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Disabled,
    NotFailed(JobStatus),
    JobTypeNotAllowed(JobType),
    FailureClassDenied(FailureClass),
    /// Replacement jobs are not repaired automatically.
    Replacement,
}

/// Result of a started attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub attempt: RemediationAttempt,
    pub replacement: Option<Job>,
}

pub struct AutoRepair {
    store: JobStore,
    config: AutoFixConfig,
    remediator: Arc<dyn Remediator>,
    vcs: Option<Arc<dyn VersionControl>>,
    clock: Arc<dyn Clock>,
}

impl AutoRepair {
    pub fn new(
        store: JobStore,
        config: AutoFixConfig,
        remediator: Arc<dyn Remediator>,
        vcs: Option<Arc<dyn VersionControl>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            remediator,
            vcs,
            clock,
        }
    }

    pub fn config(&self) -> &AutoFixConfig {
        &self.config
    }

    /// Static eligibility of `job`. The attempt cap and cooldown are checked
    /// when the attempt is opened.
    pub fn eligibility(&self, job: &Job, automatic: bool) -> Eligibility {
        if automatic && !self.config.enabled {
            return Eligibility::Disabled;
        }
        if job.status != JobStatus::Failed {
            return Eligibility::NotFailed(job.status);
        }
        if automatic && job.remediation_of.is_some() {
            return Eligibility::Replacement;
        }
        if !self
            .config
            .allowed_job_types
            .iter()
            .any(|t| JobType::from(t.as_str()) == job.job_type)
        {
            return Eligibility::JobTypeNotAllowed(job.job_type.clone());
        }
        if let Some(class) = job.failure_class
            && self.config.denied_failure_classes.contains(&class)
        {
            return Eligibility::FailureClassDenied(class);
        }
        Eligibility::Eligible
    }

    /// Try to repair `job_id`. Returns `None` when the job is not eligible or
    /// the cap or cooldown hold it back; otherwise the resolved attempt.
    pub async fn trigger(&self, job_id: &str, automatic: bool) -> Result<Option<RepairOutcome>> {
        let job = self.store.get_job(job_id)?;
        let eligibility = self.eligibility(&job, automatic);
        if eligibility != Eligibility::Eligible {
            debug!(job_id, ?eligibility, "auto-fix not eligible");
            return Ok(None);
        }

        let gate = self.store.begin_remediation(
            job_id,
            self.config.max_attempts,
            self.config.cooldown(),
            self.clock.now(),
        )?;
        let attempt = match gate {
            RemediationGate::Started(attempt) => attempt,
            RemediationGate::AttemptsExhausted { attempts } => {
                info!(job_id, attempts, "auto-fix attempts exhausted");
                return Ok(None);
            }
            RemediationGate::CoolingDown { until } => {
                info!(job_id, %until, "auto-fix cooling down");
                return Ok(None);
            }
        };
        info!(job_id, attempt_id = %attempt.id, "remediation started");

        let resolved = match self.drive(&job, &attempt).await {
            Ok(replacement) => self.complete(&attempt, &replacement),
            Err(err) => Err(err),
        };
        match resolved {
            Ok(outcome) => {
                info!(
                    job_id,
                    attempt_id = %attempt.id,
                    replacement_id = ?outcome.replacement.as_ref().map(|j| j.id.as_str()),
                    "remediation succeeded"
                );
                Ok(Some(outcome))
            }
            Err(err) => {
                warn!(job_id, attempt_id = %attempt.id, error = %err, "remediation failed");
                self.store
                    .fail_remediation(&attempt.id, &err.to_string(), self.clock.now())?;
                Ok(Some(RepairOutcome {
                    attempt: self.store.get_remediation(&attempt.id)?,
                    replacement: None,
                }))
            }
        }
    }

    /// Resolve a tested attempt by creating its replacement job.
    fn complete(&self, attempt: &RemediationAttempt, replacement: &NewJob) -> Result<RepairOutcome> {
        let attempt = self
            .store
            .complete_remediation(&attempt.id, replacement, self.clock.now())?;
        let replacement = self.store.get_job(&replacement.id)?;
        Ok(RepairOutcome {
            attempt,
            replacement: Some(replacement),
        })
    }

    /// Investigate, fix and rebuild. Leaves the attempt in `testing`.
    async fn drive(&self, job: &Job, attempt: &RemediationAttempt) -> Result<NewJob> {
        let vcs = self.vcs.as_ref().ok_or_else(|| {
            ForgeError::Validation("no version control configured to apply a fix".into())
        })?;

        let diff = vcs.diff().unwrap_or_else(|err| {
            warn!(job_id = %job.id, error = %err, "could not collect workspace diff");
            String::new()
        });
        let mut ctx = RemediationContext {
            job: job.clone(),
            stages: self.store.stages_of(&job.id)?,
            diff,
            root_cause: None,
        };

        let investigation = self.remediator.investigate(&ctx).await?;
        self.store
            .set_root_cause(&attempt.id, &investigation.root_cause, self.clock.now())?;
        if !investigation.fixable {
            return Err(ForgeError::Validation(format!(
                "not fixable: {}",
                investigation.root_cause
            )));
        }
        ctx.root_cause = Some(investigation.root_cause);
        self.advance(&attempt.id, RemediationStatus::Fixing)?;

        let fix = self.remediator.generate_fix(&ctx).await?;
        if fix.patch.trim().is_empty() {
            return Err(ForgeError::Validation("remediator produced an empty patch".into()));
        }
        vcs.apply_patch(&fix.patch)?;
        let marker = vcs.commit(&format!("fix: {} (remediation of {})", fix.description, job.id))?;
        self.store
            .set_remediation_artifact(&attempt.id, &marker, self.clock.now())?;
        if self.config.push {
            vcs.push()?;
        }

        self.advance(&attempt.id, RemediationStatus::Testing)?;
        vcs.rebuild()?;
        Ok(NewJob::replacement_for(job))
    }

    fn advance(&self, attempt_id: &str, next: RemediationStatus) -> Result<()> {
        if !self
            .store
            .transition_remediation(attempt_id, next, self.clock.now())?
        {
            return Err(ForgeError::ConstraintViolation(format!(
                "remediation {attempt_id} moved before reaching {next}"
            )));
        }
        Ok(())
    }
}

const MAX_TOKENS: u32 = 8192;

/// Remediator backed by the Anthropic Messages API.
pub struct ClaudeRemediator<S: MessageSender> {
    sender: S,
    model: String,
}

impl<S: MessageSender> ClaudeRemediator<S> {
    pub fn new(sender: S, model: impl Into<String>) -> Self {
        Self {
            sender,
            model: model.into(),
        }
    }

    async fn ask<T: serde::de::DeserializeOwned>(
        &self,
        system: &str,
        prompt: String,
    ) -> Result<T, AgentError> {
        let req = MessagesRequest::single(&self.model, MAX_TOKENS, system, prompt);
        let text = self.sender.send_message(&req).await?.text();
        let body = extract_json_object(&text)
            .ok_or_else(|| AgentError::Execution("remediator reply had no JSON".into()))?;
        serde_json::from_str(body)
            .map_err(|e| AgentError::Execution(format!("unparseable remediator reply: {e}")))
    }
}

fn describe_failure(ctx: &RemediationContext) -> String {
    let mut text = format!(
        "Job {} ({}) failed.\nTask:\n{}\n\nError: {}\n\nStages:\n",
        ctx.job.id,
        ctx.job.job_type,
        ctx.job.description,
        ctx.job.last_error.as_deref().unwrap_or("unknown")
    );
    for stage in &ctx.stages {
        text.push_str(&format!(
            "- {} [{}] retries={} {}\n",
            stage.stage,
            stage.status,
            stage.retry_count,
            stage.error.as_deref().unwrap_or("")
        ));
    }
    if !ctx.diff.is_empty() {
        text.push_str(&format!("\nWorkspace diff:\n{}\n", ctx.diff));
    }
    text
}

#[async_trait]
impl<S: MessageSender> Remediator for ClaudeRemediator<S> {
    async fn investigate(&self, ctx: &RemediationContext) -> Result<Investigation, AgentError> {
        self.ask(
            "You diagnose failed automated software jobs. Reply with JSON \
             {\"root_cause\": \"...\", \"fixable\": true|false}.",
            describe_failure(ctx),
        )
        .await
    }

    async fn generate_fix(&self, ctx: &RemediationContext) -> Result<Fix, AgentError> {
        let mut prompt = describe_failure(ctx);
        if let Some(root_cause) = &ctx.root_cause {
            prompt.push_str(&format!("\nRoot cause: {root_cause}\n"));
        }
        self.ask(
            "You write minimal unified-diff patches against the workspace. Reply with JSON \
             {\"patch\": \"<unified diff>\", \"description\": \"<one line>\"}.",
            prompt,
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Remediator with canned answers that counts calls.
    pub struct StubRemediator {
        pub fixable: bool,
        pub calls: Mutex<u32>,
    }

    impl StubRemediator {
        pub fn new(fixable: bool) -> Self {
            Self {
                fixable,
                calls: Mutex::new(0),
            }
        }

        pub fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Remediator for StubRemediator {
        async fn investigate(&self, _ctx: &RemediationContext) -> Result<Investigation, AgentError> {
            *self.calls.lock().unwrap() += 1;
            Ok(Investigation {
                root_cause: "missing import".into(),
                fixable: self.fixable,
            })
        }

        async fn generate_fix(&self, _ctx: &RemediationContext) -> Result<Fix, AgentError> {
            Ok(Fix {
                patch: "--- a/x\n+++ b/x\n".into(),
                description: "add import".into(),
            })
        }
    }

    /// Version control that records what it was asked to do.
    #[derive(Default)]
    pub struct FakeVcs {
        pub log: Mutex<Vec<String>>,
    }

    impl FakeVcs {
        pub fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl VersionControl for FakeVcs {
        fn diff(&self) -> Result<String> {
            Ok(String::new())
        }

        fn apply_patch(&self, _patch: &str) -> Result<()> {
            self.log.lock().unwrap().push("apply".into());
            Ok(())
        }

        fn commit(&self, message: &str) -> Result<String> {
            let mut log = self.log.lock().unwrap();
            log.push(format!("commit {message}"));
            Ok(format!("{:07}", log.len()))
        }

        fn push(&self) -> Result<()> {
            self.log.lock().unwrap().push("push".into());
            Ok(())
        }

        fn rebuild(&self) -> Result<()> {
            self.log.lock().unwrap().push("rebuild".into());
            Ok(())
        }
    }
}
