use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{AgentRegistry, AgentRequest, AgentResult};
use crate::clock::{Clock, Sleeper};
use crate::config::RetryConfig;
use crate::error::{AgentError, FailureClass, ForgeError, Result};
use crate::state_machine::{DecompositionPlan, Job, JobStatus, StageStatus};
use crate::store::JobStore;

const DISCARDED: &str = "discarded: job cancelled";

/// Result of running one stage to a terminal row.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed {
        output: String,
        artifacts: Vec<String>,
        plan: Option<DecompositionPlan>,
    },
    Failed {
        error: String,
        class: FailureClass,
    },
    /// The job was cancelled while the agent was running; its answer was dropped.
    Discarded,
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Completed { .. })
    }
}

/// Runs a stage against its registered agent with bounded, classified retry.
pub struct AgentInvoker {
    store: JobStore,
    registry: AgentRegistry,
    retry: RetryConfig,
    timeout: Duration,
    working_dir: PathBuf,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl AgentInvoker {
    pub fn new(
        store: JobStore,
        registry: AgentRegistry,
        retry: RetryConfig,
        timeout: Duration,
        working_dir: PathBuf,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            store,
            registry,
            retry,
            timeout,
            working_dir,
            clock,
            sleeper,
        }
    }

    /// Execute `stage` for `job` as a new stage row at `position`.
    ///
    /// The row goes queued -> running before the first attempt and reaches
    /// completed or failed after the last one. On exhaustion the row keeps
    /// the last attempt's error.
    pub async fn invoke(&self, job: &Job, stage: &str, position: u32) -> Result<StageOutcome> {
        let exec = self.store.create_stage(&job.id, stage, position, self.clock.now())?;
        match self.store.transition_stage(
            &exec.id,
            StageStatus::Queued,
            StageStatus::Running,
            None,
            self.clock.now(),
        ) {
            Ok(true) => {}
            Ok(false) => {
                return Err(ForgeError::ConstraintViolation(format!(
                    "stage row {} left queued before start",
                    exec.id
                )));
            }
            Err(err) => {
                // Another stage of this job is running.
                self.store.transition_stage(
                    &exec.id,
                    StageStatus::Queued,
                    StageStatus::Failed,
                    Some(&err.to_string()),
                    self.clock.now(),
                )?;
                return Err(err);
            }
        }

        let Some(agent) = self.registry.resolve(stage) else {
            let error = format!("no agent registered for stage '{stage}'");
            self.finish(&exec.id, StageStatus::Failed, Some(&error))?;
            return Ok(StageOutcome::Failed {
                error,
                class: FailureClass::Validation,
            });
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            debug!(job_id = %job.id, stage, attempt, "invoking agent");
            let request = AgentRequest {
                job: job.clone(),
                stage: stage.to_string(),
                working_dir: self.working_dir.clone(),
                attempt,
            };
            let result = match tokio::time::timeout(self.timeout, agent.execute(&request)).await {
                Ok(Ok(result)) if result.success => Ok(result),
                Ok(Ok(result)) => Err(reported_failure(result)),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(AgentError::Timeout(format!(
                    "stage '{stage}' exceeded {}s",
                    self.timeout.as_secs()
                ))),
            };

            if self.store.get_job(&job.id)?.status == JobStatus::Cancelled {
                info!(job_id = %job.id, stage, "job cancelled during stage; result discarded");
                self.finish(&exec.id, StageStatus::Failed, Some(DISCARDED))?;
                return Ok(StageOutcome::Discarded);
            }

            match result {
                Ok(result) => {
                    self.finish(&exec.id, StageStatus::Completed, None)?;
                    return Ok(StageOutcome::Completed {
                        output: result.output,
                        artifacts: result.artifacts,
                        plan: result.plan,
                    });
                }
                Err(err) => {
                    let class = err.class();
                    let error = err.to_string();
                    if class.is_retryable() && attempt < max_attempts {
                        let delay = self.retry.delay_for_attempt(attempt);
                        warn!(
                            job_id = %job.id,
                            stage,
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "stage attempt failed; retrying"
                        );
                        self.store
                            .record_stage_retry(&exec.id, attempt, &error, self.clock.now())?;
                        self.sleeper.sleep(delay).await;
                        self.store.touch_job(&job.id, self.clock.now())?;
                        attempt += 1;
                        continue;
                    }
                    warn!(job_id = %job.id, stage, attempt, class = %class, error = %error, "stage failed");
                    self.finish(&exec.id, StageStatus::Failed, Some(&error))?;
                    return Ok(StageOutcome::Failed { error, class });
                }
            }
        }
    }

    fn finish(&self, exec_id: &str, next: StageStatus, error: Option<&str>) -> Result<()> {
        if !self
            .store
            .transition_stage(exec_id, StageStatus::Running, next, error, self.clock.now())?
        {
            warn!(stage_id = exec_id, to = %next, "stage row moved before it could be finished");
        }
        Ok(())
    }
}

fn reported_failure(result: AgentResult) -> AgentError {
    let message = if result.output.trim().is_empty() {
        "agent reported failure".to_string()
    } else {
        result.output
    };
    AgentError::from_class(
        result.failure_class.unwrap_or(FailureClass::AgentExecution),
        message,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedAgent;
    use crate::clock::{RecordingSleeper, SystemClock};
    use crate::state_machine::NewJob;
    use chrono::Utc;

    struct Fixture {
        store: JobStore,
        job: Job,
        sleeper: Arc<RecordingSleeper>,
    }

    fn fixture() -> Fixture {
        let store = JobStore::in_memory().unwrap();
        let job = store.create_job(&NewJob::new("feature", "x"), Utc::now()).unwrap();
        store
            .transition_job(&job.id, JobStatus::Running, Utc::now())
            .unwrap();
        Fixture {
            store,
            job,
            sleeper: Arc::new(RecordingSleeper::default()),
        }
    }

    fn invoker(fx: &Fixture, agent: Arc<ScriptedAgent>, timeout: Duration) -> AgentInvoker {
        AgentInvoker::new(
            fx.store.clone(),
            AgentRegistry::with_default(agent),
            RetryConfig {
                max_attempts: 3,
                base_delay_ms: 100,
                delays_ms: None,
            },
            timeout,
            PathBuf::from("."),
            Arc::new(SystemClock),
            fx.sleeper.clone(),
        )
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let fx = fixture();
        let agent = Arc::new(ScriptedAgent::new(vec![]));
        let outcome = invoker(&fx, agent, Duration::from_secs(5))
            .invoke(&fx.job, "plan", 0)
            .await
            .unwrap();
        assert!(outcome.is_success());

        let stages = fx.store.stages_of(&fx.job.id).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].status, StageStatus::Completed);
        assert_eq!(stages[0].retry_count, 0);
        assert!(fx.sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn exhaustion_keeps_last_attempt_error() {
        let fx = fixture();
        let agent = Arc::new(ScriptedAgent::new(vec![
            Err(AgentError::Execution("compile error #1".into())),
            Err(AgentError::Execution("compile error #2".into())),
            Err(AgentError::Execution("compile error #3".into())),
        ]));
        let outcome = invoker(&fx, agent.clone(), Duration::from_secs(5))
            .invoke(&fx.job, "code", 1)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StageOutcome::Failed {
                error: "agent execution failed: compile error #3".into(),
                class: FailureClass::AgentExecution,
            }
        );
        let stage = &fx.store.stages_of(&fx.job.id).unwrap()[0];
        assert_eq!(stage.status, StageStatus::Failed);
        assert_eq!(stage.retry_count, 2);
        assert_eq!(
            stage.error.as_deref(),
            Some("agent execution failed: compile error #3")
        );
        assert_eq!(
            fx.sleeper.calls(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        let attempts: Vec<u32> = agent.calls().iter().map(|c| c.2).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn validation_failure_is_not_retried() {
        let fx = fixture();
        let agent = Arc::new(ScriptedAgent::new(vec![Ok(AgentResult::failed(
            FailureClass::Validation,
            "input rejected",
        ))]));
        let outcome = invoker(&fx, agent.clone(), Duration::from_secs(5))
            .invoke(&fx.job, "review", 3)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            StageOutcome::Failed {
                class: FailureClass::Validation,
                ..
            }
        ));
        assert_eq!(agent.calls().len(), 1);
        assert!(fx.sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn infrastructure_failure_surfaces_immediately() {
        let fx = fixture();
        let agent = Arc::new(ScriptedAgent::new(vec![Err(AgentError::Infrastructure(
            "503".into(),
        ))]));
        let outcome = invoker(&fx, agent.clone(), Duration::from_secs(5))
            .invoke(&fx.job, "plan", 0)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            StageOutcome::Failed {
                class: FailureClass::ExternalInfrastructure,
                ..
            }
        ));
        assert_eq!(agent.calls().len(), 1);
    }

    #[tokio::test]
    async fn retry_then_success_completes_the_row() {
        let fx = fixture();
        let agent = Arc::new(ScriptedAgent::new(vec![Err(AgentError::Execution(
            "flaky".into(),
        ))]));
        let outcome = invoker(&fx, agent, Duration::from_secs(5))
            .invoke(&fx.job, "test", 2)
            .await
            .unwrap();
        assert!(outcome.is_success());
        let stage = &fx.store.stages_of(&fx.job.id).unwrap()[0];
        assert_eq!(stage.status, StageStatus::Completed);
        assert_eq!(stage.retry_count, 1);
    }

    #[tokio::test]
    async fn slow_agent_times_out_on_every_attempt() {
        let fx = fixture();
        let agent = Arc::new(ScriptedAgent::slow(Duration::from_millis(200)));
        let outcome = invoker(&fx, agent.clone(), Duration::from_millis(20))
            .invoke(&fx.job, "code", 1)
            .await
            .unwrap();
        match outcome {
            StageOutcome::Failed { class, error } => {
                assert_eq!(class, FailureClass::Timeout);
                assert!(error.contains("exceeded"));
            }
            other => panic!("expected timeout failure, got {other:?}"),
        }
        assert_eq!(agent.calls().len(), 3);
    }

    #[tokio::test]
    async fn result_after_cancellation_is_discarded() {
        let fx = fixture();
        fx.store
            .transition_job(&fx.job.id, JobStatus::Cancelled, Utc::now())
            .unwrap();
        let agent = Arc::new(ScriptedAgent::new(vec![]));
        let outcome = invoker(&fx, agent, Duration::from_secs(5))
            .invoke(&fx.job, "plan", 0)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Discarded);
        let stage = &fx.store.stages_of(&fx.job.id).unwrap()[0];
        assert_eq!(stage.status, StageStatus::Failed);
        assert_eq!(stage.error.as_deref(), Some(DISCARDED));
    }

    #[tokio::test]
    async fn missing_agent_fails_the_stage() {
        let fx = fixture();
        let invoker = AgentInvoker::new(
            fx.store.clone(),
            AgentRegistry::new(),
            RetryConfig::default(),
            Duration::from_secs(5),
            PathBuf::from("."),
            Arc::new(SystemClock),
            fx.sleeper.clone(),
        );
        let outcome = invoker.invoke(&fx.job, "plan", 0).await.unwrap();
        assert!(matches!(
            outcome,
            StageOutcome::Failed {
                class: FailureClass::Validation,
                ..
            }
        ));
    }
}
