//! Stage agents: the capability interface, the stage-name registry, and the
//! invoker that runs one stage with classified retry.

mod claude;
mod invoker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, FailureClass};
use crate::state_machine::{DecompositionPlan, Job};

pub use claude::ClaudeAgent;
pub use invoker::{AgentInvoker, StageOutcome};

/// Input for one agent execution.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub job: Job,
    pub stage: String,
    pub working_dir: PathBuf,
    /// 1-based attempt number within the current stage.
    pub attempt: u32,
}

/// What an agent reports back for a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<DecompositionPlan>,
}

impl AgentResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn with_plan(mut self, plan: DecompositionPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn failed(class: FailureClass, output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            failure_class: Some(class),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait StageAgent: Send + Sync {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentResult, AgentError>;
}

/// Stage name -> agent, resolved once when the orchestrator is built.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    by_stage: HashMap<String, Arc<dyn StageAgent>>,
    fallback: Option<Arc<dyn StageAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that answers every stage with `agent`.
    pub fn with_default(agent: Arc<dyn StageAgent>) -> Self {
        Self {
            by_stage: HashMap::new(),
            fallback: Some(agent),
        }
    }

    pub fn register(mut self, stage: impl Into<String>, agent: Arc<dyn StageAgent>) -> Self {
        self.by_stage.insert(stage.into(), agent);
        self
    }

    pub fn resolve(&self, stage: &str) -> Option<Arc<dyn StageAgent>> {
        self.by_stage
            .get(stage)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// Succeeds every stage without doing any work.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunAgent;

#[async_trait]
impl StageAgent for DryRunAgent {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentResult, AgentError> {
        Ok(AgentResult::ok(format!(
            "dry run: {} for job {}",
            request.stage, request.job.id
        )))
    }
}
