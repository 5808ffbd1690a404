//! Agente de estágio que conversa com a API de mensagens da Anthropic.
//!
//! O modelo recebe a descrição do job e o nome do estágio e deve responder
//! com um veredito JSON. Respostas que não podem ser interpretadas contam
//! como falha de execução (retentável).

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{AgentRequest, AgentResult, StageAgent};
use crate::anthropic::{MessageSender, MessagesRequest, extract_json_object};
use crate::error::{AgentError, FailureClass};
use crate::state_machine::DecompositionPlan;

const MAX_TOKENS: u32 = 4096;

const VERDICT_FORMAT: &str = r#"Reply with a single JSON object and nothing else:
{"success": true|false, "summary": "<what you did>", "artifacts": ["<path or ref>"],
 "failure_class": null|"validation"|"agent_execution", "plan": null|{"subtasks": [
   {"title": "...", "description": "...", "job_type": null, "depends_on": [<index>]}]}}
Only return a plan when the task is too large for one pass."#;

/// Veredito devolvido pelo modelo.
#[derive(Debug, Deserialize)]
struct Verdict {
    success: bool,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default)]
    failure_class: Option<FailureClass>,
    #[serde(default)]
    plan: Option<DecompositionPlan>,
}

pub struct ClaudeAgent<S: MessageSender> {
    sender: S,
    model: String,
}

impl<S: MessageSender> ClaudeAgent<S> {
    pub fn new(sender: S, model: impl Into<String>) -> Self {
        Self {
            sender,
            model: model.into(),
        }
    }
}

/// Instrução de sistema por estágio.
fn stage_role(stage: &str) -> &'static str {
    match stage {
        "scaffold" => "You lay out the skeleton of a new module: files, types and empty functions.",
        "plan" => "You write an implementation plan and decide whether the task must be split.",
        "code" => "You implement the planned change in the working tree.",
        "test" => "You write and run tests for the change.",
        "review" => "You review the change for defects and report whether it is acceptable.",
        "document" => "You update documentation for the change.",
        _ => "You are a software engineering agent executing one pipeline stage.",
    }
}

fn build_prompt(request: &AgentRequest) -> String {
    let job = &request.job;
    let mut prompt = format!(
        "Stage: {}\nJob type: {}\nWorking directory: {}\n",
        request.stage,
        job.job_type,
        request.working_dir.display()
    );
    if !job.target.is_empty() {
        prompt.push_str(&format!("Target: {}\n", job.target));
    }
    if let Some(checkpoint) = &job.checkpoint {
        prompt.push_str(&format!("Last checkpoint: {checkpoint}\n"));
    }
    prompt.push_str(&format!("\nTask:\n{}\n\n{VERDICT_FORMAT}", job.description));
    prompt
}

fn parse_verdict(text: &str) -> Result<Verdict, AgentError> {
    let body = extract_json_object(text).ok_or_else(|| {
        AgentError::Execution("model reply contained no JSON verdict".to_string())
    })?;
    serde_json::from_str(body)
        .map_err(|e| AgentError::Execution(format!("unparseable verdict: {e}")))
}

#[async_trait]
impl<S: MessageSender> StageAgent for ClaudeAgent<S> {
    async fn execute(&self, request: &AgentRequest) -> Result<AgentResult, AgentError> {
        let req = MessagesRequest::single(
            &self.model,
            MAX_TOKENS,
            stage_role(&request.stage),
            build_prompt(request),
        );
        let response = self.sender.send_message(&req).await?;
        let verdict = parse_verdict(&response.text())?;
        debug!(
            job_id = %request.job.id,
            stage = %request.stage,
            success = verdict.success,
            "agent verdict"
        );

        let failure_class = if verdict.success {
            None
        } else {
            Some(verdict.failure_class.unwrap_or(FailureClass::AgentExecution))
        };
        Ok(AgentResult {
            success: verdict.success,
            output: verdict.summary,
            artifacts: verdict.artifacts,
            failure_class,
            plan: verdict.plan.filter(|p| !p.is_empty()),
        })
    }
}
