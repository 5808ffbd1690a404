mod cli;
mod ui;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cli::{Cli, Command};
use jobforge::agent::{AgentRegistry, ClaudeAgent, DryRunAgent};
use jobforge::anthropic::AnthropicClient;
use jobforge::git::{GitManager, VersionControl};
use jobforge::repair::ClaudeRemediator;
use jobforge::state_machine::{Job, NewJob};
use jobforge::{ForgeConfig, JobStore, Orchestrator};
use ui::JobProgress;

fn init_tracing(verbose: bool) {
    let default = if verbose { "jobforge=debug" } else { "jobforge=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn build_orchestrator(config: ForgeConfig) -> anyhow::Result<Orchestrator> {
    let store = JobStore::open(&config.database_path)
        .with_context(|| format!("opening job store {}", config.database_path.display()))?;

    let request_timeout = config.stages.timeout() + Duration::from_secs(30);
    let (registry, remediator) = if config.api_key.is_empty() {
        warn!("no API key configured, stages run as dry runs and auto-repair is off");
        (AgentRegistry::with_default(Arc::new(DryRunAgent)), None)
    } else {
        let agent_client = AnthropicClient::new(config.api_key.clone(), request_timeout)?;
        let repair_client = AnthropicClient::new(config.api_key.clone(), request_timeout)?;
        (
            AgentRegistry::with_default(Arc::new(ClaudeAgent::new(agent_client, &config.model))),
            Some(ClaudeRemediator::new(repair_client, &config.model)),
        )
    };

    let vcs = match GitManager::open(&config.workspace) {
        Ok(git) => Some(
            git.with_rebuild_command(config.auto_fix.rebuild_command.clone())
                .with_database_file(&config.database_path),
        ),
        Err(err) => {
            warn!(workspace = %config.workspace.display(), error = %err, "no git repository, checkpoints use stage names");
            None
        }
    };

    let mut builder = Orchestrator::builder(store, config, registry);
    if let Some(remediator) = remediator {
        builder = builder.remediator(Arc::new(remediator));
    }
    if let Some(vcs) = vcs {
        builder = builder.version_control(Arc::new(vcs) as Arc<dyn VersionControl>);
    }
    Ok(builder.build())
}

async fn report(
    label: &str,
    job_id: &str,
    run: impl Future<Output = jobforge::Result<Job>>,
) -> anyhow::Result<()> {
    let progress = JobProgress::start(label, job_id);
    match run.await {
        Ok(job) => {
            progress.complete(&job);
            Ok(())
        }
        Err(err) => {
            progress.abandon();
            Err(err.into())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = ForgeConfig::load().context("loading configuration")?;
    if let Some(max) = cli.max_retries {
        config.retry.max_attempts = max;
        config.validate()?;
    }
    let orchestrator = build_orchestrator(config)?;

    match cli.command {
        Command::Create {
            job_type,
            description,
            target,
            no_children,
            run,
        } => {
            let job = orchestrator.create_job(
                NewJob::new(job_type.as_str(), description)
                    .target(target)
                    .auto_execute_children(!no_children),
            )?;
            info!(job = %job.id, "job created");
            println!("{}", job.id);
            if run {
                report("RUN", &job.id, orchestrator.run_job(&job.id)).await?;
            }
        }
        Command::Run { job_id } => {
            report("RUN", &job_id, orchestrator.run_job(&job_id)).await?;
        }
        Command::Status { job_id: Some(job_id) } => {
            ui::print_audit(&orchestrator.audit(&job_id)?);
        }
        Command::Status { job_id: None } => {
            ui::print_jobs(&orchestrator.store().list_root_jobs(20)?);
        }
        Command::Queue { job_id } => {
            let status = orchestrator.queue_status(&job_id)?;
            let entries = orchestrator.store().queue_entries(&job_id)?;
            ui::print_queue(&status, &entries);
        }
        Command::Pause { job_id, reason } => {
            let job = orchestrator.pause(&job_id, &reason)?;
            println!("{} paused ({})", job.id, job.status);
        }
        Command::Resume { job_id } => {
            report("RESUME", &job_id, orchestrator.resume(&job_id)).await?;
        }
        Command::Cancel { job_id } => {
            let job = orchestrator.cancel(&job_id).await?;
            println!("{} {}", job.id, job.status);
        }
        Command::Autofix { job_id } => {
            let attempt = orchestrator.trigger_auto_fix(&job_id).await?;
            ui::print_remediation(attempt.as_ref());
        }
        Command::Stale => {
            ui::print_jobs(&orchestrator.stale_jobs()?);
        }
    }
    Ok(())
}
