//! Interface de terminal do jobforge — spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! a execução de um job no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use jobforge::state_machine::{
    AuditRecord, Job, JobStatus, QueueStatus, RemediationAttempt, SubJobQueueEntry,
};

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Completed => Style::new().green().bold(),
        JobStatus::CompletedWithWarnings => Style::new().yellow().bold(),
        JobStatus::Failed | JobStatus::Cancelled => Style::new().red().bold(),
        _ => Style::new().cyan(),
    }
}

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// Exibe um spinner animado durante o processamento e o status final
/// colorido: verde (concluído), amarelo (com avisos ou pausado), vermelho (falha).
pub struct JobProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
}

impl JobProgress {
    /// Inicia o spinner com um rótulo e o id do job.
    pub fn start(label: &str, job_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("{label}: {job_id}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { pb }
    }

    /// Finaliza o spinner e exibe o status final do job.
    pub fn complete(&self, job: &Job) {
        self.pb.finish_and_clear();
        let style = status_style(job.status);
        let mark = match job.status {
            JobStatus::Completed => "✓",
            JobStatus::Failed | JobStatus::Cancelled => "✗",
            _ => "•",
        };
        println!(
            "  {} Job {} is {}",
            style.apply_to(mark),
            job.id,
            style.apply_to(job.status)
        );
        if job.paused
            && let Some(reason) = &job.pause_reason
        {
            println!("    paused: {reason}");
        }
        if let Some(err) = &job.last_error {
            println!("    {}", Style::new().dim().apply_to(err));
        }
    }

    /// Interrompe o spinner sem imprimir resultado (usado em erros).
    pub fn abandon(&self) {
        self.pb.finish_and_clear();
    }
}

/// Imprime o registro de auditoria formatado em JSON com estilo colorido.
pub fn print_audit(record: &AuditRecord) {
    println!();
    println!("{}", status_style(record.status).apply_to("─── Audit Record ───"));
    println!("{}", serde_json::to_string_pretty(record).unwrap_or_default());
}

/// Lista jobs em uma linha cada: id, tipo, status e descrição.
pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs.");
        return;
    }
    for job in jobs {
        println!(
            "{}  {:<14} {:<24} {}",
            job.id,
            job.job_type,
            status_style(job.status).apply_to(job.status),
            job.description
        );
    }
}

/// Imprime as contagens da fila e cada entrada na ordem de execução.
pub fn print_queue(status: &QueueStatus, entries: &[SubJobQueueEntry]) {
    println!(
        "pending {}  in_progress {}  completed {}  failed {}  skipped {}  (total {})",
        status.pending,
        status.in_progress,
        status.completed,
        status.failed,
        status.skipped,
        status.total()
    );
    for entry in entries {
        let deps = if entry.depends_on.is_empty() {
            String::new()
        } else {
            format!(
                " after [{}]",
                entry.depends_on.iter().cloned().collect::<Vec<_>>().join(", ")
            )
        };
        println!(
            "  #{} {} {}{deps}",
            entry.execution_order, entry.child_id, entry.status
        );
    }
}

/// Resume o resultado de uma tentativa de auto-reparo.
pub fn print_remediation(attempt: Option<&RemediationAttempt>) {
    let Some(attempt) = attempt else {
        println!(
            "  {} No remediation attempt started (ineligible, capped or cooling down)",
            Style::new().yellow().apply_to("•")
        );
        return;
    };
    println!("  Remediation {} is {}", attempt.id, attempt.status);
    if let Some(cause) = &attempt.root_cause {
        println!("    root cause: {cause}");
    }
    if let Some(new_job) = &attempt.new_job_id {
        println!("    replacement job: {new_job}");
    }
}
