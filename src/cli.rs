//! Interface de linha de comando do jobforge baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (create, run, status,
//! queue, pause, resume, cancel, autofix, stale) e flags globais
//! (--max-retries, --verbose).

use clap::{Parser, Subcommand};

/// jobforge — orquestrador de jobs em estágios com filas de sub-jobs e auto-reparo.
#[derive(Debug, Parser)]
#[command(name = "jobforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Número máximo de tentativas por estágio (sobrescreve a configuração).
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cria um job pendente e imprime seu id.
    Create {
        /// Tipo do job (feature, bug_fix, refactor, test, documentation, new_module).
        job_type: String,

        /// Descrição do job (o que construir/corrigir/refatorar).
        description: String,

        /// Caminho ou módulo alvo do job.
        #[arg(long, default_value = "")]
        target: String,

        /// Não executa automaticamente os sub-jobs de uma decomposição.
        #[arg(long, default_value_t = false)]
        no_children: bool,

        /// Executa o job logo após criá-lo.
        #[arg(long, default_value_t = false)]
        run: bool,
    },

    /// Executa (ou continua) um job existente.
    Run {
        /// Id do job.
        job_id: String,
    },

    /// Mostra o registro de auditoria de um job, ou lista os jobs raiz.
    Status {
        /// Id do job; sem ele, lista os jobs mais recentes.
        job_id: Option<String>,
    },

    /// Mostra a fila de sub-jobs de um job decomposto.
    Queue {
        /// Id do job pai.
        job_id: String,
    },

    /// Pausa um job pendente ou em execução.
    Pause {
        /// Id do job.
        job_id: String,

        /// Motivo registrado junto com a pausa.
        #[arg(long, default_value = "paused by operator")]
        reason: String,
    },

    /// Retoma um job pausado.
    Resume {
        /// Id do job.
        job_id: String,
    },

    /// Cancela um job e os sub-jobs ainda não concluídos.
    Cancel {
        /// Id do job.
        job_id: String,
    },

    /// Dispara manualmente uma tentativa de auto-reparo para um job falho.
    Autofix {
        /// Id do job falho.
        job_id: String,
    },

    /// Lista jobs em execução sem atualização recente.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_create_subcommand() {
        let cli = Cli::parse_from([
            "jobforge",
            "create",
            "feature",
            "implement hero section",
            "--target",
            "src/hero.rs",
            "--no-children",
        ]);
        match cli.command {
            Command::Create {
                job_type,
                description,
                target,
                no_children,
                run,
            } => {
                assert_eq!(job_type, "feature");
                assert_eq!(description, "implement hero section");
                assert_eq!(target, "src/hero.rs");
                assert!(no_children);
                assert!(!run);
            }
            _ => panic!("expected Create command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["jobforge", "--max-retries", "5", "--verbose", "run", "abc"]);
        assert!(cli.verbose);
        assert_eq!(cli.max_retries, Some(5));
        assert!(matches!(cli.command, Command::Run { job_id } if job_id == "abc"));
    }

    #[test]
    fn cli_pause_has_default_reason() {
        let cli = Cli::parse_from(["jobforge", "pause", "abc"]);
        match cli.command {
            Command::Pause { job_id, reason } => {
                assert_eq!(job_id, "abc");
                assert_eq!(reason, "paused by operator");
            }
            _ => panic!("expected Pause command"),
        }
    }

    #[test]
    fn cli_status_job_is_optional() {
        let cli = Cli::parse_from(["jobforge", "status"]);
        assert!(matches!(cli.command, Command::Status { job_id: None }));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
