//! Configuração do jobforge carregada a partir de `jobforge.toml`.
//!
//! A struct [`ForgeConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `ANTHROPIC_API_KEY` e `JOBFORGE_DB` têm
//! precedência sobre o arquivo.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{FailureClass, ForgeError, Result};

pub const CONFIG_FILE: &str = "jobforge.toml";

/// Configuração de nível superior carregada de `jobforge.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ForgeConfig {
    /// Chave da API Anthropic. Vazia ativa o agente de simulação.
    #[serde(default)]
    pub api_key: String,

    /// Modelo usado pelos agentes de estágio e de remediação.
    #[serde(default = "default_model")]
    pub model: String,

    /// Caminho do banco SQLite com jobs, estágios, fila e remediações.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Diretório de trabalho compartilhado pela hierarquia de jobs.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub stages: StageConfig,

    #[serde(default)]
    pub decomposition: DecompositionConfig,

    #[serde(default)]
    pub auto_fix: AutoFixConfig,
}

/// Política de retentativa de um estágio.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    /// Número total de tentativas por estágio (inclui a primeira).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Tabela explícita de atrasos; substitui o backoff exponencial quando presente.
    #[serde(default)]
    pub delays_ms: Option<Vec<u64>>,
}

/// Parâmetros de execução de estágios.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageConfig {
    /// Tempo máximo de parede de uma invocação de agente.
    #[serde(default = "default_stage_timeout_secs")]
    pub timeout_secs: u64,

    /// Idade sem atualização a partir da qual um job `running` é considerado parado.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Sequências extras ou substitutas: tipo de job -> lista de estágios.
    #[serde(default)]
    pub sequences: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecompositionConfig {
    /// Profundidade a partir da qual planos de decomposição são ignorados.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

/// Parâmetros do laço de auto-reparo.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AutoFixConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Tipos de job elegíveis para auto-reparo.
    #[serde(default = "default_allowed_job_types")]
    pub allowed_job_types: Vec<String>,

    /// Classes de falha que nunca disparam auto-reparo.
    #[serde(default = "default_denied_failure_classes")]
    pub denied_failure_classes: Vec<FailureClass>,

    /// Tentativas máximas por job.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Intervalo mínimo entre duas tentativas para o mesmo job.
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,

    /// Inicia automaticamente o job substituto criado por uma correção.
    #[serde(default = "default_true")]
    pub run_replacement: bool,

    /// Faz push para `origin` após o commit da correção.
    #[serde(default)]
    pub push: bool,

    /// Comando de rebuild executado no workspace após a correção.
    #[serde(default)]
    pub rebuild_command: Option<Vec<String>>,
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("jobforge.db")
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

// Valor padrão para tentativas máximas: 3.
fn default_max_attempts() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_stage_timeout_secs() -> u64 {
    600
}

fn default_stale_after_secs() -> u64 {
    1800
}

fn default_max_depth() -> u32 {
    2
}

fn default_allowed_job_types() -> Vec<String> {
    ["feature", "new_module", "bug_fix", "refactor", "test"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_denied_failure_classes() -> Vec<FailureClass> {
    vec![FailureClass::ExternalInfrastructure]
}

fn default_cooldown_minutes() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            delays_ms: None,
        }
    }
}

impl RetryConfig {
    /// Atraso antes da tentativa seguinte a `attempt` (1-based).
    ///
    /// Sem tabela explícita: `base_delay_ms * 2^(attempt - 1)`. Com tabela,
    /// o último valor se repete quando as tentativas excedem a tabela.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let ms = match &self.delays_ms {
            Some(table) if !table.is_empty() => table[index.min(table.len() - 1)],
            _ => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1))),
        };
        Duration::from_millis(ms)
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_stage_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            sequences: HashMap::new(),
        }
    }
}

impl StageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

impl Default for AutoFixConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_job_types: default_allowed_job_types(),
            denied_failure_classes: default_denied_failure_classes(),
            max_attempts: default_max_attempts(),
            cooldown_minutes: default_cooldown_minutes(),
            run_replacement: true,
            push: false,
            rebuild_command: None,
        }
    }
}

impl AutoFixConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes as i64)
    }
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            database_path: default_database_path(),
            workspace: default_workspace(),
            retry: RetryConfig::default(),
            stages: StageConfig::default(),
            decomposition: DecompositionConfig::default(),
            auto_fix: AutoFixConfig::default(),
        }
    }
}

impl ForgeConfig {
    /// Carrega a configuração de `jobforge.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<ForgeConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo de configuração.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }
        if let Ok(db) = std::env::var("JOBFORGE_DB")
            && !db.is_empty()
        {
            config.database_path = PathBuf::from(db);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(ForgeError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.stages.timeout_secs == 0 {
            return Err(ForgeError::Config("stages.timeout_secs must be positive".into()));
        }
        if let Some((job_type, _)) = self.stages.sequences.iter().find(|(_, s)| s.is_empty()) {
            return Err(ForgeError::Config(format!(
                "stage sequence for '{job_type}' is empty"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ForgeConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.stages.timeout_secs, 600);
        assert_eq!(config.auto_fix.max_attempts, 3);
        assert_eq!(config.auto_fix.cooldown_minutes, 30);
        assert!(!config.auto_fix.enabled);
        assert_eq!(
            config.auto_fix.denied_failure_classes,
            vec![FailureClass::ExternalInfrastructure]
        );
        assert!(config.api_key.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            api_key = "sk-test-123"

            [retry]
            max_attempts = 5

            [stages.sequences]
            migration = ["plan", "code", "test"]

            [auto_fix]
            enabled = true
            cooldown_minutes = 10
            denied_failure_classes = ["external_infrastructure", "validation"]
        "#;
        let config: ForgeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api_key, "sk-test-123");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.stages.sequences["migration"].len(), 3);
        assert!(config.auto_fix.enabled);
        assert_eq!(config.auto_fix.cooldown_minutes, 10);
        assert_eq!(config.auto_fix.denied_failure_classes.len(), 2);
        assert_eq!(config.auto_fix.max_attempts, 3);
    }

    #[test]
    fn exponential_backoff_delays() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn explicit_delay_table_repeats_last_entry() {
        let retry = RetryConfig {
            delays_ms: Some(vec![10, 50]),
            ..Default::default()
        };
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(50));
        assert_eq!(retry.delay_for_attempt(7), Duration::from_millis(50));
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ForgeConfig::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn zero_attempts_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[retry]\nmax_attempts = 0\n").unwrap();
        assert!(matches!(
            ForgeConfig::load_from(&path),
            Err(ForgeError::Config(_))
        ));
    }
}
