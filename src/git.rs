//! Integração com Git via libgit2 para o laço de auto-reparo e checkpoints.
//!
//! O trait [`VersionControl`] descreve os efeitos colaterais nomeados
//! usados pelo orquestrador (diff, aplicar patch, commit, push, rebuild).
//! O [`GitManager`] o implementa sobre um repositório local.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard};

use git2::{ApplyLocation, Diff, DiffFormat, DiffOptions, IndexAddOption, Repository, Signature};
use tracing::{debug, info};

use crate::config::CONFIG_FILE;
use crate::error::{ForgeError, Result};

// Arquivos auxiliares que o SQLite cria ao lado do banco.
const SQLITE_SIDECARS: [&str; 3] = ["-journal", "-wal", "-shm"];

/// Primitivas de controle de versão invocadas pelo orquestrador.
pub trait VersionControl: Send + Sync {
    /// Alterações do diretório de trabalho em relação ao HEAD, em formato patch.
    fn diff(&self) -> Result<String>;

    /// Aplica um patch unificado ao diretório de trabalho.
    fn apply_patch(&self, patch: &str) -> Result<()>;

    /// Faz commit de todas as alterações e retorna o marcador de checkpoint.
    fn commit(&self, message: &str) -> Result<String>;

    /// Envia a branch atual para `origin`.
    fn push(&self) -> Result<()>;

    /// Executa o comando de rebuild configurado, se houver.
    fn rebuild(&self) -> Result<()>;
}

/// Gerenciador de operações Git usando a biblioteca libgit2.
pub struct GitManager {
    repo: Mutex<Repository>,
    workdir: PathBuf,
    rebuild_command: Option<Vec<String>>,
    excluded: Vec<String>,
}

impl GitManager {
    /// Abre um repositório git existente no caminho fornecido.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)?;
        let workdir = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| ForgeError::Validation("bare repositories are not supported".into()))?;
        let git = Self {
            repo: Mutex::new(repo),
            workdir,
            rebuild_command: None,
            excluded: vec![CONFIG_FILE.to_string()],
        };
        Ok(git.with_database_file(Path::new("jobforge.db")))
    }

    /// Exclui dos commits o banco de jobs indicado e seus arquivos de journal/WAL.
    pub fn with_database_file(mut self, database: &Path) -> Self {
        if let Some(name) = database.file_name().and_then(|n| n.to_str()) {
            self.excluded.push(name.to_string());
            self.excluded
                .extend(SQLITE_SIDECARS.iter().map(|suffix| format!("{name}{suffix}")));
        }
        self
    }

    // Configuração, segredos e o banco de jobs nunca entram em commits automáticos.
    fn is_excluded(&self, name: &str) -> bool {
        name.starts_with(".env")
            || name.ends_with(".key")
            || self.excluded.iter().any(|e| e == name)
    }

    /// Define o comando de rebuild (programa seguido de argumentos).
    pub fn with_rebuild_command(mut self, command: Option<Vec<String>>) -> Self {
        self.rebuild_command = command.filter(|c| !c.is_empty());
        self
    }

    fn repo(&self) -> Result<MutexGuard<'_, Repository>> {
        self.repo.lock().map_err(|_| ForgeError::LockPoisoned)
    }

    /// Retorna o nome da branch atual.
    pub fn current_branch(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        head.shorthand()
            .map(str::to_string)
            .ok_or_else(|| ForgeError::Validation("branch name is not valid UTF-8".into()))
    }
}

impl VersionControl for GitManager {
    fn diff(&self) -> Result<String> {
        let repo = self.repo()?;
        let head_tree = match repo.head() {
            Ok(head) => Some(head.peel_to_tree()?),
            Err(_) => None,
        };
        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        let diff = repo.diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))?;

        let mut text = String::new();
        diff.print(DiffFormat::Patch, |_, _, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                text.push(line.origin());
            }
            text.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;
        Ok(text)
    }

    fn apply_patch(&self, patch: &str) -> Result<()> {
        let diff = Diff::from_buffer(patch.as_bytes())?;
        let repo = self.repo()?;
        repo.apply(&diff, ApplyLocation::WorkDir, None)?;
        debug!(files = diff.deltas().len(), "patch applied");
        Ok(())
    }

    /// Adiciona todas as alterações ao stage e cria um commit, retornando o hash curto.
    ///
    /// Arquivos sensíveis e o banco de jobs são excluídos do staging. Sem
    /// alterações em relação ao HEAD, nenhum commit é criado e o hash do HEAD
    /// é retornado.
    fn commit(&self, message: &str) -> Result<String> {
        let repo = self.repo()?;
        let mut index = repo.index()?;
        index.add_all(
            ["*"].iter(),
            IndexAddOption::DEFAULT,
            Some(&mut |path: &Path, _: &[u8]| -> i32 {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if self.is_excluded(name) {
                    1 // pular
                } else {
                    0 // adicionar
                }
            }),
        )?;
        index.write()?;

        let tree_oid = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        if let Some(head) = &parent
            && head.tree_id() == tree_oid
        {
            let short = head.id().to_string()[..7].to_string();
            debug!(checkpoint = %short, "nothing to commit");
            return Ok(short);
        }

        let tree = repo.find_tree(tree_oid)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("jobforge", "jobforge@localhost"))?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

        let short = oid.to_string()[..7].to_string();
        info!(checkpoint = %short, "committed");
        Ok(short)
    }

    fn push(&self) -> Result<()> {
        let branch = self.current_branch()?;
        let repo = self.repo()?;
        let mut remote = repo.find_remote("origin")?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote.push(&[refspec.as_str()], None)?;
        info!(branch = %branch, "pushed to origin");
        Ok(())
    }

    fn rebuild(&self) -> Result<()> {
        let Some((program, args)) = self.rebuild_command.as_ref().and_then(|c| c.split_first())
        else {
            debug!("no rebuild command configured");
            return Ok(());
        };
        let status = Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .status()?;
        if !status.success() {
            return Err(ForgeError::Io(std::io::Error::other(format!(
                "rebuild command '{program}' exited with {status}"
            ))));
        }
        Ok(())
    }
}
