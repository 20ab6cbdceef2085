//! [`RepositoryMutator`] backed by the `git` command line.
//!
//! Mirrors live at `<data_path>/repos/<local_id>`. Clones land in a sibling
//! staging directory first and are renamed into place, so a crash mid-clone
//! never leaves a half-populated mirror at the final path.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use super::{MutationError, MutationOutcome, RepositoryMutator};
use crate::job::LATEST_REVISION;
use crate::repository_ref::RepositoryRef;
use crate::telemetry::current_job_id;

/// stderr fragments that mean retrying cannot help
const PERMANENT_MARKERS: &[&str] = &[
    "does not appear to be a git repository",
    "not found",
    "unknown revision",
    "couldn't find remote ref",
    "invalid reference",
    "authentication failed",
];

/// Local mirror of upstream repositories under a data directory.
#[derive(Debug, Clone)]
pub struct GitMirror {
    data_path: PathBuf,
}

impl GitMirror {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
        }
    }

    fn repos_root(&self) -> PathBuf {
        self.data_path.join("repos")
    }

    /// Final on-disk location of a repository mirror.
    pub fn repository_path(&self, repository: &RepositoryRef) -> PathBuf {
        self.repos_root().join(repository.local_id())
    }

    fn staging_path(&self, repository: &RepositoryRef) -> PathBuf {
        self.repos_root()
            .join(format!(".{}.partial", repository.local_id()))
    }

    /// Move the work tree to `revision`. Names are looked up on `origin` first so
    /// a branch resolves to what was just fetched rather than a stale local ref.
    async fn checkout(&self, workdir: &Path, revision: &str) -> Result<String, MutationError> {
        if revision.starts_with('-') {
            return Err(MutationError::permanent(format!(
                "invalid revision '{}'",
                revision
            )));
        }

        let candidates = if revision == LATEST_REVISION {
            vec!["origin/HEAD".to_string()]
        } else {
            vec![format!("origin/{}", revision), revision.to_string()]
        };

        let mut commit = None;
        for candidate in &candidates {
            commit = resolve_commit(workdir, candidate).await?;
            if commit.is_some() {
                break;
            }
        }
        let Some(commit) = commit else {
            return Err(MutationError::permanent(format!(
                "unknown revision '{}'",
                revision
            )));
        };

        run_git(workdir, &["reset", "--quiet", "--hard", &commit]).await?;
        debug!(revision, commit = %commit, "Checked out revision");
        Ok(commit)
    }
}

/// Commit id `name` points at, or `None` when it does not name a commit.
async fn resolve_commit(workdir: &Path, name: &str) -> Result<Option<String>, MutationError> {
    let spec = format!("{}^{{commit}}", name);
    let output = git_command(workdir)
        .args(["rev-parse", "--verify", "--quiet", &spec])
        .output()
        .await
        .map_err(|e| MutationError::transient(format!("failed to spawn git: {}", e)))?;

    if !output.status.success() {
        return Ok(None);
    }
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!commit.is_empty()).then_some(commit))
}

/// Build a git command isolated from system and user configuration.
fn git_command(workdir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(workdir);
    cmd.env("GIT_CONFIG_NOSYSTEM", "1");
    cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.kill_on_drop(true);
    cmd
}

async fn run_git(workdir: &Path, args: &[&str]) -> Result<String, MutationError> {
    debug!(
        job_id = ?current_job_id(),
        workdir = %workdir.display(),
        ?args,
        "Running git"
    );

    let output = git_command(workdir)
        .args(args)
        .output()
        .await
        .map_err(|e| MutationError::transient(format!("failed to spawn git: {}", e)))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(classify_git_failure(args, &stderr))
}

fn classify_git_failure(args: &[&str], stderr: &str) -> MutationError {
    let message = format!("git {} failed: {}", args.join(" "), stderr);
    let lowered = stderr.to_lowercase();

    if PERMANENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        MutationError::permanent(message)
    } else {
        MutationError::transient(message)
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), MutationError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MutationError::transient(format!(
            "failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

fn io_failure(action: &str, path: &Path, err: std::io::Error) -> MutationError {
    MutationError::transient(format!("failed to {} {}: {}", action, path.display(), err))
}

#[async_trait]
impl RepositoryMutator for GitMirror {
    async fn clone_repository(
        &self,
        repository: &RepositoryRef,
        revision: &str,
    ) -> Result<MutationOutcome, MutationError> {
        let root = self.repos_root();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_failure("create", &root, e))?;

        let target = self.repository_path(repository);
        let staging = self.staging_path(repository);

        // leftovers from an interrupted attempt
        remove_dir_if_exists(&staging).await?;
        remove_dir_if_exists(&target).await?;

        let staging_arg = staging.to_string_lossy().to_string();
        run_git(&root, &["clone", "--quiet", "--", repository.uri(), &staging_arg]).await?;

        let head = self.checkout(&staging, revision).await?;

        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| io_failure("move clone into", &target, e))?;

        info!(uri = %repository, revision = %head, "Repository cloned");
        Ok(MutationOutcome { revision: head })
    }

    async fn update_repository(
        &self,
        repository: &RepositoryRef,
        revision: &str,
    ) -> Result<MutationOutcome, MutationError> {
        let target = self.repository_path(repository);
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(MutationError::permanent(format!(
                "no local mirror at {}",
                target.display()
            )));
        }

        run_git(&target, &["fetch", "--quiet", "--prune", "origin"]).await?;
        let head = self.checkout(&target, revision).await?;

        info!(uri = %repository, revision = %head, "Repository updated");
        Ok(MutationOutcome { revision: head })
    }

    async fn delete_repository(&self, repository: &RepositoryRef) -> Result<(), MutationError> {
        remove_dir_if_exists(&self.staging_path(repository)).await?;
        remove_dir_if_exists(&self.repository_path(repository)).await?;

        info!(uri = %repository, "Repository removed");
        Ok(())
    }
}
