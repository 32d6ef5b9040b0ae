//! Git subprocess client
//!
//! Shells out to the `git` binary so credential helpers, SSH config, and
//! hooks policy behave exactly as they do for operators. Commit uses a
//! three-tier fallback; push is attempted once and bubbles failures up.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Utc;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, warn};

/// Messages git emits when a commit has nothing to record. Matched against
/// stdout and stderr of a failed commit to classify it as a noop.
const NOOP_NEEDLES: [&str; 4] = [
    "nothing to commit",
    "no changes added to commit",
    "nothing added to commit",
    "working tree clean",
];

/// Git operation failures
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to spawn git {args:?}: {source}")]
    Spawn {
        args: Vec<String>,
        source: std::io::Error,
    },

    #[error("git {args:?} failed with status {status}: {stderr}")]
    Command {
        args: Vec<String>,
        status: i32,
        stderr: String,
    },

    #[error("repository has no remote configured")]
    NoRemote,
}

/// Output of a completed git invocation
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    fn mentions_noop(&self) -> bool {
        NOOP_NEEDLES
            .iter()
            .any(|needle| self.stdout.contains(needle) || self.stderr.contains(needle))
    }
}

/// Result of a commit attempt
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// True when there was nothing to record
    pub noop: bool,
    /// HEAD after the attempt
    pub sha: String,
}

/// Async git runner bound to one checkout
#[derive(Debug, Clone)]
pub struct GitClient {
    repo_root: PathBuf,
    /// Where exhausted-commit diagnostics land; `None` disables them
    diagnostics_dir: Option<PathBuf>,
}

impl GitClient {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            diagnostics_dir: None,
        }
    }

    pub fn with_diagnostics_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.diagnostics_dir = dir;
        self
    }

    pub(crate) fn set_diagnostics_dir(&mut self, dir: Option<PathBuf>) {
        self.diagnostics_dir = dir;
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Record the full fallback cascade of a commit that could not land
    fn record_commit_diagnostic(&self, message: &str, paths: &[String], attempts: &[&GitOutput]) {
        let Some(dir) = &self.diagnostics_dir else {
            return;
        };
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let file = dir.join(format!("{stamp}-commit.json"));
        let body = json!({
            "repo": self.repo_root.display().to_string(),
            "message": message,
            "paths": paths,
            "attempts": attempts
                .iter()
                .map(|output| json!({
                    "status": output.status,
                    "stdout": output.stdout,
                    "stderr": output.stderr,
                }))
                .collect::<Vec<_>>(),
            "recorded_at": Utc::now().to_rfc3339(),
        });
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(dir)?;
            std::fs::write(&file, serde_json::to_vec_pretty(&body).unwrap_or_default())
        };
        if let Err(e) = write() {
            warn!(file = %file.display(), "failed to write commit diagnostic: {e}");
        }
    }

    /// Run git with the given args, capturing output without failing on a
    /// nonzero status.
    pub(crate) async fn run_raw(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| GitError::Spawn {
                args: args.iter().map(|s| s.to_string()).collect(),
                source,
            })?;
        Ok(GitOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run git and require success
    pub(crate) async fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let output = self.run_raw(args).await?;
        if !output.success() {
            return Err(GitError::Command {
                args: args.iter().map(|s| s.to_string()).collect(),
                status: output.status,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    pub async fn head_sha(&self) -> Result<String, GitError> {
        let output = self.run(&["rev-parse", "HEAD"]).await?;
        Ok(output.stdout.trim().to_string())
    }

    pub async fn is_clean(&self) -> Result<bool, GitError> {
        let output = self.run(&["status", "--porcelain"]).await?;
        Ok(output.stdout.trim().is_empty())
    }

    pub async fn current_branch(&self) -> Result<String, GitError> {
        let output = self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(output.stdout.trim().to_string())
    }

    pub async fn has_remote(&self) -> Result<bool, GitError> {
        let output = self.run(&["remote"]).await?;
        Ok(!output.stdout.trim().is_empty())
    }

    pub async fn hard_reset(&self) -> Result<(), GitError> {
        self.run(&["reset", "--hard"]).await?;
        Ok(())
    }

    /// Commit exactly `paths` with message `message`, hooks disabled.
    ///
    /// Fallback cascade when the targeted commit fails for reasons other
    /// than "nothing to commit":
    ///
    /// 1. targeted `add` + `commit -- <paths>`
    /// 2. `add --force` + targeted commit
    /// 3. `add -A` + plain commit
    ///
    /// A "nothing to commit" signal at any tier resolves to a noop outcome
    /// carrying the current HEAD. If every tier fails, a diagnostic artifact
    /// records the cascade, the working tree is hard-reset, and the last
    /// error surfaces.
    pub async fn commit_paths(
        &self,
        message: &str,
        paths: &[String],
    ) -> Result<CommitOutcome, GitError> {
        let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();

        let mut add_args = vec!["add", "--"];
        add_args.extend(&path_refs);
        self.run(&add_args).await?;

        let mut commit_args = vec!["commit", "--no-verify", "-m", message, "--"];
        commit_args.extend(&path_refs);
        let first = self.run_raw(&commit_args).await?;
        if first.success() {
            return Ok(CommitOutcome {
                noop: false,
                sha: self.head_sha().await?,
            });
        }
        if first.mentions_noop() {
            return Ok(CommitOutcome {
                noop: true,
                sha: self.head_sha().await?,
            });
        }

        warn!(stderr = %first.stderr.trim(), "targeted commit failed, retrying with forced add");
        let mut force_args = vec!["add", "--force", "--"];
        force_args.extend(&path_refs);
        self.run(&force_args).await?;
        let second = self.run_raw(&commit_args).await?;
        if second.success() {
            return Ok(CommitOutcome {
                noop: false,
                sha: self.head_sha().await?,
            });
        }
        if second.mentions_noop() {
            return Ok(CommitOutcome {
                noop: true,
                sha: self.head_sha().await?,
            });
        }

        warn!(stderr = %second.stderr.trim(), "forced commit failed, retrying with add -A");
        self.run(&["add", "-A"]).await?;
        let third = self
            .run_raw(&["commit", "--no-verify", "-m", message])
            .await?;
        if third.success() {
            return Ok(CommitOutcome {
                noop: false,
                sha: self.head_sha().await?,
            });
        }
        if third.mentions_noop() {
            return Ok(CommitOutcome {
                noop: true,
                sha: self.head_sha().await?,
            });
        }

        // Out of fallbacks: record the cascade, restore the tree, surface
        // the failure.
        self.record_commit_diagnostic(message, paths, &[&first, &second, &third]);
        if let Err(e) = self.hard_reset().await {
            warn!("hard reset after failed commit cascade also failed: {e}");
        }
        Err(GitError::Command {
            args: vec!["commit".to_string()],
            status: third.status,
            stderr: third.stderr,
        })
    }

    /// Push `branch` to origin. Skips (with a log line) when the checkout
    /// has no remote; other failures bubble up without retry.
    pub async fn push(&self, branch: &str) -> Result<bool, GitError> {
        if !self.has_remote().await? {
            debug!(branch, "no remote configured, skipping push");
            return Ok(false);
        }
        self.run(&["push", "origin", branch, "--force"]).await?;
        Ok(true)
    }

    /// Make sure the checkout exists and is on `branch` at the remote tip.
    ///
    /// A failed pull on a clean tree is recovered by fetching and
    /// hard-resetting to `origin/<branch>` (the non-fast-forward case).
    pub async fn ensure_repo(&self, url: &str, branch: &str) -> Result<(), GitError> {
        if !self.repo_root.join(".git").exists() {
            let parent = self
                .repo_root
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf();
            let target = self
                .repo_root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| ".".to_string());
            let output = Command::new("git")
                .args(["clone", "--branch", branch, url, &target])
                .current_dir(&parent)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|source| GitError::Spawn {
                    args: vec!["clone".to_string()],
                    source,
                })?;
            if !output.status.success() {
                return Err(GitError::Command {
                    args: vec!["clone".to_string(), url.to_string()],
                    status: output.status.code().unwrap_or(-1),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            return Ok(());
        }

        self.run(&["checkout", branch]).await?;
        let pull = self.run_raw(&["pull", "origin", branch]).await?;
        if pull.success() {
            return Ok(());
        }

        if self.is_clean().await? {
            warn!(branch, "pull failed on a clean tree, resetting to remote tip");
            self.run(&["fetch", "origin", branch]).await?;
            self.run(&["reset", "--hard", &format!("origin/{branch}")])
                .await?;
            return Ok(());
        }

        Err(GitError::Command {
            args: vec!["pull".to_string(), branch.to_string()],
            status: pull.status,
            stderr: pull.stderr,
        })
    }
}
