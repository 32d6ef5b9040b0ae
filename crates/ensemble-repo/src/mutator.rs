//! RepoMutator: edit-spec application + commit/push

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::git::{GitClient, GitError};
use crate::hunks::{apply_hunks, HunkError};
use crate::policy::{MutationPolicy, PolicyError};
use crate::spec::{EditSpec, Hunk, Op};

/// Mutation failures
#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("hunks for {path} did not apply: {source}")]
    HunkMismatch {
        path: String,
        #[source]
        source: HunkError,
    },

    #[error("invalid op: {0}")]
    InvalidOp(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Git(#[from] GitError),
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Commit the applied changes with this message. `None` = apply only.
    pub commit_message: Option<String>,
    /// Branch to push after a successful commit
    pub branch: Option<String>,
    /// Attempt a push (skipped with a log line when no remote exists)
    pub push: bool,
    /// Extra deny-listed extensions for this call
    pub blocked_exts: Vec<String>,
}

/// Outcome of one apply
#[derive(Debug, Clone, Default)]
pub struct MutationResult {
    /// Paths whose ops were applied (including byte-identical upserts)
    pub changed: Vec<String>,
    /// True when the commit had nothing to record (or nothing was applied)
    pub noop: bool,
    /// HEAD after the commit attempt, when one was made
    pub sha: Option<String>,
    /// True when a push went out
    pub pushed: bool,
}

/// Applies [`EditSpec`]s to one checkout under the configured policy
pub struct RepoMutator {
    policy: MutationPolicy,
    git: GitClient,
    write_diagnostics: bool,
    diagnostics_dir: PathBuf,
}

impl RepoMutator {
    pub fn new(policy: MutationPolicy) -> Self {
        let diagnostics_dir = PathBuf::from("outputs/diagnostics");
        let git = GitClient::new(&policy.repo_root)
            .with_diagnostics_dir(Some(diagnostics_dir.clone()));
        Self {
            policy,
            git,
            write_diagnostics: true,
            diagnostics_dir,
        }
    }

    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.write_diagnostics = enabled;
        self.sync_git_diagnostics();
        self
    }

    pub fn with_diagnostics_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.diagnostics_dir = dir.into();
        self.sync_git_diagnostics();
        self
    }

    /// Keep the git client's commit diagnostics aligned with the mutator's
    /// own settings.
    fn sync_git_diagnostics(&mut self) {
        let dir = self
            .write_diagnostics
            .then(|| self.diagnostics_dir.clone());
        self.git.set_diagnostics_dir(dir);
    }

    pub fn git(&self) -> &GitClient {
        &self.git
    }

    /// Apply every op, then commit and push per `options`.
    #[instrument(skip(self, spec, options), fields(repo = %self.policy.repo_root.display(), ops = spec.ops.len()))]
    pub async fn apply(
        &self,
        spec: &EditSpec,
        options: &ApplyOptions,
    ) -> Result<MutationResult, MutationError> {
        let mut changed: Vec<String> = Vec::new();

        for op in &spec.ops {
            self.policy.check_workspace()?;
            self.policy.check_global_blocklist(op.path())?;
            self.policy.check_extension(op.path(), &options.blocked_exts)?;
            let resolved = self.policy.resolve_within_root(op.path())?;

            match op {
                Op::Upsert {
                    path,
                    content,
                    hunks,
                } => {
                    let new_content =
                        self.resolve_upsert_content(path, &resolved, content.as_deref(), hunks)?;
                    self.policy.check_size(path, new_content.len())?;

                    let existing = std::fs::read_to_string(&resolved).ok();
                    if existing.as_deref() == Some(new_content.as_str()) {
                        debug!(path, "upsert content identical, leaving file untouched");
                    } else {
                        atomic_write(&resolved, &new_content)?;
                    }
                    changed.push(path.clone());
                }
                Op::Delete { path } => {
                    if resolved.exists() {
                        std::fs::remove_file(&resolved).map_err(|source| MutationError::Io {
                            path: resolved.clone(),
                            source,
                        })?;
                        changed.push(path.clone());
                    } else {
                        warn!(path, "delete op targets a missing file, skipping");
                    }
                }
            }
        }

        let Some(message) = &options.commit_message else {
            return Ok(MutationResult {
                changed,
                noop: false,
                sha: None,
                pushed: false,
            });
        };

        if changed.is_empty() {
            return Ok(MutationResult {
                changed,
                noop: true,
                sha: None,
                pushed: false,
            });
        }

        let outcome = self.git.commit_paths(message, &changed).await?;
        info!(sha = %outcome.sha, noop = outcome.noop, files = changed.len(), "commit finished");

        let mut pushed = false;
        if options.push {
            if let Some(branch) = &options.branch {
                pushed = self.git.push(branch).await?;
            }
        }

        Ok(MutationResult {
            changed,
            noop: outcome.noop,
            sha: Some(outcome.sha),
            pushed,
        })
    }

    /// Content an upsert should end up with: hunks against the current file
    /// when given (falling back to `content` on mismatch), else `content`.
    fn resolve_upsert_content(
        &self,
        path: &str,
        resolved: &Path,
        content: Option<&str>,
        hunks: &Option<Vec<Hunk>>,
    ) -> Result<String, MutationError> {
        match hunks {
            Some(hunks) if !hunks.is_empty() => {
                let current = std::fs::read_to_string(resolved).unwrap_or_default();
                match apply_hunks(&current, hunks) {
                    Ok(applied) => Ok(applied),
                    Err(err) => {
                        self.record_hunk_diagnostic(path, &err, hunks);
                        match content {
                            Some(content) => {
                                warn!(path, "hunks did not apply, falling back to whole content: {err}");
                                Ok(content.to_string())
                            }
                            None => Err(MutationError::HunkMismatch {
                                path: path.to_string(),
                                source: err,
                            }),
                        }
                    }
                }
            }
            _ => content.map(String::from).ok_or_else(|| {
                MutationError::InvalidOp(format!("upsert for {path} has neither content nor hunks"))
            }),
        }
    }

    fn record_hunk_diagnostic(&self, path: &str, err: &HunkError, hunks: &[Hunk]) {
        if !self.write_diagnostics {
            return;
        }
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let safe: String = path
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let file = self.diagnostics_dir.join(format!("{stamp}-{safe}.json"));
        let body = json!({
            "path": path,
            "error": err.to_string(),
            "hunks": hunks,
            "recorded_at": Utc::now().to_rfc3339(),
        });
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.diagnostics_dir)?;
            std::fs::write(&file, serde_json::to_vec_pretty(&body).unwrap_or_default())
        };
        if let Err(e) = write() {
            warn!(path, "failed to write hunk diagnostic: {e}");
        }
    }
}

/// Write through a sibling `.tmp` file and rename into place
fn atomic_write(path: &Path, content: &str) -> Result<(), MutationError> {
    let io_err = |source| MutationError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    std::fs::write(&tmp, content).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Op;

    fn mutator_for(dir: &Path) -> RepoMutator {
        RepoMutator::new(MutationPolicy::new(dir))
            .with_diagnostics_dir(dir.join("outputs").join("diagnostics"))
    }

    fn upsert(path: &str, content: Option<&str>, hunks: Option<Vec<Hunk>>) -> EditSpec {
        EditSpec {
            ops: vec![Op::Upsert {
                path: path.to_string(),
                content: content.map(String::from),
                hunks,
            }],
        }
    }

    #[tokio::test]
    async fn test_apply_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = mutator_for(dir.path())
            .apply(
                &upsert("src/new.rs", Some("fn main() {}\n"), None),
                &ApplyOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.changed, vec!["src/new.rs"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/new.rs")).unwrap(),
            "fn main() {}\n"
        );
    }

    #[tokio::test]
    async fn test_hunk_mismatch_falls_back_to_content_with_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\nc\n").unwrap();

        let hunks = vec![Hunk {
            old_start: 1,
            old_count: 1,
            lines: vec![" z".to_string(), "-b".to_string(), "+B".to_string()],
        }];
        let result = mutator_for(dir.path())
            .apply(
                &upsert("f.txt", Some("fallback\n"), Some(hunks)),
                &ApplyOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.changed, vec!["f.txt"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "fallback\n"
        );
        let diagnostics: Vec<_> =
            std::fs::read_dir(dir.path().join("outputs").join("diagnostics"))
                .unwrap()
                .collect();
        assert_eq!(diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn test_hunk_mismatch_without_content_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\nc\n").unwrap();

        let hunks = vec![Hunk {
            old_start: 1,
            old_count: 1,
            lines: vec![" z".to_string(), "-b".to_string(), "+B".to_string()],
        }];
        let err = mutator_for(dir.path())
            .apply(&upsert("f.txt", None, Some(hunks)), &ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::HunkMismatch { .. }));
    }

    #[tokio::test]
    async fn test_policy_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let err = mutator_for(dir.path())
            .apply(
                &upsert("../outside.txt", Some("x"), None),
                &ApplyOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MutationError::Policy(PolicyError::PathEscape(_))
        ));
    }

    #[tokio::test]
    async fn test_size_limit_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mutator = RepoMutator::new(
            MutationPolicy::new(dir.path()).with_max_bytes(8),
        );
        let err = mutator
            .apply(
                &upsert("big.txt", Some("123456789"), None),
                &ApplyOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MutationError::Policy(PolicyError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let result = mutator_for(dir.path())
            .apply(
                &EditSpec {
                    ops: vec![Op::Delete {
                        path: "ghost.txt".to_string(),
                    }],
                },
                &ApplyOptions::default(),
            )
            .await
            .unwrap();
        assert!(result.changed.is_empty());
    }

    async fn init_git(dir: &Path) {
        let git = GitClient::new(dir);
        for args in [
            ["init", "-b", "main"].as_slice(),
            ["config", "user.email", "ci@example.com"].as_slice(),
            ["config", "user.name", "CI"].as_slice(),
        ] {
            git.run_for_tests(args).await;
        }
    }

    impl GitClient {
        /// Test helper: run git and panic on failure
        async fn run_for_tests(&self, args: &[&str]) {
            let out = self.run_raw(args).await.unwrap();
            assert!(out.success(), "git {args:?}: {}", out.stderr);
        }
    }

    #[tokio::test]
    async fn test_identical_upsert_commits_as_noop_with_head_sha() {
        let dir = tempfile::tempdir().unwrap();
        init_git(dir.path()).await;
        std::fs::write(dir.path().join("same.txt"), "stable\n").unwrap();
        let git = GitClient::new(dir.path());
        git.run_for_tests(&["add", "-A"]).await;
        git.run_for_tests(&["commit", "--no-verify", "-m", "seed"]).await;
        let head = git.head_sha().await.unwrap();

        let result = mutator_for(dir.path())
            .apply(
                &upsert("same.txt", Some("stable\n"), None),
                &ApplyOptions {
                    commit_message: Some("no-op change".to_string()),
                    branch: Some("main".to_string()),
                    push: true,
                    blocked_exts: vec![],
                },
            )
            .await
            .unwrap();

        assert_eq!(result.changed, vec!["same.txt"]);
        assert!(result.noop);
        assert_eq!(result.sha.as_deref(), Some(head.as_str()));
        assert!(!result.pushed);
    }

    #[tokio::test]
    async fn test_commit_and_changed_paths() {
        let dir = tempfile::tempdir().unwrap();
        init_git(dir.path()).await;
        std::fs::write(dir.path().join("seed.txt"), "seed\n").unwrap();
        let git = GitClient::new(dir.path());
        git.run_for_tests(&["add", "-A"]).await;
        git.run_for_tests(&["commit", "--no-verify", "-m", "seed"]).await;

        let spec = EditSpec {
            ops: vec![
                Op::Upsert {
                    path: "a.txt".to_string(),
                    content: Some("A\n".to_string()),
                    hunks: None,
                },
                Op::Delete {
                    path: "seed.txt".to_string(),
                },
            ],
        };
        let result = mutator_for(dir.path())
            .apply(
                &spec,
                &ApplyOptions {
                    commit_message: Some("apply spec".to_string()),
                    branch: None,
                    push: false,
                    blocked_exts: vec![],
                },
            )
            .await
            .unwrap();

        assert_eq!(result.changed, vec!["a.txt", "seed.txt"]);
        assert!(!result.noop);
        assert!(result.sha.is_some());
        assert!(git.is_clean().await.unwrap());
    }
}
