//! Mutation policy gates
//!
//! Evaluated per op, in order; the first failing gate rejects the op:
//!
//! 1. Workspace safety - the engine never edits its own working directory
//!    unless explicitly allowed.
//! 2. Global blocklist - paths no edit spec may ever touch.
//! 3. Extension deny-list - merged from config and per-call overrides.
//! 4. Path containment - the resolved path must stay inside the repo root.
//! 5. Size limit - applied to written content by the mutator.

use std::path::{Component, Path, PathBuf};

/// Policy violations
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("repo root {0} is the engine's own workspace and allow_workspace_git is off")]
    WorkspaceBlocked(PathBuf),

    #[error("path is globally blocked: {0}")]
    BlockedPath(String),

    #[error("extension {ext:?} is blocked for {path}")]
    BlockedExtension { path: String, ext: String },

    #[error("path escapes repository root: {0}")]
    PathEscape(String),

    #[error("content for {path} is {size} bytes, above the {max} byte limit")]
    TooLarge {
        path: String,
        size: usize,
        max: usize,
    },
}

/// Default written-content cap (512 KiB)
pub const DEFAULT_MAX_BYTES: usize = 512 * 1024;

/// Policy configuration for one mutator
#[derive(Debug, Clone)]
pub struct MutationPolicy {
    pub repo_root: PathBuf,
    pub allow_workspace_git: bool,
    /// Deny-listed extensions from configuration (dot included, e.g. `.pem`)
    pub blocked_exts: Vec<String>,
    pub max_bytes: usize,
}

impl MutationPolicy {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            allow_workspace_git: false,
            blocked_exts: Vec::new(),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_allow_workspace_git(mut self, allow: bool) -> Self {
        self.allow_workspace_git = allow;
        self
    }

    pub fn with_blocked_exts(mut self, exts: Vec<String>) -> Self {
        self.blocked_exts = exts;
        self
    }

    pub fn with_max_bytes(mut self, max: usize) -> Self {
        self.max_bytes = max;
        self
    }

    /// Gate 1: refuse to mutate the engine's own working directory
    pub fn check_workspace(&self) -> Result<(), PolicyError> {
        if self.allow_workspace_git {
            return Ok(());
        }
        let cwd = std::env::current_dir().unwrap_or_default();
        let root = self
            .repo_root
            .canonicalize()
            .unwrap_or_else(|_| self.repo_root.clone());
        let cwd = cwd.canonicalize().unwrap_or(cwd);
        if root == cwd {
            return Err(PolicyError::WorkspaceBlocked(self.repo_root.clone()));
        }
        Ok(())
    }

    /// Gate 2: paths no op may touch regardless of configuration - anything
    /// under `.git`, and environment files that routinely hold credentials.
    pub fn check_global_blocklist(&self, path: &str) -> Result<(), PolicyError> {
        let blocked = Path::new(path).components().any(|c| {
            matches!(c, Component::Normal(name) if {
                let name = name.to_string_lossy();
                name == ".git" || name == ".env" || name.starts_with(".env.")
            })
        });
        if blocked {
            return Err(PolicyError::BlockedPath(path.to_string()));
        }
        Ok(())
    }

    /// Gate 3: extension deny-list, config merged with per-call overrides
    pub fn check_extension(&self, path: &str, overrides: &[String]) -> Result<(), PolicyError> {
        let Some(ext) = Path::new(path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        else {
            return Ok(());
        };
        let denied = self
            .blocked_exts
            .iter()
            .chain(overrides.iter())
            .any(|blocked| blocked.eq_ignore_ascii_case(&ext));
        if denied {
            return Err(PolicyError::BlockedExtension {
                path: path.to_string(),
                ext,
            });
        }
        Ok(())
    }

    /// Gate 4: resolve the op path and require it to stay inside the root.
    ///
    /// Resolution is lexical (the target may not exist yet): `..` pops, `.`
    /// is dropped, and popping past the root is an escape.
    pub fn resolve_within_root(&self, path: &str) -> Result<PathBuf, PolicyError> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.repo_root.join(candidate)
        };

        let root = self
            .repo_root
            .canonicalize()
            .unwrap_or_else(|_| self.repo_root.clone());

        let mut resolved = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    let popped = resolved.pop();
                    let still_inside = resolved.starts_with(&self.repo_root)
                        || resolved.starts_with(&root);
                    if !popped || !still_inside {
                        return Err(PolicyError::PathEscape(path.to_string()));
                    }
                }
                Component::CurDir => {}
                other => resolved.push(other),
            }
        }

        // Compare against both the configured and the canonical root so
        // symlinked checkouts resolve consistently.
        let inside = (resolved.starts_with(&self.repo_root) && resolved != self.repo_root)
            || (resolved.starts_with(&root) && resolved != root);
        if !inside {
            return Err(PolicyError::PathEscape(path.to_string()));
        }
        Ok(resolved)
    }

    /// Gate 5: written-content size cap
    pub fn check_size(&self, path: &str, size: usize) -> Result<(), PolicyError> {
        if size > self.max_bytes {
            return Err(PolicyError::TooLarge {
                path: path.to_string(),
                size,
                max: self.max_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> MutationPolicy {
        MutationPolicy::new("/repos/demo").with_blocked_exts(vec![".pem".to_string()])
    }

    #[test]
    fn test_global_blocklist() {
        let p = policy();
        assert!(p.check_global_blocklist(".git/config").is_err());
        assert!(p.check_global_blocklist("src/.env.local").is_err());
        assert!(p.check_global_blocklist(".env").is_err());
        assert!(p.check_global_blocklist("src/environment.rs").is_ok());
    }

    #[test]
    fn test_extension_merge() {
        let p = policy();
        assert!(p.check_extension("key.pem", &[]).is_err());
        assert!(p.check_extension("KEY.PEM", &[]).is_err());
        assert!(p.check_extension("a.rs", &[]).is_ok());
        assert!(p
            .check_extension("a.rs", &[".rs".to_string()])
            .is_err());
        assert!(p.check_extension("Makefile", &[]).is_ok());
    }

    #[test]
    fn test_containment() {
        let p = policy();
        assert_eq!(
            p.resolve_within_root("src/lib.rs").unwrap(),
            PathBuf::from("/repos/demo/src/lib.rs")
        );
        assert!(p.resolve_within_root("../outside.txt").is_err());
        assert!(p.resolve_within_root("src/../../etc/passwd").is_err());
        assert!(p.resolve_within_root("/etc/passwd").is_err());
        // `..` that stays inside is fine
        assert_eq!(
            p.resolve_within_root("src/../README.md").unwrap(),
            PathBuf::from("/repos/demo/README.md")
        );
    }

    #[test]
    fn test_size_cap() {
        let p = policy().with_max_bytes(10);
        assert!(p.check_size("a.txt", 10).is_ok());
        assert!(p.check_size("a.txt", 11).is_err());
    }

    #[test]
    fn test_workspace_gate_blocks_cwd() {
        let cwd = std::env::current_dir().unwrap();
        let p = MutationPolicy::new(&cwd);
        assert!(matches!(
            p.check_workspace(),
            Err(PolicyError::WorkspaceBlocked(_))
        ));
        assert!(p
            .with_allow_workspace_git(true)
            .check_workspace()
            .is_ok());
    }
}
