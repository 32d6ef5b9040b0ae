//! # Repo Mutator
//!
//! Turns an [`EditSpec`] into committed repository changes:
//!
//! 1. Policy gates run per op, in a fixed order: workspace safety, global
//!    blocklist, extension deny-list, path containment, size limit.
//! 2. Upserts apply either whole-file `content` or unified-diff style
//!    [`Hunk`]s with context verification; mismatched hunks write a
//!    diagnostic artifact and fall back to `content` when present.
//! 3. Writes are atomic (`path.tmp` + rename). Commit uses a three-tier
//!    fallback (targeted add, forced add, `add -A`) and recognizes the
//!    "nothing to commit" family of messages as a noop rather than an error.
//!
//! The mutator assumes its checkout is not shared with a concurrently running
//! workflow; routing one workflow per repo path is the coordinator's job.

pub mod git;
pub mod hunks;
pub mod mutator;
pub mod policy;
pub mod spec;

pub use git::{CommitOutcome, GitClient, GitError};
pub use hunks::HunkError;
pub use mutator::{ApplyOptions, MutationError, MutationResult, RepoMutator};
pub use policy::{MutationPolicy, PolicyError};
pub use spec::{EditSpec, Hunk, Op};
