//! ContextScanStep: repository scan with snapshot reuse

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::context::WorkflowContext;
use crate::definition::StepConfig;
use crate::step::{optional_bool, StepError, StepResult, WorkflowStep};

/// Snapshot age under which a rescan is skipped
const DEFAULT_MAX_AGE_MINUTES: i64 = 15;

/// Directories the scanner never descends into
const SKIP_DIRS: [&str; 7] = [
    ".git",
    ".ma",
    "node_modules",
    "target",
    "dist",
    "build",
    ".venv",
];

#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    path: String,
    bytes: u64,
    lines: usize,
    language: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    generated_at: String,
    file_count: usize,
    total_lines: usize,
    languages: std::collections::BTreeMap<String, usize>,
}

/// Scans the repository into `.ma/context/` artifacts, or reuses a recent
/// snapshot.
///
/// Outputs `{reused_existing, file_count, total_lines}`; downstream steps
/// typically gate on `reused_existing` to skip re-summarization.
pub struct ContextScanStep;

impl ContextScanStep {
    pub fn new() -> Self {
        Self
    }

    fn snapshot_is_fresh(path: &Path, max_age_minutes: i64) -> bool {
        let Ok(metadata) = std::fs::metadata(path) else {
            return false;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        let age = std::time::SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        (age.as_secs() as i64) < max_age_minutes * 60
    }

    fn language_for(path: &Path) -> String {
        match path.extension().and_then(|e| e.to_str()) {
            Some("rs") => "rust",
            Some("ts") | Some("tsx") => "typescript",
            Some("js") | Some("jsx") => "javascript",
            Some("py") => "python",
            Some("go") => "go",
            Some("java") => "java",
            Some("rb") => "ruby",
            Some("md") => "markdown",
            Some("yml") | Some("yaml") => "yaml",
            Some("json") => "json",
            Some("toml") => "toml",
            Some("sh") => "shell",
            Some(other) => return other.to_string(),
            None => "none",
        }
        .to_string()
    }

    fn scan(repo_root: &Path) -> Result<(Snapshot, Vec<FileRecord>), StepError> {
        let mut records = Vec::new();
        let walker = WalkDir::new(repo_root).into_iter().filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && SKIP_DIRS.contains(&entry.file_name().to_string_lossy().as_ref()))
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("scan skipping unreadable entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path
                .strip_prefix(repo_root)
                .unwrap_or(path)
                .to_string_lossy()
                .into_owned();
            let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let lines = std::fs::read_to_string(path)
                .map(|content| content.lines().count())
                .unwrap_or(0);
            records.push(FileRecord {
                path: relative,
                bytes,
                lines,
                language: Self::language_for(path),
            });
        }

        records.sort_by(|a, b| a.path.cmp(&b.path));
        let mut languages = std::collections::BTreeMap::new();
        for record in &records {
            *languages.entry(record.language.clone()).or_insert(0) += 1;
        }
        let snapshot = Snapshot {
            generated_at: Utc::now().to_rfc3339(),
            file_count: records.len(),
            total_lines: records.iter().map(|r| r.lines).sum(),
            languages,
        };
        Ok((snapshot, records))
    }

    fn write_artifacts(
        context_dir: &Path,
        snapshot: &Snapshot,
        records: &[FileRecord],
    ) -> Result<(), StepError> {
        let io_err = |e: std::io::Error| StepError::Other(format!("context artifact write: {e}"));
        std::fs::create_dir_all(context_dir).map_err(io_err)?;

        let snapshot_json =
            serde_json::to_string_pretty(snapshot).map_err(|e| StepError::Parse(e.to_string()))?;
        std::fs::write(context_dir.join("snapshot.json"), snapshot_json).map_err(io_err)?;

        let mut ndjson = String::new();
        for record in records {
            ndjson.push_str(
                &serde_json::to_string(record).map_err(|e| StepError::Parse(e.to_string()))?,
            );
            ndjson.push('\n');
        }
        std::fs::write(context_dir.join("files.ndjson"), ndjson).map_err(io_err)?;

        let mut summary = format!(
            "# Repository context\n\nScanned {} files, {} lines total.\n\n## Languages\n\n",
            snapshot.file_count, snapshot.total_lines
        );
        for (language, count) in &snapshot.languages {
            summary.push_str(&format!("- {language}: {count} files\n"));
        }
        std::fs::write(context_dir.join("summary.md"), summary).map_err(io_err)?;
        Ok(())
    }
}

impl Default for ContextScanStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStep for ContextScanStep {
    fn validate_config(&self, _config: &StepConfig) -> Result<(), StepError> {
        Ok(())
    }

    async fn execute(&self, ctx: &mut WorkflowContext, config: &StepConfig) -> StepResult {
        let force_rescan = optional_bool(ctx, config, "force_rescan").unwrap_or(false);
        let max_age_minutes = config
            .config
            .get("max_age_minutes")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_MAX_AGE_MINUTES);

        let context_dir = ctx.repo_root.join(".ma").join("context");
        let snapshot_path = context_dir.join("snapshot.json");

        if !force_rescan && Self::snapshot_is_fresh(&snapshot_path, max_age_minutes) {
            info!(snapshot = %snapshot_path.display(), "reusing existing context snapshot");
            let snapshot: Option<Snapshot> = std::fs::read_to_string(&snapshot_path)
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok());
            let (file_count, total_lines) = snapshot
                .map(|s| (s.file_count, s.total_lines))
                .unwrap_or((0, 0));
            return StepResult::success(json!({
                "reused_existing": true,
                "file_count": file_count,
                "total_lines": total_lines,
            }));
        }

        let (snapshot, records) = match Self::scan(&ctx.repo_root) {
            Ok(scanned) => scanned,
            Err(e) => return StepResult::failure(e),
        };
        if let Err(e) = Self::write_artifacts(&context_dir, &snapshot, &records) {
            return StepResult::failure(e);
        }
        info!(
            files = snapshot.file_count,
            lines = snapshot.total_lines,
            "repository scanned"
        );

        StepResult::success(json!({
            "reused_existing": false,
            "file_count": snapshot.file_count,
            "total_lines": snapshot.total_lines,
        }))
    }
}
