//! Information-acquisition helpers
//!
//! Personas ask for extra context as `repo_file` or `http_get` requests. The
//! gatherer enforces the configured byte caps and deny-list, and persists
//! every result to the task's acquisition artifact directory under `.ma/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::InformationConfig;

/// One acquisition request, as a persona submits it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InformationRequest {
    /// Slice of a file inside the repository checkout
    RepoFile {
        path: String,
        #[serde(default)]
        start_line: Option<usize>,
        #[serde(default)]
        end_line: Option<usize>,
        #[serde(default)]
        max_bytes: Option<usize>,
    },
    /// Body of an HTTP GET, truncated at the byte cap
    HttpGet {
        url: String,
        #[serde(default)]
        max_bytes: Option<usize>,
    },
}

/// Result of one acquisition, as serialized to the artifact file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InformationResult {
    pub request: InformationRequest,
    pub ok: bool,
    #[serde(default)]
    pub content: Option<String>,
    pub truncated: bool,
    pub bytes: usize,
    #[serde(default)]
    pub error: Option<String>,
}

impl InformationResult {
    fn failure(request: InformationRequest, error: impl Into<String>) -> Self {
        Self {
            request,
            ok: false,
            content: None,
            truncated: false,
            bytes: 0,
            error: Some(error.into()),
        }
    }
}

/// Acquisition failures that prevent even a failure artifact from landing
#[derive(Debug, thiserror::Error)]
pub enum InfoError {
    #[error("failed to write acquisition artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Executes acquisition requests within the configured limits
pub struct InformationGatherer {
    config: InformationConfig,
    http: reqwest::Client,
}

impl InformationGatherer {
    pub fn new(config: InformationConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    /// Deny-list union of the inline hosts and the deny-hosts file
    fn denied_hosts(&self) -> Vec<String> {
        let mut hosts = self.config.deny_hosts.clone();
        if let Some(path) = &self.config.deny_hosts_file {
            match std::fs::read_to_string(path) {
                Ok(raw) => hosts.extend(
                    raw.lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(String::from),
                ),
                Err(e) => warn!(path = %path.display(), "unreadable deny-hosts file: {e}"),
            }
        }
        hosts
    }

    fn host_denied(&self, url: &str) -> bool {
        let host = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(url)
            .split(['/', '?', '#'])
            .next()
            .unwrap_or("")
            .split('@')
            .last()
            .unwrap_or("")
            .split(':')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        self.denied_hosts()
            .iter()
            .any(|denied| host == denied.to_ascii_lowercase())
    }

    /// Execute one request and persist the result to
    /// `.ma/tasks/{task_id}/{artifact_subdir}/info-{epoch_ms}.json`.
    pub async fn gather(
        &self,
        repo_root: &Path,
        task_id: &str,
        request: InformationRequest,
    ) -> Result<InformationResult, InfoError> {
        let result = match &request {
            InformationRequest::RepoFile {
                path,
                start_line,
                end_line,
                max_bytes,
            } => self.read_repo_file(
                repo_root,
                path,
                *start_line,
                *end_line,
                max_bytes.unwrap_or(self.config.max_file_bytes),
                request.clone(),
            ),
            InformationRequest::HttpGet { url, max_bytes } => {
                self.http_get(
                    url,
                    max_bytes.unwrap_or(self.config.max_http_bytes),
                    request.clone(),
                )
                .await
            }
        };

        self.write_artifact(repo_root, task_id, &result)?;
        Ok(result)
    }

    fn read_repo_file(
        &self,
        repo_root: &Path,
        path: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
        max_bytes: usize,
        request: InformationRequest,
    ) -> InformationResult {
        let joined = repo_root.join(path);
        let resolved = match joined.canonicalize() {
            Ok(p) => p,
            Err(e) => return InformationResult::failure(request, format!("unreadable: {e}")),
        };
        let root = match repo_root.canonicalize() {
            Ok(p) => p,
            Err(e) => return InformationResult::failure(request, format!("bad repo root: {e}")),
        };
        if !resolved.starts_with(&root) {
            return InformationResult::failure(request, "path escapes repository root");
        }

        let raw = match std::fs::read_to_string(&resolved) {
            Ok(raw) => raw,
            Err(e) => return InformationResult::failure(request, format!("unreadable: {e}")),
        };

        // 1-based inclusive line slice, whole file when unspecified
        let sliced: String = match (start_line, end_line) {
            (None, None) => raw,
            (start, end) => {
                let start = start.unwrap_or(1).max(1);
                let lines: Vec<&str> = raw.lines().collect();
                let end = end.unwrap_or(lines.len()).min(lines.len());
                if start > end {
                    String::new()
                } else {
                    lines[start - 1..end].join("\n")
                }
            }
        };

        let truncated = sliced.len() > max_bytes;
        let content = if truncated {
            let mut cut = max_bytes;
            while cut > 0 && !sliced.is_char_boundary(cut) {
                cut -= 1;
            }
            sliced[..cut].to_string()
        } else {
            sliced
        };

        InformationResult {
            request,
            ok: true,
            bytes: content.len(),
            content: Some(content),
            truncated,
            error: None,
        }
    }

    async fn http_get(
        &self,
        url: &str,
        max_bytes: usize,
        request: InformationRequest,
    ) -> InformationResult {
        if self.host_denied(url) {
            return InformationResult::failure(request, format!("host denied: {url}"));
        }

        let response = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => return InformationResult::failure(request, format!("request failed: {e}")),
        };
        if !response.status().is_success() {
            return InformationResult::failure(
                request,
                format!("status {}", response.status().as_u16()),
            );
        }

        // Stream the body, truncating at the cap instead of buffering it all.
        let mut body: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut response = response;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let remaining = max_bytes.saturating_sub(body.len());
                    if chunk.len() >= remaining {
                        body.extend_from_slice(&chunk[..remaining]);
                        truncated = true;
                        break;
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    return InformationResult::failure(request, format!("body read failed: {e}"))
                }
            }
        }

        let content = String::from_utf8_lossy(&body).into_owned();
        InformationResult {
            request,
            ok: true,
            bytes: content.len(),
            content: Some(content),
            truncated,
            error: None,
        }
    }

    fn write_artifact(
        &self,
        repo_root: &Path,
        task_id: &str,
        result: &InformationResult,
    ) -> Result<(), InfoError> {
        let dir = repo_root
            .join(".ma")
            .join("tasks")
            .join(task_id)
            .join(&self.config.artifact_subdir);
        let path = dir.join(format!("info-{}.json", Utc::now().timestamp_millis()));
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let json = serde_json::to_string_pretty(result)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(&path, json)
        };
        write().map_err(|source| InfoError::Artifact { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gatherer(deny: &[&str]) -> InformationGatherer {
        InformationGatherer::new(InformationConfig {
            deny_hosts: deny.iter().map(|s| s.to_string()).collect(),
            ..InformationConfig::default()
        })
    }

    #[tokio::test]
    async fn test_repo_file_slice_and_artifact() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "one\ntwo\nthree\nfour\n").unwrap();

        let result = gatherer(&[])
            .gather(
                dir.path(),
                "t-1",
                InformationRequest::RepoFile {
                    path: "notes.txt".to_string(),
                    start_line: Some(2),
                    end_line: Some(3),
                    max_bytes: None,
                },
            )
            .await
            .unwrap();

        assert!(result.ok);
        assert_eq!(result.content.as_deref(), Some("two\nthree"));
        assert!(!result.truncated);

        let artifacts: Vec<_> = std::fs::read_dir(
            dir.path().join(".ma").join("tasks").join("t-1").join("acquisitions"),
        )
        .unwrap()
        .collect();
        assert_eq!(artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_repo_file_truncates_at_cap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(100)).unwrap();

        let result = gatherer(&[])
            .gather(
                dir.path(),
                "t-1",
                InformationRequest::RepoFile {
                    path: "big.txt".to_string(),
                    start_line: None,
                    end_line: None,
                    max_bytes: Some(10),
                },
            )
            .await
            .unwrap();

        assert!(result.truncated);
        assert_eq!(result.bytes, 10);
    }

    #[tokio::test]
    async fn test_repo_file_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = gatherer(&[])
            .gather(
                dir.path(),
                "t-1",
                InformationRequest::RepoFile {
                    path: "../outside.txt".to_string(),
                    start_line: None,
                    end_line: None,
                    max_bytes: None,
                },
            )
            .await
            .unwrap();
        assert!(!result.ok);
    }

    #[tokio::test]
    async fn test_denied_host_preflight() {
        let dir = tempfile::tempdir().unwrap();
        let result = gatherer(&["internal.example.com"])
            .gather(
                dir.path(),
                "t-1",
                InformationRequest::HttpGet {
                    url: "https://internal.example.com/secrets".to_string(),
                    max_bytes: None,
                },
            )
            .await
            .unwrap();
        assert!(!result.ok);
        assert!(result.error.as_deref().unwrap_or("").contains("host denied"));
    }

    #[test]
    fn test_host_extraction_handles_ports_and_userinfo() {
        let g = gatherer(&["blocked.test"]);
        assert!(g.host_denied("https://blocked.test:8443/x"));
        assert!(g.host_denied("http://user:pw@BLOCKED.test/y"));
        assert!(!g.host_denied("https://ok.test/"));
    }
}
