//! Duplicate tracker
//!
//! At-least-once delivery means a persona can see the same request twice: a
//! crashed worker leaves pending entries behind, and the group redelivers
//! them. This tracker remembers every `(task_id, corr_id, persona)` a worker
//! finished processing; a background sweeper drops entries past the TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Entry retention (24 hours)
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// One processed message
#[derive(Debug, Clone)]
struct ProcessedMessage {
    timestamp_ms: i64,
    workflow_id: String,
}

/// Tracker statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub entries: usize,
}

struct Inner {
    entries: Mutex<HashMap<String, ProcessedMessage>>,
    ttl: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Shared duplicate tracker. Clones share state; hand one clone to every
/// worker in the process.
#[derive(Clone)]
pub struct DuplicateTracker {
    inner: Arc<Inner>,
}

impl DuplicateTracker {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                ttl,
                sweeper: Mutex::new(None),
                shutdown_tx,
            }),
        }
    }

    /// `"{task_id}:{corr_id}:{lowercase persona}"`
    fn key(task_id: &str, corr_id: &str, persona: &str) -> String {
        format!("{task_id}:{corr_id}:{}", persona.to_ascii_lowercase())
    }

    /// Whether this triple was already processed. Untrackable messages
    /// (missing task or correlation ID) are never duplicates.
    pub fn is_duplicate(
        &self,
        task_id: Option<&str>,
        corr_id: Option<&str>,
        persona: &str,
    ) -> bool {
        let (Some(task_id), Some(corr_id)) = (task_id, corr_id) else {
            return false;
        };
        let entries = self.inner.entries.lock();
        match entries.get(&Self::key(task_id, corr_id, persona)) {
            Some(seen) => {
                warn!(
                    task_id,
                    corr_id,
                    persona,
                    first_processed_ms = seen.timestamp_ms,
                    workflow_id = %seen.workflow_id,
                    "duplicate delivery detected, skipping"
                );
                true
            }
            None => false,
        }
    }

    /// Record a finished message. A no-op when the triple cannot be tracked.
    pub fn mark_processed(
        &self,
        task_id: Option<&str>,
        corr_id: Option<&str>,
        persona: &str,
        workflow_id: &str,
    ) {
        let (Some(task_id), Some(corr_id)) = (task_id, corr_id) else {
            return;
        };
        self.inner.entries.lock().insert(
            Self::key(task_id, corr_id, persona),
            ProcessedMessage {
                timestamp_ms: Utc::now().timestamp_millis(),
                workflow_id: workflow_id.to_string(),
            },
        );
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            entries: self.inner.entries.lock().len(),
        }
    }

    /// Drop entries older than the TTL; returns how many were removed
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now().timestamp_millis() - self.inner.ttl.as_millis() as i64;
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.timestamp_ms >= cutoff);
        before - entries.len()
    }

    /// Start the background sweeper. A second call replaces the previous
    /// sweeper task.
    pub fn start_sweeper(&self, interval: Duration) {
        self.stop_sweeper_task();

        let tracker = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately, skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = tracker.sweep();
                        if removed > 0 {
                            debug!(removed, "swept expired duplicate entries");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("duplicate sweeper: shutdown requested");
                        break;
                    }
                }
            }
        });
        *self.inner.sweeper.lock() = Some(handle);
    }

    /// Stop the background sweeper, if running
    pub async fn stop_sweeper(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handle = self.inner.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let _ = self.inner.shutdown_tx.send(false);
    }

    fn stop_sweeper_task(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Default for DuplicateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detection_roundtrip() {
        let tracker = DuplicateTracker::new();
        assert!(!tracker.is_duplicate(Some("t1"), Some("c1"), "tester-qa"));

        tracker.mark_processed(Some("t1"), Some("c1"), "tester-qa", "wf-1");
        assert!(tracker.is_duplicate(Some("t1"), Some("c1"), "tester-qa"));
        // Persona comparison is case-insensitive via key lowering
        assert!(tracker.is_duplicate(Some("t1"), Some("c1"), "Tester-QA"));
        // Different correlation is a different message
        assert!(!tracker.is_duplicate(Some("t1"), Some("c2"), "tester-qa"));
    }

    #[test]
    fn test_untrackable_messages_are_never_duplicates() {
        let tracker = DuplicateTracker::new();
        tracker.mark_processed(None, Some("c1"), "qa", "wf");
        tracker.mark_processed(Some("t1"), None, "qa", "wf");
        assert_eq!(tracker.stats().entries, 0);
        assert!(!tracker.is_duplicate(None, Some("c1"), "qa"));
        assert!(!tracker.is_duplicate(Some("t1"), None, "qa"));
    }

    #[test]
    fn test_sweep_removes_expired_entries() {
        let tracker = DuplicateTracker::with_ttl(Duration::ZERO);
        tracker.mark_processed(Some("t1"), Some("c1"), "qa", "wf");
        assert_eq!(tracker.stats().entries, 1);
        // TTL zero: everything is expired (timestamps are strictly older
        // than the cutoff once a millisecond passes)
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.sweep(), 1);
        assert_eq!(tracker.stats().entries, 0);
        assert!(!tracker.is_duplicate(Some("t1"), Some("c1"), "qa"));
    }

    #[tokio::test]
    async fn test_sweeper_task_lifecycle() {
        let tracker = DuplicateTracker::with_ttl(Duration::ZERO);
        tracker.mark_processed(Some("t1"), Some("c1"), "qa", "wf");

        tracker.start_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.stop_sweeper().await;

        assert_eq!(tracker.stats().entries, 0);
    }
}
