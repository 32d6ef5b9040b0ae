//! Persona consumer pool
//!
//! One cooperative worker per persona, all joining a single shared consumer
//! group on the request stream with distinct consumer names. The group
//! spreads load; the `to_persona` filter keeps each worker on its own
//! traffic: a message addressed elsewhere is acked and skipped so the group
//! cursor keeps moving. Messages without `to_persona` are processed
//! (fail-open, older producers did not set it).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use ensemble_core::wire::{PersonaEvent, PersonaRequest};
use ensemble_transport::{
    AddId, GroupStart, ReadOptions, ReadTarget, StreamTransport, TransportError,
};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::dedup::DuplicateTracker;

/// Handler outcome: the result object published to the response stream
pub type HandlerResult = Result<Value, String>;

/// Persona business logic, registered per persona name
pub type PersonaHandler = Arc<
    dyn Fn(PersonaRequest) -> Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send>>
        + Send
        + Sync,
>;

/// Pool failures
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("pool is already running")]
    AlreadyRunning,

    #[error("no handlers registered")]
    NoHandlers,
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Shared consumer group on the request stream
    pub group: String,
    /// Consumer names are `{prefix}:{persona}`
    pub consumer_prefix: String,
    /// Messages fetched per read
    pub batch_size: usize,
    /// Blocking read window; `stop()` takes effect within one window
    pub block: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            group: "ensemble-workers".to_string(),
            consumer_prefix: "worker".to_string(),
            batch_size: 16,
            block: Duration::from_secs(2),
        }
    }
}

impl PoolConfig {
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }
}

/// The persona consumer pool
pub struct PersonaPool {
    transport: Arc<dyn StreamTransport>,
    request_stream: String,
    response_stream: String,
    tracker: DuplicateTracker,
    config: PoolConfig,
    handlers: parking_lot::Mutex<HashMap<String, PersonaHandler>>,
    shutdown_tx: watch::Sender<bool>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl PersonaPool {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        request_stream: impl Into<String>,
        response_stream: impl Into<String>,
        tracker: DuplicateTracker,
        config: PoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            request_stream: request_stream.into(),
            response_stream: response_stream.into(),
            tracker,
            config,
            handlers: parking_lot::Mutex::new(HashMap::new()),
            shutdown_tx,
            workers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Register the handler for one persona (lowercased on registration)
    pub fn register_handler<F, Fut>(&self, persona: &str, handler: F)
    where
        F: Fn(PersonaRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: PersonaHandler = Arc::new(move |request| Box::pin(handler(request)));
        self.handlers
            .lock()
            .insert(persona.to_ascii_lowercase(), handler);
    }

    /// Start one worker per registered persona. The shared group is created
    /// idempotently from the oldest entry.
    pub async fn start(&self) -> Result<(), PoolError> {
        {
            let workers = self.workers.lock();
            if !workers.is_empty() {
                return Err(PoolError::AlreadyRunning);
            }
        }
        let handlers = self.handlers.lock().clone();
        if handlers.is_empty() {
            return Err(PoolError::NoHandlers);
        }

        match self
            .transport
            .create_group(&self.request_stream, &self.config.group, GroupStart::Oldest, true)
            .await
        {
            Ok(()) => {}
            Err(TransportError::GroupExists { .. }) => {
                trace!(group = %self.config.group, "consumer group already exists");
            }
            Err(e) => return Err(e.into()),
        }

        let _ = self.shutdown_tx.send(false);
        let mut workers = self.workers.lock();
        for (persona, handler) in handlers {
            workers.push(self.spawn_worker(persona, handler));
        }
        info!(
            workers = workers.len(),
            group = %self.config.group,
            stream = %self.request_stream,
            "persona pool started"
        );
        Ok(())
    }

    /// Signal shutdown and await every worker. Blocked reads end within one
    /// block window; in-flight handlers run to completion.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("persona worker ended abnormally: {e}");
            }
        }
        info!("persona pool stopped");
    }

    fn spawn_worker(&self, persona: String, handler: PersonaHandler) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let request_stream = self.request_stream.clone();
        let response_stream = self.response_stream.clone();
        let tracker = self.tracker.clone();
        let group = self.config.group.clone();
        let consumer = format!("{}:{persona}", self.config.consumer_prefix);
        let batch_size = self.config.batch_size;
        let block = self.config.block;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            debug!(persona, consumer, "persona worker started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let read_targets = [(request_stream.clone(), ReadTarget::New)];
                let read = transport.read_group(
                    &group,
                    &consumer,
                    &read_targets,
                    ReadOptions::new().with_count(batch_size).with_block(block),
                );
                let batches = tokio::select! {
                    result = read => match result {
                        Ok(batches) => batches,
                        Err(e) => {
                            error!(persona, "read failed: {e}");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            continue;
                        }
                    },
                    _ = shutdown_rx.changed() => break,
                };
                let Some(batches) = batches else { continue };

                for batch in batches {
                    for message in batch.messages {
                        process_message(
                            transport.as_ref(),
                            &request_stream,
                            &response_stream,
                            &group,
                            &tracker,
                            &persona,
                            &handler,
                            message,
                        )
                        .await;
                    }
                }
            }
            debug!(persona, "persona worker exited");
        })
    }
}

/// Handle one delivered message end to end: route, dedup, execute, publish,
/// ack. Every path acks - at-least-once delivery with idempotency upstream.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(persona, id = %message.id))]
async fn process_message(
    transport: &dyn StreamTransport,
    request_stream: &str,
    response_stream: &str,
    group: &str,
    tracker: &DuplicateTracker,
    persona: &str,
    handler: &PersonaHandler,
    message: ensemble_transport::StreamMessage,
) {
    let ack = |reason: &'static str| async move {
        if let Err(e) = transport.ack(request_stream, group, message.id).await {
            warn!(persona, reason, "ack failed: {e}");
        }
    };

    let request = match PersonaRequest::from_fields(&message.fields) {
        Ok(request) => request,
        Err(e) => {
            warn!(persona, "dropping malformed request: {e}");
            ack("malformed").await;
            return;
        }
    };

    // Routing filter: a message addressed to another persona is acked and
    // skipped so it never runs foreign business logic. Missing routing
    // processes here (fail-open).
    if let Some(target) = &request.to_persona {
        if !target.eq_ignore_ascii_case(persona) {
            trace!(persona, target = %target, "not addressed to this worker, ack and skip");
            ack("routed-elsewhere").await;
            return;
        }
    }

    if tracker.is_duplicate(request.task_id.as_deref(), Some(&request.corr_id), persona) {
        ack("duplicate").await;
        return;
    }

    debug!(
        persona,
        workflow_id = %request.workflow_id,
        corr_id = %request.corr_id,
        intent = %request.intent,
        "processing request"
    );

    let result = match handler(request.clone()).await {
        Ok(value) => {
            // Handlers may return a full result object or a bare output
            if value.get("status").is_some() {
                value
            } else {
                json!({"status": "pass", "output": value})
            }
        }
        Err(message) => json!({"status": "fail", "error": message}),
    };

    let event = PersonaEvent {
        workflow_id: request.workflow_id.clone(),
        corr_id: request.corr_id.clone(),
        from: persona.to_string(),
        result,
    };
    if let Err(e) = transport
        .add(response_stream, AddId::Auto, event.to_fields())
        .await
    {
        error!(persona, corr_id = %request.corr_id, "failed to publish completion: {e}");
    }

    tracker.mark_processed(
        request.task_id.as_deref(),
        Some(&request.corr_id),
        persona,
        &request.workflow_id,
    );
    ack("processed").await;
}
