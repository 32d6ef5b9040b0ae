//! Persona invocation client
//!
//! Request/await-correlated-reply over the stream transport. The caller
//! chooses the correlation ID (UUID v4); the response stream is watched
//! through a per-wait consumer group so concurrent waiters never steal each
//! other's events.

use std::sync::Arc;
use std::time::Duration;

use ensemble_transport::{
    AddId, GroupStart, ReadOptions, ReadTarget, StreamTransport, TransportError,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::wire::{PersonaEvent, PersonaRequest};

/// Client failures
#[derive(Debug, thiserror::Error)]
pub enum PersonaClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("timed out after {0:?} waiting for completion of correlation {1}")]
    Timeout(Duration, String),
}

/// Generate a fresh correlation ID
pub fn new_corr_id() -> String {
    Uuid::new_v4().to_string()
}

/// Publish a persona request to the request stream. Returns the correlation
/// ID actually used (the request's own, or a fresh one when empty).
pub async fn send_persona_request(
    transport: &Arc<dyn StreamTransport>,
    request_stream: &str,
    mut request: PersonaRequest,
) -> Result<String, PersonaClientError> {
    if request.corr_id.is_empty() {
        request.corr_id = new_corr_id();
    }
    let corr_id = request.corr_id.clone();
    let id = transport
        .add(request_stream, AddId::Auto, request.to_fields())
        .await?;
    debug!(
        stream = request_stream,
        corr_id,
        to_persona = request.to_persona.as_deref().unwrap_or("<unrouted>"),
        id = %id,
        "persona request published"
    );
    Ok(corr_id)
}

/// Wait for the completion event matching `workflow_id` + `corr_id` on the
/// response stream, scanning from the oldest retained entry.
///
/// Use [`request_persona`] when sending and waiting together; it arms the
/// watch group before publishing so a fast responder cannot be missed.
pub async fn wait_for_persona_completion(
    transport: &Arc<dyn StreamTransport>,
    response_stream: &str,
    workflow_id: &str,
    corr_id: &str,
    timeout: Duration,
) -> Result<PersonaEvent, PersonaClientError> {
    let group = watch_group_name(corr_id);
    match transport
        .create_group(response_stream, &group, GroupStart::Oldest, true)
        .await
    {
        Ok(()) | Err(TransportError::GroupExists { .. }) => {}
        Err(e) => return Err(e.into()),
    }
    let result = await_event(transport, response_stream, &group, workflow_id, corr_id, timeout)
        .await;
    cleanup_group(transport, response_stream, &group).await;
    result
}

/// Send a request and wait for its correlated completion.
///
/// The watch group is created at the stream tip before the request goes out,
/// closing the window where a reply could land unseen.
pub async fn request_persona(
    transport: &Arc<dyn StreamTransport>,
    request_stream: &str,
    response_stream: &str,
    mut request: PersonaRequest,
    timeout: Duration,
) -> Result<PersonaEvent, PersonaClientError> {
    if request.corr_id.is_empty() {
        request.corr_id = new_corr_id();
    }
    let workflow_id = request.workflow_id.clone();
    let corr_id = request.corr_id.clone();

    let group = watch_group_name(&corr_id);
    match transport
        .create_group(response_stream, &group, GroupStart::Tip, true)
        .await
    {
        Ok(()) | Err(TransportError::GroupExists { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    if let Err(e) = send_persona_request(transport, request_stream, request).await {
        cleanup_group(transport, response_stream, &group).await;
        return Err(e);
    }

    let result = await_event(
        transport,
        response_stream,
        &group,
        &workflow_id,
        &corr_id,
        timeout,
    )
    .await;
    cleanup_group(transport, response_stream, &group).await;
    result
}

fn watch_group_name(corr_id: &str) -> String {
    format!("await:{corr_id}")
}

async fn cleanup_group(transport: &Arc<dyn StreamTransport>, stream: &str, group: &str) {
    if let Err(e) = transport.destroy_group(stream, group).await {
        warn!(group, "failed to drop completion watch group: {e}");
    }
}

async fn await_event(
    transport: &Arc<dyn StreamTransport>,
    response_stream: &str,
    group: &str,
    workflow_id: &str,
    corr_id: &str,
    timeout: Duration,
) -> Result<PersonaEvent, PersonaClientError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let persona_hint = corr_id.to_string();

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(PersonaClientError::Timeout(timeout, persona_hint));
        }
        let block = remaining.min(Duration::from_secs(1));

        let batches = transport
            .read_group(
                group,
                "waiter",
                &[(response_stream.to_string(), ReadTarget::New)],
                ReadOptions::new().with_count(32).with_block(block),
            )
            .await?;

        let Some(batches) = batches else { continue };
        for batch in batches {
            for message in batch.messages {
                transport.ack(response_stream, group, message.id).await?;
                let Ok(event) = PersonaEvent::from_fields(&message.fields) else {
                    continue;
                };
                if event.workflow_id == workflow_id && event.corr_id == corr_id {
                    return Ok(event);
                }
            }
        }
    }
}
