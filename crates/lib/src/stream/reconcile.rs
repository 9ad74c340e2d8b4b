//! Stream reconciliation: turn periodic conversation snapshots into a live
//! delta stream.
//!
//! The backend offers no token-streaming endpoint in this flow — only task
//! creation plus snapshots — so the loop polls the conversation, locates the
//! in-progress assistant message, and emits the content suffix that appeared
//! since the previous poll. Completion is decided by an explicit done marker,
//! a content-stability heuristic, or a hard wall-clock deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::api::models::{has_done_marker, ROLE_ASSISTANT};
use crate::api::{ApiError, Conversation, OpenWebUiClient};
use crate::config::StreamingConfig;
use crate::stream::registry::{RecoveryCallback, StreamMetadata, StreamRegistry};

/// Separator emitted before a full replacement when the server rewrote the
/// draft instead of appending to it.
pub const DIVERGENCE_SEPARATOR: &str = "\n\n";

/// Where conversation snapshots come from; the HTTP client in production,
/// a scripted source in tests.
#[async_trait]
pub trait ConversationSource: Send + Sync {
    async fn fetch_conversation(&self, id: &str) -> Result<Conversation, ApiError>;
}

#[async_trait]
impl ConversationSource for OpenWebUiClient {
    async fn fetch_conversation(&self, id: &str) -> Result<Conversation, ApiError> {
        OpenWebUiClient::fetch_conversation(self, id).await
    }
}

/// Tuning for one reconciliation loop.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub poll_interval: Duration,
    /// Consecutive identical non-empty polls before the stream is considered
    /// complete. Deliberately higher than "unchanged once": long generations
    /// plateau briefly (e.g. during tool execution) and must not be truncated.
    pub stability_threshold: u32,
    /// Hard cap on the loop's lifetime; exceeding it is the only failure-ish
    /// exit, and it still closes the stream cleanly.
    pub max_duration: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(900),
            stability_threshold: 8,
            max_duration: Duration::from_secs(600),
        }
    }
}

impl From<&StreamingConfig> for StreamOptions {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            stability_threshold: config.stability_threshold,
            max_duration: config.max_stream_duration(),
        }
    }
}

/// One tick's content movement relative to the last observed value.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    /// No change.
    Unchanged,
    /// Monotonic growth: only this suffix is new.
    Append(String),
    /// Content shrank or diverged; the full new value replaces the old.
    Replace(String),
}

fn diff_step(last: &str, current: &str) -> Step {
    if current == last {
        Step::Unchanged
    } else if let Some(suffix) = current.strip_prefix(last) {
        Step::Append(suffix.to_string())
    } else {
        Step::Replace(current.to_string())
    }
}

/// Locate the target message's content in a snapshot.
///
/// Exact id match wins (the send path attaches a deterministic response id,
/// so this is the common case; history-map and flat-list shapes are already
/// folded into `Conversation::messages` by normalization). Without an id
/// match, fall back to the in-flight assistant message — but only when there
/// is exactly one plausible candidate. With several assistant messages in
/// flight (regenerate racing another send) guessing the most recent one can
/// splice the wrong generation into the stream, so the lookup fails closed.
fn locate_content(conversation: &Conversation, message_id: &str) -> Option<String> {
    if let Some(msg) = conversation.messages.iter().find(|m| m.id == message_id) {
        return Some(msg.content.clone());
    }

    let streaming: Vec<_> = conversation
        .messages
        .iter()
        .filter(|m| m.role == ROLE_ASSISTANT && m.streaming)
        .collect();
    match streaming.len() {
        1 => return Some(streaming[0].content.clone()),
        0 => {}
        _ => {
            log::debug!(
                "{} assistant messages in flight and no id match; refusing to guess",
                streaming.len()
            );
            return None;
        }
    }

    // Nothing marked streaming: accept a trailing assistant message only if
    // it is the sole assistant message in the conversation.
    let assistants: Vec<_> = conversation
        .messages
        .iter()
        .filter(|m| m.role == ROLE_ASSISTANT)
        .collect();
    let last_is_assistant = conversation
        .messages
        .last()
        .map(|m| m.role == ROLE_ASSISTANT)
        .unwrap_or(false);
    if assistants.len() == 1 && last_is_assistant {
        return Some(assistants[0].content.clone());
    }
    None
}

/// Drive one reconciliation loop to completion, emitting deltas on `tx` and
/// recording progress in the registry. The channel closes unconditionally
/// when the loop exits (sender dropped); there is no distinct failed state,
/// only completion or exhaustion.
pub async fn run_reconcile_loop<S: ConversationSource + ?Sized>(
    source: &S,
    registry: &StreamRegistry,
    stream_id: &str,
    conversation_id: &str,
    message_id: &str,
    cancel_flag: &AtomicBool,
    options: StreamOptions,
    tx: mpsc::Sender<String>,
) {
    let deadline = Instant::now() + options.max_duration;
    let mut last_observed = String::new();
    let mut stable_count: u32 = 0;
    let mut seq: u64 = 0;

    loop {
        if cancel_flag.load(Ordering::SeqCst) {
            log::debug!("{}: cancelled", stream_id);
            return;
        }
        if Instant::now() >= deadline {
            log::warn!("{}: deadline exceeded, closing stream", stream_id);
            break;
        }

        // Transient fetch errors are "try again next tick"; only completion
        // conditions and the deadline end the loop.
        let content = match source.fetch_conversation(conversation_id).await {
            Ok(conversation) => locate_content(&conversation, message_id),
            Err(e) => {
                log::debug!("{}: poll failed, retrying next tick: {}", stream_id, e);
                tokio::time::sleep(options.poll_interval).await;
                continue;
            }
        };
        let Some(content) = content else {
            tokio::time::sleep(options.poll_interval).await;
            continue;
        };

        match diff_step(&last_observed, &content) {
            Step::Unchanged => {
                if !content.is_empty() {
                    stable_count += 1;
                    if !has_done_marker(&content) && stable_count >= options.stability_threshold {
                        log::debug!(
                            "{}: stable for {} polls, closing stream",
                            stream_id,
                            stable_count
                        );
                        break;
                    }
                }
            }
            Step::Append(suffix) => {
                stable_count = 0;
                seq += 1;
                if tx.send(suffix.clone()).await.is_err() {
                    log::debug!("{}: receiver dropped, stopping", stream_id);
                    return;
                }
                registry
                    .update_progress(stream_id, Some(seq), None, &suffix)
                    .await;
                last_observed = content.clone();
            }
            Step::Replace(full) => {
                stable_count = 0;
                seq += 1;
                let emission = format!("{}{}", DIVERGENCE_SEPARATOR, full);
                if tx.send(emission).await.is_err() {
                    log::debug!("{}: receiver dropped, stopping", stream_id);
                    return;
                }
                registry
                    .update_progress(stream_id, Some(seq), Some(full.clone()), "")
                    .await;
                last_observed = full;
            }
        }

        // A tool-call block flagged done is the explicit completion signal
        // and wins regardless of the stability count.
        if has_done_marker(&content) {
            log::debug!("{}: done marker observed", stream_id);
            break;
        }

        tokio::time::sleep(options.poll_interval).await;
    }

    // One final pass catches content written after the last poll but before
    // loop termination.
    if let Ok(conversation) = source.fetch_conversation(conversation_id).await {
        if let Some(content) = locate_content(&conversation, message_id) {
            match diff_step(&last_observed, &content) {
                Step::Unchanged => {}
                Step::Append(suffix) => {
                    seq += 1;
                    let _ = tx.send(suffix.clone()).await;
                    registry
                        .update_progress(stream_id, Some(seq), None, &suffix)
                        .await;
                }
                Step::Replace(full) => {
                    seq += 1;
                    let _ = tx.send(format!("{}{}", DIVERGENCE_SEPARATOR, full)).await;
                    registry
                        .update_progress(stream_id, Some(seq), Some(full), "")
                        .await;
                }
            }
        }
    }
}

/// Register a stream and spawn its reconciliation loop. Returns the stream id
/// and the delta receiver; the registry entry is unregistered when the loop
/// exits (subject to the preserve-while-backgrounded rule).
pub async fn start_stream<S: ConversationSource + 'static>(
    source: Arc<S>,
    registry: StreamRegistry,
    conversation_id: String,
    message_id: String,
    session_id: String,
    options: StreamOptions,
    recovery: Option<RecoveryCallback>,
) -> (String, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(64);
    let cancel_flag = Arc::new(AtomicBool::new(false));
    let metadata = StreamMetadata::new(&conversation_id, &message_id, &session_id);
    let stream_id = registry
        .register(None, cancel_flag.clone(), recovery, Some(metadata))
        .await;

    let task = {
        let registry = registry.clone();
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            run_reconcile_loop(
                source.as_ref(),
                &registry,
                &stream_id,
                &conversation_id,
                &message_id,
                &cancel_flag,
                options,
                tx,
            )
            .await;
            registry.unregister(&stream_id, false).await;
        })
    };
    registry.attach_task(&stream_id, task).await;
    (stream_id, rx)
}
