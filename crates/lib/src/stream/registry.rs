//! Streaming registry: tracks every active delivery stream by id.
//!
//! An explicitly constructed, injectable service (cloneable handle around
//! shared state) rather than a process singleton, so tests can run isolated
//! instances. The registry exclusively owns stream records; the
//! reconciliation loop only pushes progress updates by id, and the lifecycle
//! coordinator only touches suspension flags and retry counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Re-enters the reconciliation loop for an interrupted stream.
pub type RecoveryCallback =
    Arc<dyn Fn(StreamMetadata) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Keeps the host device awake while streams are active. Acquire/release must
/// be idempotent: multiple streams may request the lock concurrently.
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Default wake lock for platforms without one (desktop, tests).
#[derive(Default)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

/// Lifecycle metadata attached to a stream; persisted on detach for recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    pub conversation_id: String,
    pub message_id: String,
    pub session_id: String,
    #[serde(default)]
    pub last_chunk_sequence: u64,
    #[serde(default)]
    pub last_content: String,
    /// Unix seconds of the last progress update.
    #[serde(default)]
    pub last_update: i64,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_at: Option<i64>,
}

impl StreamMetadata {
    pub fn new(
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            session_id: session_id.into(),
            last_chunk_sequence: 0,
            last_content: String::new(),
            last_update: chrono::Utc::now().timestamp(),
            suspended: false,
            suspended_at: None,
        }
    }
}

struct StreamEntry {
    /// The poll task driving this stream (the "subscription").
    task: Option<JoinHandle<()>>,
    /// Cooperative cancellation: the loop checks this each tick.
    cancel_flag: Arc<AtomicBool>,
    recovery: Option<RecoveryCallback>,
    metadata: Option<StreamMetadata>,
    /// Recovery attempts so far; reset on successful recovery.
    attempts: u32,
}

impl StreamEntry {
    /// A stream with a finished (or absent) poll task has no live subscription.
    fn subscription_live(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

struct Inner {
    streams: HashMap<String, StreamEntry>,
    next_id: u64,
    backgrounded: bool,
}

/// Registry of active delivery streams. Clone freely; state is shared.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RwLock<Inner>>,
    wake_lock: Arc<dyn WakeLock>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NoopWakeLock))
    }
}

impl StreamRegistry {
    pub fn new(wake_lock: Arc<dyn WakeLock>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                streams: HashMap::new(),
                next_id: 0,
                backgrounded: false,
            })),
            wake_lock,
        }
    }

    /// Register a new stream; returns its monotonic id. The first active
    /// stream acquires the wake lock so the device does not sleep mid-stream.
    pub async fn register(
        &self,
        task: Option<JoinHandle<()>>,
        cancel_flag: Arc<AtomicBool>,
        recovery: Option<RecoveryCallback>,
        metadata: Option<StreamMetadata>,
    ) -> String {
        let mut g = self.inner.write().await;
        g.next_id += 1;
        let id = format!("stream-{}", g.next_id);
        if g.streams.is_empty() {
            self.wake_lock.acquire();
        }
        g.streams.insert(
            id.clone(),
            StreamEntry {
                task,
                cancel_flag,
                recovery,
                metadata,
                attempts: 0,
            },
        );
        log::debug!("registered {}", id);
        id
    }

    /// Attach the poll task to a stream registered before the task existed.
    pub async fn attach_task(&self, id: &str, task: JoinHandle<()>) {
        if let Some(entry) = self.inner.write().await.streams.get_mut(id) {
            entry.task = Some(task);
        }
    }

    /// Remove a stream — except that while backgrounded, with metadata
    /// present and `save_for_recovery` false, the entry is marked suspended
    /// and preserved instead: network-driven teardown in the background is
    /// indistinguishable from completion, so the registry errs toward
    /// recoverability. `save_for_recovery: true` always removes (the caller
    /// has taken responsibility for the metadata).
    pub async fn unregister(&self, id: &str, save_for_recovery: bool) {
        let mut g = self.inner.write().await;
        let preserve = !save_for_recovery
            && g.backgrounded
            && g.streams
                .get(id)
                .map(|e| e.metadata.is_some())
                .unwrap_or(false);
        if preserve {
            if let Some(entry) = g.streams.get_mut(id) {
                if let Some(meta) = entry.metadata.as_mut() {
                    meta.suspended = true;
                    meta.suspended_at = Some(chrono::Utc::now().timestamp());
                }
                log::debug!("{} suspended for later recovery (backgrounded)", id);
            }
            return;
        }
        if g.streams.remove(id).is_some() {
            log::debug!("unregistered {}", id);
            if g.streams.is_empty() {
                self.wake_lock.release();
            }
        }
    }

    /// Record streaming progress: append a delta (or replace the full
    /// content), bump the chunk sequence, refresh the update stamp, and clear
    /// the suspended flag — an update proves the stream is alive.
    pub async fn update_progress(
        &self,
        id: &str,
        chunk_sequence: Option<u64>,
        content: Option<String>,
        appended: &str,
    ) {
        let mut g = self.inner.write().await;
        let Some(entry) = g.streams.get_mut(id) else {
            return;
        };
        let Some(meta) = entry.metadata.as_mut() else {
            return;
        };
        match content {
            Some(full) => meta.last_content = full,
            None => meta.last_content.push_str(appended),
        }
        meta.last_chunk_sequence = chunk_sequence.unwrap_or(meta.last_chunk_sequence + 1);
        meta.last_update = chrono::Utc::now().timestamp();
        meta.suspended = false;
        meta.suspended_at = None;
    }

    /// Cancel a stream immediately: user-initiated cancellation is always
    /// honored regardless of lifecycle state, bypassing the
    /// preserve-while-backgrounded rule.
    pub async fn cancel(&self, id: &str) {
        let mut g = self.inner.write().await;
        if let Some(entry) = g.streams.remove(id) {
            entry.cancel_flag.store(true, Ordering::SeqCst);
            if let Some(task) = entry.task {
                task.abort();
            }
            log::debug!("cancelled {}", id);
            if g.streams.is_empty() {
                self.wake_lock.release();
            }
        }
    }

    /// Close a stream's subscription (abort the poll task) while keeping the
    /// entry and its metadata. Used on foreground for streams that were
    /// suspended in the background: completion is deferred so UI updates do
    /// not race the transition, and the recovery sweep re-enters the loop.
    pub async fn close_subscription(&self, id: &str) {
        let mut g = self.inner.write().await;
        if let Some(entry) = g.streams.get_mut(id) {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
    }

    pub async fn is_stream_active(&self, id: &str) -> bool {
        self.inner.read().await.streams.contains_key(id)
    }

    pub async fn is_suspended(&self, id: &str) -> bool {
        self.inner
            .read()
            .await
            .streams
            .get(id)
            .and_then(|e| e.metadata.as_ref())
            .map(|m| m.suspended)
            .unwrap_or(false)
    }

    pub async fn metadata(&self, id: &str) -> Option<StreamMetadata> {
        self.inner
            .read()
            .await
            .streams
            .get(id)
            .and_then(|e| e.metadata.clone())
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.streams.len()
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.inner.read().await.streams.keys().cloned().collect()
    }

    pub async fn set_backgrounded(&self, backgrounded: bool) {
        self.inner.write().await.backgrounded = backgrounded;
    }

    pub async fn is_backgrounded(&self) -> bool {
        self.inner.read().await.backgrounded
    }

    /// Mark every stream suspended (connectivity lost: stop treating silence
    /// as failure).
    pub async fn mark_all_suspended(&self) {
        let now = chrono::Utc::now().timestamp();
        let mut g = self.inner.write().await;
        for entry in g.streams.values_mut() {
            if let Some(meta) = entry.metadata.as_mut() {
                meta.suspended = true;
                meta.suspended_at = Some(now);
            }
        }
    }

    /// Ids of streams marked suspended (e.g. while backgrounded); the
    /// coordinator closes these on foreground.
    pub async fn suspended_ids(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .streams
            .iter()
            .filter(|(_, e)| e.metadata.as_ref().map(|m| m.suspended).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Streams eligible for a recovery attempt: a recovery callback is
    /// registered and the subscription is dead or silent past the threshold.
    pub async fn recovery_candidates(
        &self,
        stale_after_secs: i64,
    ) -> Vec<(String, RecoveryCallback, StreamMetadata)> {
        let now = chrono::Utc::now().timestamp();
        let g = self.inner.read().await;
        g.streams
            .iter()
            .filter_map(|(id, entry)| {
                let recovery = entry.recovery.clone()?;
                let meta = entry.metadata.clone()?;
                let silent = now - meta.last_update > stale_after_secs;
                if !entry.subscription_live() || silent {
                    Some((id.clone(), recovery, meta))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Bump and return the stream's recovery attempt counter (1-based).
    pub async fn next_attempt(&self, id: &str) -> Option<u32> {
        let mut g = self.inner.write().await;
        let entry = g.streams.get_mut(id)?;
        entry.attempts += 1;
        Some(entry.attempts)
    }

    /// Reset the attempt counter after a successful recovery.
    pub async fn reset_attempts(&self, id: &str) {
        if let Some(entry) = self.inner.write().await.streams.get_mut(id) {
            entry.attempts = 0;
        }
    }

    /// Snapshot of all metadata records (for persistence on detach).
    pub async fn snapshot(&self) -> Vec<StreamMetadata> {
        self.inner
            .read()
            .await
            .streams
            .values()
            .filter_map(|e| e.metadata.clone())
            .collect()
    }

    /// Tear everything down: abort tasks, clear entries, release the wake lock.
    pub async fn dispose(&self) {
        let mut g = self.inner.write().await;
        let had_streams = !g.streams.is_empty();
        for (_, entry) in g.streams.drain() {
            entry.cancel_flag.store(true, Ordering::SeqCst);
            if let Some(task) = entry.task {
                task.abort();
            }
        }
        if had_streams {
            self.wake_lock.release();
        }
    }
}
