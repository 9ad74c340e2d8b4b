//! Lifecycle & connectivity coordination for active streams.
//!
//! Observes app foreground/background/detach transitions and connectivity
//! changes, suspends streams when the app goes dark, and recovers them with
//! bounded exponential backoff when it comes back. Never mutates stream
//! content — only suspension flags and retry triggers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::RecoveryConfig;
use crate::retry::RetryPolicy;
use crate::stream::{StreamMetadata, StreamRegistry};

/// Application lifecycle signals, as reported by the platform shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Foregrounded,
    Backgrounded,
    /// Process is being torn down; persistence is best-effort.
    Detached,
}

/// Network connectivity signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// OS-level background-execution extension (e.g. iOS background tasks).
/// `extend` returns whether more execution time was granted; the heartbeat
/// re-arms itself while it is.
pub trait BackgroundExtension: Send + Sync {
    fn begin(&self, stream_ids: &[String]);
    fn extend(&self, stream_ids: &[String]) -> bool;
    fn end(&self);
}

/// Default extension for platforms without one.
#[derive(Default)]
pub struct NoopBackgroundExtension;

impl BackgroundExtension for NoopBackgroundExtension {
    fn begin(&self, _stream_ids: &[String]) {}
    fn extend(&self, _stream_ids: &[String]) -> bool {
        true
    }
    fn end(&self) {}
}

/// Write all active stream metadata to a JSON snapshot. Creates parent dirs.
pub fn save_recovery_snapshot(path: &Path, snapshot: &[StreamMetadata]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let s = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, s)?;
    Ok(())
}

/// Load a previously persisted snapshot. Missing or invalid file => empty.
pub fn load_recovery_snapshot(path: &Path) -> Vec<StreamMetadata> {
    let Ok(s) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    serde_json::from_str(&s).unwrap_or_default()
}

/// Coordinates stream suspension and recovery across lifecycle and
/// connectivity transitions.
pub struct LifecycleCoordinator {
    registry: StreamRegistry,
    extension: Arc<dyn BackgroundExtension>,
    policy: RetryPolicy,
    stale_after_secs: i64,
    recovery_path: PathBuf,
    heartbeat_interval: Duration,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleCoordinator {
    pub fn new(
        registry: StreamRegistry,
        extension: Arc<dyn BackgroundExtension>,
        config: &RecoveryConfig,
        recovery_path: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            extension,
            policy: RetryPolicy {
                max_attempts: config.max_attempts,
                base_delay: Duration::from_secs(config.base_delay_secs),
                multiplier: 2,
            },
            stale_after_secs: config.stale_after_secs as i64,
            recovery_path: recovery_path.unwrap_or_else(crate::config::default_recovery_path),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat: Mutex::new(None),
        }
    }

    /// Override the heartbeat interval (default 30s). Used by tests.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub async fn handle_lifecycle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Backgrounded => {
                self.registry.set_backgrounded(true).await;
                let ids = self.registry.active_ids().await;
                if !ids.is_empty() {
                    log::info!("backgrounded with {} active stream(s)", ids.len());
                    self.extension.begin(&ids);
                    self.start_heartbeat().await;
                }
            }
            LifecycleEvent::Foregrounded => {
                self.registry.set_backgrounded(false).await;
                self.stop_heartbeat().await;
                // Streams suspended while backgrounded get their poll tasks
                // closed now, in the foreground, so completion callbacks
                // cannot race the transition; the sweep re-enters the loop.
                for id in self.registry.suspended_ids().await {
                    self.registry.close_subscription(&id).await;
                }
                if self.registry.active_count().await == 0 {
                    self.extension.end();
                }
                self.recovery_sweep().await;
            }
            LifecycleEvent::Detached => {
                let snapshot = self.registry.snapshot().await;
                if !snapshot.is_empty() {
                    if let Err(e) = save_recovery_snapshot(&self.recovery_path, &snapshot) {
                        log::warn!("failed to persist stream snapshot: {}", e);
                    }
                }
                self.stop_heartbeat().await;
                self.registry.dispose().await;
                self.extension.end();
            }
        }
    }

    pub async fn handle_connectivity(&self, event: ConnectivityEvent) {
        match event {
            ConnectivityEvent::Offline => {
                log::info!("offline: suspending all active streams");
                self.registry.mark_all_suspended().await;
            }
            ConnectivityEvent::Online => {
                log::info!("online: sweeping for recoverable streams");
                self.recovery_sweep().await;
            }
        }
    }

    /// One recovery attempt per eligible stream: dead or stale subscriptions
    /// whose recovery callback is registered. Each attempt waits its backoff
    /// delay; a stream past the attempt cap is logged and abandoned (only
    /// `force_recover` touches it afterwards).
    pub async fn recovery_sweep(&self) {
        for (id, recovery, metadata) in self
            .registry
            .recovery_candidates(self.stale_after_secs)
            .await
        {
            let Some(attempt) = self.registry.next_attempt(&id).await else {
                continue;
            };
            let Some(delay) = self.policy.next_delay(attempt) else {
                log::warn!(
                    "{}: recovery attempt cap ({}) exceeded, abandoning",
                    id,
                    self.policy.max_attempts
                );
                continue;
            };
            log::debug!("{}: recovery attempt {} after {:?}", id, attempt, delay);
            tokio::time::sleep(delay).await;
            match recovery(metadata).await {
                Ok(()) => {
                    self.registry.reset_attempts(&id).await;
                    log::info!("{}: recovered", id);
                }
                Err(e) => log::warn!("{}: recovery attempt {} failed: {}", id, attempt, e),
            }
        }
    }

    /// Explicitly recover one stream, ignoring the attempt cap and backoff.
    pub async fn force_recover(&self, id: &str) -> Result<()> {
        let candidates = self.registry.recovery_candidates(0).await;
        let Some((_, recovery, metadata)) = candidates.into_iter().find(|(cid, _, _)| cid == id)
        else {
            anyhow::bail!("{} is not recoverable", id);
        };
        recovery(metadata)
            .await
            .map_err(|e| anyhow::anyhow!("{}: recovery failed: {}", id, e))?;
        self.registry.reset_attempts(id).await;
        Ok(())
    }

    /// Re-arm the background extension and heartbeat for streams registered
    /// after the app was already backgrounded; the `Backgrounded` transition
    /// alone only covers streams that existed at that moment.
    pub async fn refresh_background_extension(&self) {
        if !self.registry.is_backgrounded().await {
            return;
        }
        let ids = self.registry.active_ids().await;
        if !ids.is_empty() {
            self.extension.begin(&ids);
            self.start_heartbeat().await;
        }
    }

    /// Keep the background extension alive while any stream is active and the
    /// app is backgrounded; stops when the extension refuses more time.
    async fn start_heartbeat(&self) {
        let mut guard = self.heartbeat.lock().await;
        if guard.is_some() {
            return;
        }
        let registry = self.registry.clone();
        let extension = self.extension.clone();
        let interval = self.heartbeat_interval;
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !registry.is_backgrounded().await {
                    break;
                }
                let ids = registry.active_ids().await;
                if ids.is_empty() {
                    break;
                }
                if !extension.extend(&ids) {
                    log::debug!("background extension refused more time, stopping heartbeat");
                    break;
                }
            }
        }));
    }

    async fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().await.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::RecoveryCallback;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TrackingExtension {
        begins: AtomicUsize,
        extends: AtomicUsize,
        ends: AtomicUsize,
        grant: AtomicBool,
    }

    impl TrackingExtension {
        fn new() -> Self {
            Self {
                begins: AtomicUsize::new(0),
                extends: AtomicUsize::new(0),
                ends: AtomicUsize::new(0),
                grant: AtomicBool::new(true),
            }
        }
    }

    impl BackgroundExtension for TrackingExtension {
        fn begin(&self, _ids: &[String]) {
            self.begins.fetch_add(1, Ordering::SeqCst);
        }
        fn extend(&self, _ids: &[String]) -> bool {
            self.extends.fetch_add(1, Ordering::SeqCst);
            self.grant.load(Ordering::SeqCst)
        }
        fn end(&self) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig {
            max_attempts: 3,
            base_delay_secs: 0,
            stale_after_secs: 120,
        }
    }

    fn failing_recovery(counter: Arc<AtomicUsize>) -> RecoveryCallback {
        Arc::new(move |_meta| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("still offline".to_string())
            })
        })
    }

    fn succeeding_recovery(counter: Arc<AtomicUsize>) -> RecoveryCallback {
        Arc::new(move |_meta| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    async fn register_recoverable(
        registry: &StreamRegistry,
        recovery: RecoveryCallback,
    ) -> String {
        registry
            .register(
                None,
                Arc::new(AtomicBool::new(false)),
                Some(recovery),
                Some(StreamMetadata::new("c1", "m1", "s1")),
            )
            .await
    }

    #[tokio::test]
    async fn sweep_stops_after_attempt_cap() {
        let registry = StreamRegistry::default();
        let attempts = Arc::new(AtomicUsize::new(0));
        register_recoverable(&registry, failing_recovery(attempts.clone())).await;

        let coordinator = LifecycleCoordinator::new(
            registry,
            Arc::new(NoopBackgroundExtension),
            &fast_config(),
            Some(std::env::temp_dir().join("skiff-test-none.json")),
        );

        for _ in 0..5 {
            coordinator.recovery_sweep().await;
        }
        // Attempts 1..=3 ran; sweeps 4 and 5 refused a delay and skipped.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn successful_recovery_resets_attempts() {
        let registry = StreamRegistry::default();
        let count = Arc::new(AtomicUsize::new(0));
        let id = register_recoverable(&registry, succeeding_recovery(count.clone())).await;

        let coordinator = LifecycleCoordinator::new(
            registry.clone(),
            Arc::new(NoopBackgroundExtension),
            &fast_config(),
            None,
        );

        for _ in 0..5 {
            coordinator.recovery_sweep().await;
        }
        // Every sweep succeeds and resets the counter, so no cap is hit.
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(registry.next_attempt(&id).await, Some(1));
    }

    #[tokio::test]
    async fn offline_suspends_online_sweeps() {
        let registry = StreamRegistry::default();
        let count = Arc::new(AtomicUsize::new(0));
        let id = register_recoverable(&registry, succeeding_recovery(count.clone())).await;

        let coordinator = LifecycleCoordinator::new(
            registry.clone(),
            Arc::new(NoopBackgroundExtension),
            &fast_config(),
            None,
        );

        coordinator
            .handle_connectivity(ConnectivityEvent::Offline)
            .await;
        assert!(registry.is_suspended(&id).await);

        coordinator
            .handle_connectivity(ConnectivityEvent::Online)
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_begins_extension_foreground_ends_it() {
        let registry = StreamRegistry::default();
        let extension = Arc::new(TrackingExtension::new());
        registry
            .register(None, Arc::new(AtomicBool::new(false)), None, None)
            .await;

        let coordinator = LifecycleCoordinator::new(
            registry.clone(),
            extension.clone(),
            &fast_config(),
            None,
        );

        coordinator
            .handle_lifecycle(LifecycleEvent::Backgrounded)
            .await;
        assert_eq!(extension.begins.load(Ordering::SeqCst), 1);
        assert!(registry.is_backgrounded().await);

        // Remove the stream, then foreground: no active streams => end.
        registry.unregister("stream-1", true).await;
        coordinator
            .handle_lifecycle(LifecycleEvent::Foregrounded)
            .await;
        assert_eq!(extension.ends.load(Ordering::SeqCst), 1);
        assert!(!registry.is_backgrounded().await);
    }

    #[tokio::test]
    async fn heartbeat_extends_while_backgrounded() {
        let registry = StreamRegistry::default();
        let extension = Arc::new(TrackingExtension::new());
        registry
            .register(None, Arc::new(AtomicBool::new(false)), None, None)
            .await;

        let coordinator = LifecycleCoordinator::new(
            registry.clone(),
            extension.clone(),
            &fast_config(),
            None,
        )
        .with_heartbeat_interval(Duration::from_millis(5));

        coordinator
            .handle_lifecycle(LifecycleEvent::Backgrounded)
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(extension.extends.load(Ordering::SeqCst) >= 2);

        coordinator
            .handle_lifecycle(LifecycleEvent::Foregrounded)
            .await;
        let settled = extension.extends.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(extension.extends.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn force_recover_runs_callback_and_rejects_unknown_ids() {
        let registry = StreamRegistry::default();
        let count = Arc::new(AtomicUsize::new(0));
        let id = register_recoverable(&registry, succeeding_recovery(count.clone())).await;

        let coordinator = LifecycleCoordinator::new(
            registry.clone(),
            Arc::new(NoopBackgroundExtension),
            &fast_config(),
            None,
        );

        coordinator.force_recover(&id).await.expect("recoverable");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(coordinator.force_recover("no-such-stream").await.is_err());
    }

    #[tokio::test]
    async fn late_registration_rearms_background_extension() {
        let registry = StreamRegistry::default();
        let extension = Arc::new(TrackingExtension::new());
        let coordinator = LifecycleCoordinator::new(
            registry.clone(),
            extension.clone(),
            &fast_config(),
            None,
        )
        .with_heartbeat_interval(Duration::from_millis(5));

        // Backgrounded with nothing running: no extension, no heartbeat.
        coordinator
            .handle_lifecycle(LifecycleEvent::Backgrounded)
            .await;
        assert_eq!(extension.begins.load(Ordering::SeqCst), 0);

        registry
            .register(None, Arc::new(AtomicBool::new(false)), None, None)
            .await;
        coordinator.refresh_background_extension().await;
        assert_eq!(extension.begins.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(extension.extends.load(Ordering::SeqCst) >= 1);

        coordinator
            .handle_lifecycle(LifecycleEvent::Foregrounded)
            .await;
    }

    #[tokio::test]
    async fn detach_persists_snapshot() {
        let registry = StreamRegistry::default();
        registry
            .register(
                None,
                Arc::new(AtomicBool::new(false)),
                None,
                Some(StreamMetadata::new("c9", "m9", "s9")),
            )
            .await;

        let path = std::env::temp_dir().join(format!(
            "skiff-detach-test-{}.json",
            uuid::Uuid::new_v4()
        ));
        let coordinator = LifecycleCoordinator::new(
            registry.clone(),
            Arc::new(NoopBackgroundExtension),
            &fast_config(),
            Some(path.clone()),
        );

        coordinator.handle_lifecycle(LifecycleEvent::Detached).await;
        let snapshot = load_recovery_snapshot(&path);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].conversation_id, "c9");
        assert_eq!(registry.active_count().await, 0, "registry disposed");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_snapshot_loads_empty() {
        let path = std::env::temp_dir().join("skiff-no-such-snapshot.json");
        assert!(load_recovery_snapshot(&path).is_empty());
    }
}
