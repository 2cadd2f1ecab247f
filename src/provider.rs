use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tracing::{info, warn};

/// Normalized result of one playback attempt, regardless of how the
/// underlying integration signals completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Completed,
    /// Playback ended before the minimum watch time, or the integration
    /// reported a failure.
    Incomplete {
        watched: Duration,
        minimum: Duration,
    },
    /// Neither callback fired before the watchdog elapsed.
    TimedOut,
    /// The integration's entry point was not callable at invocation time.
    NotReady,
}

/// Entry point of an awaited-style integration: invoke, await the outcome.
pub type AwaitedEntry = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Entry point of a callback-style integration: it receives the latch and
/// eventually signals success or failure on it, at most once.
pub type CallbackEntry = Arc<dyn Fn(Arc<CompletionLatch>) + Send + Sync>;

/// One ad provider integration behind the normalized attempt contract.
#[async_trait]
pub trait AdProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Whether the integration's entry point is installed and callable.
    fn is_ready(&self) -> bool;

    /// Run one playback attempt and normalize its completion signal.
    /// No crediting happens here; that is the caller's job.
    async fn attempt(&self, minimum_watch: Duration) -> WatchOutcome;
}

/// One-shot completion latch shared between a callback pair and the
/// watchdog. The first writer wins; every later signal is a no-op, so a
/// callback firing after the watchdog (or a double-fire) can never produce a
/// second outcome.
pub struct CompletionLatch {
    slot: Mutex<Option<oneshot::Sender<bool>>>,
}

impl CompletionLatch {
    fn new() -> (Arc<Self>, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                slot: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub fn success(&self) {
        self.resolve(true);
    }

    pub fn failure(&self) {
        self.resolve(false);
    }

    fn resolve(&self, completed: bool) {
        if let Ok(mut slot) = self.slot.lock() {
            if let Some(tx) = slot.take() {
                // The receiver may already be gone (watchdog won); that is a
                // normal no-op.
                let _ = tx.send(completed);
            }
        }
    }
}

/// Watchdog for callback-style integrations: generous floor, scaled up for
/// long minimum watch times so a slow ad is not misreported as a timeout.
pub fn watchdog_for(minimum_watch: Duration) -> Duration {
    const FLOOR: Duration = Duration::from_secs(15);
    let padded = minimum_watch + Duration::from_secs(5);
    if padded > FLOOR {
        padded
    } else {
        FLOOR
    }
}

/// Integration whose entry point is invoked and awaited. Elapsed wall-clock
/// time is checked against the minimum watch time: an error-free return that
/// came back too fast still counts as a skipped ad.
pub struct AwaitedProvider {
    id: String,
    entry: RwLock<Option<AwaitedEntry>>,
}

impl AwaitedProvider {
    /// A provider whose integration has not finished loading yet.
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entry: RwLock::new(None),
        }
    }

    pub fn with_entry(id: impl Into<String>, entry: AwaitedEntry) -> Self {
        Self {
            id: id.into(),
            entry: RwLock::new(Some(entry)),
        }
    }

    /// Stand-in integration that plays for a fixed duration and completes.
    /// Used where no vendor SDK bridge is wired in (local runs, tests).
    pub fn with_playback(id: impl Into<String>, playback: Duration) -> Self {
        let entry: AwaitedEntry = Arc::new(move || {
            Box::pin(async move {
                time::sleep(playback).await;
                Ok(())
            })
        });
        Self::with_entry(id, entry)
    }

    /// Install the entry point once the integration has loaded.
    pub fn install(&self, entry: AwaitedEntry) {
        if let Ok(mut slot) = self.entry.write() {
            *slot = Some(entry);
        }
    }

    fn entry(&self) -> Option<AwaitedEntry> {
        self.entry.read().ok().and_then(|slot| slot.clone())
    }
}

#[async_trait]
impl AdProvider for AwaitedProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn is_ready(&self) -> bool {
        self.entry().is_some()
    }

    async fn attempt(&self, minimum_watch: Duration) -> WatchOutcome {
        // Readiness can change between the admission check and this call.
        let Some(entry) = self.entry() else {
            return WatchOutcome::NotReady;
        };

        let started = Instant::now();
        match entry().await {
            Ok(()) => {
                let watched = started.elapsed();
                if watched < minimum_watch {
                    WatchOutcome::Incomplete {
                        watched,
                        minimum: minimum_watch,
                    }
                } else {
                    WatchOutcome::Completed
                }
            }
            Err(err) => {
                warn!("Ad playback failed for {}: {}", self.id, err);
                WatchOutcome::Incomplete {
                    watched: started.elapsed(),
                    minimum: minimum_watch,
                }
            }
        }
    }
}

/// Integration that signals through a success/failure callback pair. A
/// watchdog is armed at invocation; whichever of callback and watchdog fires
/// first decides the outcome.
pub struct CallbackProvider {
    id: String,
    entry: RwLock<Option<CallbackEntry>>,
}

impl CallbackProvider {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entry: RwLock::new(None),
        }
    }

    pub fn with_entry(id: impl Into<String>, entry: CallbackEntry) -> Self {
        Self {
            id: id.into(),
            entry: RwLock::new(Some(entry)),
        }
    }

    /// Stand-in integration that reports success after a fixed playback
    /// duration.
    pub fn with_playback(id: impl Into<String>, playback: Duration) -> Self {
        let entry: CallbackEntry = Arc::new(move |latch: Arc<CompletionLatch>| {
            tokio::spawn(async move {
                time::sleep(playback).await;
                latch.success();
            });
        });
        Self::with_entry(id, entry)
    }

    pub fn install(&self, entry: CallbackEntry) {
        if let Ok(mut slot) = self.entry.write() {
            *slot = Some(entry);
        }
    }

    fn entry(&self) -> Option<CallbackEntry> {
        self.entry.read().ok().and_then(|slot| slot.clone())
    }
}

#[async_trait]
impl AdProvider for CallbackProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn is_ready(&self) -> bool {
        self.entry().is_some()
    }

    async fn attempt(&self, minimum_watch: Duration) -> WatchOutcome {
        let Some(entry) = self.entry() else {
            return WatchOutcome::NotReady;
        };

        let (latch, fired) = CompletionLatch::new();
        let started = Instant::now();
        entry(latch);

        let watchdog = watchdog_for(minimum_watch);
        tokio::select! {
            outcome = fired => match outcome {
                Ok(true) => WatchOutcome::Completed,
                // Failure callback, or the integration dropped the latch
                // without ever signalling.
                Ok(false) | Err(_) => WatchOutcome::Incomplete {
                    watched: started.elapsed(),
                    minimum: minimum_watch,
                },
            },
            _ = time::sleep(watchdog) => {
                warn!("Watchdog fired for {} after {:?}", self.id, watchdog);
                WatchOutcome::TimedOut
            }
        }
    }
}

/// Registry of the provider integrations installed in this session, keyed by
/// provider id.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn AdProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn AdProvider>) {
        info!("Registered ad provider: {}", provider.provider_id());
        self.providers
            .insert(provider.provider_id().to_string(), provider);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn AdProvider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn is_ready(&self, provider_id: &str) -> bool {
        self.providers
            .get(provider_id)
            .is_some_and(|provider| provider.is_ready())
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_floor_and_scaling() {
        assert_eq!(watchdog_for(Duration::from_secs(5)), Duration::from_secs(15));
        assert_eq!(watchdog_for(Duration::from_secs(0)), Duration::from_secs(15));
        assert_eq!(watchdog_for(Duration::from_secs(30)), Duration::from_secs(35));
    }

    #[tokio::test]
    async fn latch_first_writer_wins() {
        let (latch, fired) = CompletionLatch::new();
        latch.success();
        latch.failure();
        latch.success();
        assert_eq!(fired.await, Ok(true));
    }

    #[tokio::test(start_paused = true)]
    async fn awaited_playback_shorter_than_minimum_is_incomplete() {
        let provider = AwaitedProvider::with_playback("adexora", Duration::from_secs(2));
        let outcome = provider.attempt(Duration::from_secs(5)).await;
        assert!(matches!(outcome, WatchOutcome::Incomplete { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn awaited_playback_meeting_minimum_completes() {
        let provider = AwaitedProvider::with_playback("adexora", Duration::from_secs(5));
        let outcome = provider.attempt(Duration::from_secs(5)).await;
        assert_eq!(outcome, WatchOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn awaited_entry_error_is_incomplete() {
        let entry: AwaitedEntry =
            Arc::new(|| Box::pin(async { Err(anyhow::anyhow!("sdk rejected the request")) }));
        let provider = AwaitedProvider::with_entry("adexora", entry);
        let outcome = provider.attempt(Duration::from_secs(5)).await;
        assert!(matches!(outcome, WatchOutcome::Incomplete { .. }));
    }

    #[tokio::test]
    async fn missing_entry_reports_not_ready() {
        let provider = AwaitedProvider::pending("adexora");
        assert!(!provider.is_ready());
        assert_eq!(provider.attempt(Duration::from_secs(5)).await, WatchOutcome::NotReady);

        let callback = CallbackProvider::pending("adextra");
        assert!(!callback.is_ready());
        assert_eq!(callback.attempt(Duration::from_secs(5)).await, WatchOutcome::NotReady);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_success_completes() {
        let provider = CallbackProvider::with_playback("adextra", Duration::from_secs(6));
        let outcome = provider.attempt(Duration::from_secs(5)).await;
        assert_eq!(outcome, WatchOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_failure_is_incomplete() {
        let provider = CallbackProvider::with_entry(
            "adextra",
            Arc::new(|latch: Arc<CompletionLatch>| {
                latch.failure();
            }),
        );
        let outcome = provider.attempt(Duration::from_secs(5)).await;
        assert!(matches!(outcome, WatchOutcome::Incomplete { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_callback_provider_times_out() {
        // The entry keeps the latch alive but never signals; only the
        // watchdog can resolve the attempt.
        let held: Arc<Mutex<Vec<Arc<CompletionLatch>>>> = Arc::new(Mutex::new(Vec::new()));
        let held_by_entry = Arc::clone(&held);
        let provider = CallbackProvider::with_entry(
            "adextra",
            Arc::new(move |latch: Arc<CompletionLatch>| {
                held_by_entry.lock().unwrap().push(latch);
            }),
        );

        let outcome = provider.attempt(Duration::from_secs(5)).await;
        assert_eq!(outcome, WatchOutcome::TimedOut);

        // A late callback after the watchdog is a silent no-op.
        held.lock().unwrap()[0].success();
    }

    #[tokio::test(start_paused = true)]
    async fn late_installed_entry_flips_readiness() {
        let provider = AwaitedProvider::pending("gigapub");
        assert!(!provider.is_ready());

        let entry: AwaitedEntry = Arc::new(|| {
            Box::pin(async {
                time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
        });
        provider.install(entry);
        assert!(provider.is_ready());
        assert_eq!(provider.attempt(Duration::from_secs(5)).await, WatchOutcome::Completed);
    }
}
