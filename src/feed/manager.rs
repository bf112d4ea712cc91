use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use url::Url;

use super::synthetic::SyntheticParams;
use super::transport::FeedConnector;
use super::worker::{run_worker, wait_finished, Signals, WorkerContext};
use crate::event::AppEvent;
use crate::model::subscription::{ConnectionState, FeedMode, Subscription};
use crate::price_store::PriceStore;
use crate::schedule::{Clock, MarketSchedule};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub ws_url: Url,
    pub liveness_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub reconnect_factor: f64,
    pub synthetic: SyntheticParams,
    /// Run the synthetic generator even while the session is open.
    pub force_synthetic: bool,
    /// Upper bound on a single outbound frame or socket close.
    pub write_timeout: Duration,
}

impl FeedSettings {
    pub fn new(ws_url: Url) -> Self {
        Self {
            ws_url,
            liveness_timeout: Duration::from_secs(20),
            reconnect_initial: Duration::from_millis(1500),
            reconnect_max: Duration::from_secs(30),
            reconnect_factor: 2.0,
            synthetic: SyntheticParams::default(),
            force_synthetic: false,
            write_timeout: Duration::from_secs(2),
        }
    }

    /// How long a stopped worker gets to finish teardown before it is aborted.
    pub fn stop_grace(&self) -> Duration {
        self.write_timeout * 3
    }

    /// Stream endpoint for a source; the source travels as a query parameter.
    pub fn stream_url(&self, source: &str) -> Url {
        let mut url = self.ws_url.clone();
        url.query_pairs_mut().append_pair("source", source);
        url
    }
}

/// Mode the feed should run in at `now`.
pub fn select_mode(
    schedule: &MarketSchedule,
    now: chrono::DateTime<chrono::Utc>,
    force_synthetic: bool,
) -> FeedMode {
    if force_synthetic || !schedule.is_open(now) {
        FeedMode::Synthetic
    } else {
        FeedMode::Live
    }
}

struct WorkerHandle {
    id: u64,
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConnectionState>,
    finished_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

/// A stopped worker whose teardown has not finished yet.
struct Closing {
    id: u64,
    finished_rx: watch::Receiver<bool>,
}

#[derive(Default)]
struct Registry {
    active: HashMap<Subscription, WorkerHandle>,
    closing: HashMap<Subscription, Closing>,
    next_id: u64,
}

/// Keeps the [`PriceStore`] current for a dynamic set of subscriptions.
///
/// Each subscription runs in its own task. A scheduler task flips every worker
/// between the live feed and the synthetic generator at session boundaries.
pub struct TickStreamManager {
    settings: Arc<FeedSettings>,
    schedule: MarketSchedule,
    clock: Arc<dyn Clock>,
    connector: Arc<dyn FeedConnector>,
    store: Arc<PriceStore>,
    events: broadcast::Sender<AppEvent>,
    mode_tx: Arc<watch::Sender<FeedMode>>,
    resync: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    registry: Mutex<Registry>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl TickStreamManager {
    /// Build the manager and start its schedule task. Must be called inside a tokio runtime.
    pub fn spawn(
        settings: FeedSettings,
        schedule: MarketSchedule,
        connector: Arc<dyn FeedConnector>,
        store: Arc<PriceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let initial_mode = select_mode(&schedule, clock.now(), settings.force_synthetic);
        let (mode_tx, _) = watch::channel(initial_mode);
        let mode_tx = Arc::new(mode_tx);
        let resync = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            mode = ?initial_mode,
            timezone = %schedule.timezone(),
            force_synthetic = settings.force_synthetic,
            "Starting tick stream manager"
        );

        let scheduler = tokio::spawn(run_mode_scheduler(
            schedule,
            clock.clone(),
            settings.force_synthetic,
            mode_tx.clone(),
            resync.clone(),
            shutdown_rx,
            events.clone(),
        ));

        Self {
            settings: Arc::new(settings),
            schedule,
            clock,
            connector,
            store,
            events,
            mode_tx,
            resync,
            shutdown_tx,
            registry: Mutex::new(Registry::default()),
            scheduler: Mutex::new(Some(scheduler)),
        }
    }

    /// Start streaming `symbol` from `source`. Returns false if it was already
    /// active or the manager is shutting down.
    ///
    /// If the same subscription is still tearing down, the new worker waits for
    /// it to finish before connecting.
    pub fn subscribe(&self, symbol: &str, source: &str) -> bool {
        let subscription = Subscription::new(symbol, source);
        if subscription.symbol.is_empty() {
            return false;
        }

        let mut registry = self.registry.lock();
        if *self.shutdown_tx.borrow() || registry.active.contains_key(&subscription) {
            return false;
        }
        let previous = match registry.closing.get(&subscription) {
            Some(closing) if closing.finished_rx.has_changed().is_ok() => {
                Some(closing.finished_rx.clone())
            }
            Some(_) => {
                registry.closing.remove(&subscription);
                None
            }
            None => None,
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (finished_tx, finished_rx) = watch::channel(false);
        let ctx = WorkerContext {
            subscription: subscription.clone(),
            settings: self.settings.clone(),
            connector: self.connector.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            events: self.events.clone(),
            state_tx,
        };
        let signals = Signals {
            stop_rx,
            mode_rx: self.mode_tx.subscribe(),
        };
        let task = tokio::spawn(async move {
            let _finished = finished_tx;
            run_worker(ctx, signals, previous).await;
        });
        registry.next_id += 1;
        let id = registry.next_id;
        tracing::info!(subscription = %subscription, "Subscription registered");
        registry.active.insert(
            subscription,
            WorkerHandle {
                id,
                stop_tx,
                state_rx,
                finished_rx,
                task,
            },
        );
        true
    }

    /// Stop streaming and release the subscription. Unknown or already-closed
    /// subscriptions are a no-op returning false.
    ///
    /// Returns once the worker has finished or was aborted after the stop grace.
    pub async fn unsubscribe(&self, symbol: &str, source: &str) -> bool {
        let subscription = Subscription::new(symbol, source);
        let handle = {
            let mut registry = self.registry.lock();
            let handle = registry.active.remove(&subscription);
            if let Some(handle) = &handle {
                registry.closing.insert(
                    subscription.clone(),
                    Closing {
                        id: handle.id,
                        finished_rx: handle.finished_rx.clone(),
                    },
                );
            }
            handle
        };
        let Some(handle) = handle else {
            return false;
        };

        let id = handle.id;
        close_worker(&subscription, handle, self.settings.stop_grace()).await;
        let mut registry = self.registry.lock();
        if registry.closing.get(&subscription).map(|c| c.id) == Some(id) {
            registry.closing.remove(&subscription);
        }
        true
    }

    /// Bring the active set for `source` in line with `required`.
    /// Returns the symbols that were added and removed.
    pub async fn reconcile(
        &self,
        required: &BTreeSet<String>,
        source: &str,
    ) -> (Vec<String>, Vec<String>) {
        let source = source.trim();
        let stale: Vec<String> = self
            .subscriptions()
            .into_iter()
            .filter(|s| s.source == source && !required.contains(&s.symbol))
            .map(|s| s.symbol)
            .collect();

        let mut removed = Vec::new();
        for symbol in stale {
            if self.unsubscribe(&symbol, source).await {
                removed.push(symbol);
            }
        }

        let mut added = Vec::new();
        for symbol in required {
            if self.subscribe(symbol, source) {
                added.push(symbol.clone());
            }
        }
        (added, removed)
    }

    /// Re-derive the feed mode from the current time, e.g. after the host woke up
    /// and scheduled timers may have been delayed.
    pub fn resync(&self) {
        self.resync.notify_one();
    }

    /// Cancel every subscription and the scheduler. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (drained, closing) = {
            let mut registry = self.registry.lock();
            self.shutdown_tx.send_replace(true);
            let drained: Vec<(Subscription, WorkerHandle)> = registry.active.drain().collect();
            let closing: Vec<Closing> = registry.closing.drain().map(|(_, c)| c).collect();
            (drained, closing)
        };
        let grace = self.settings.stop_grace();
        for (subscription, handle) in drained {
            close_worker(&subscription, handle, grace).await;
        }
        // Workers stopped by a concurrent unsubscribe are bounded by that call.
        for mut closing in closing {
            let _ = tokio::time::timeout(grace, wait_finished(&mut closing.finished_rx)).await;
        }
        let scheduler = self.scheduler.lock().take();
        if let Some(task) = scheduler {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Mode scheduler ended abnormally");
            }
        }
        tracing::info!("Tick stream manager stopped");
    }

    pub fn latest_price(&self, symbol: &str) -> Option<f64> {
        self.store.get(symbol)
    }

    pub fn store(&self) -> &Arc<PriceStore> {
        &self.store
    }

    pub fn mode(&self) -> FeedMode {
        *self.mode_tx.borrow()
    }

    pub fn schedule(&self) -> &MarketSchedule {
        &self.schedule
    }

    pub fn state(&self, symbol: &str, source: &str) -> Option<ConnectionState> {
        let subscription = Subscription::new(symbol, source);
        self.registry
            .lock()
            .active
            .get(&subscription)
            .map(|h| *h.state_rx.borrow())
    }

    /// Active subscriptions in deterministic order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut out: Vec<Subscription> = self.registry.lock().active.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn events(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<AppEvent> {
        self.events.clone()
    }
}

async fn close_worker(subscription: &Subscription, handle: WorkerHandle, grace: Duration) {
    handle.stop_tx.send_replace(true);
    let mut task = handle.task;
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(subscription = %subscription, error = %e, "Worker ended abnormally");
        }
        Err(_) => {
            tracing::warn!(
                subscription = %subscription,
                grace_ms = grace.as_millis() as u64,
                "Worker did not stop in time, aborting"
            );
            task.abort();
            let _ = task.await;
        }
    }
}

async fn run_mode_scheduler(
    schedule: MarketSchedule,
    clock: Arc<dyn Clock>,
    force_synthetic: bool,
    mode_tx: Arc<watch::Sender<FeedMode>>,
    resync: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
    events: broadcast::Sender<AppEvent>,
) {
    loop {
        let now = clock.now();
        let mode = select_mode(&schedule, now, force_synthetic);
        let changed = mode_tx.send_if_modified(|current| {
            if *current == mode {
                false
            } else {
                *current = mode;
                true
            }
        });
        if changed {
            tracing::info!(mode = ?mode, at = %now, "Feed mode switched");
            let _ = events.send(AppEvent::ModeChanged(mode));
        }

        let next = schedule.next_boundary(now);
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!(next_boundary = %next, delay_secs = delay.as_secs(), "Scheduled next mode check");

        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = resync.notified() => {
                tracing::info!("Resynchronizing feed mode");
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
