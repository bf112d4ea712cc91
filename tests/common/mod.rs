#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use url::Url;

use tickwatch::event::AppEvent;
use tickwatch::feed::{FeedConnector, FeedMessage, FeedSettings, FeedTransport, TickStreamManager};
use tickwatch::price_store::PriceStore;
use tickwatch::schedule::{Clock, MarketSchedule};

pub const SOURCE: &str = "angel_one";

/// Wall clock that moves with tokio's (possibly paused) clock.
pub struct TestClock {
    anchor: Mutex<(DateTime<Utc>, Instant)>,
}

impl TestClock {
    pub fn starting_at(at: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            anchor: Mutex::new((at, Instant::now())),
        })
    }

    /// Jump the wall clock without advancing tokio timers, as after a host suspend.
    pub fn jump_to(&self, at: DateTime<Utc>) {
        *self.anchor.lock().unwrap() = (at, Instant::now());
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let (base, instant) = *self.anchor.lock().unwrap();
        base + chrono::Duration::from_std(instant.elapsed()).unwrap()
    }
}

pub fn ist(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    chrono_tz::Asia::Kolkata
        .with_ymd_and_hms(y, m, d, h, min, 0)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

/// 2025-01-06 is a Monday.
pub fn monday_ist(h: u32, min: u32) -> DateTime<Utc> {
    ist(2025, 1, 6, h, min)
}

/// Test side of one fake connection.
pub struct FakeConnection {
    pub url: Url,
    pub outbound: mpsc::UnboundedReceiver<String>,
    pub inbound: mpsc::UnboundedSender<FeedMessage>,
    closed: Arc<AtomicBool>,
}

impl FakeConnection {
    pub fn push_text(&self, text: &str) {
        self.inbound
            .send(FeedMessage::Text(text.to_string()))
            .expect("worker dropped the transport");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn next_outbound(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(60), self.outbound.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("transport dropped without sending")
    }

    /// Everything sent until the worker dropped the transport.
    pub async fn drain_outbound(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(frame) = self.outbound.recv().await {
            out.push(frame);
        }
        out
    }
}

/// Switches shared by every transport a connector hands out.
#[derive(Default)]
struct Behavior {
    stall_send: AtomicBool,
    stall_close: AtomicBool,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

struct FakeTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<FeedMessage>,
    closed: Arc<AtomicBool>,
    behavior: Arc<Behavior>,
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        self.behavior.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FeedTransport for FakeTransport {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<()>> {
        async move {
            if self.behavior.stall_send.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(anyhow!("send on closed transport"));
            }
            self.outbound
                .send(text)
                .map_err(|_| anyhow!("peer gone"))
        }
        .boxed()
    }

    fn next_message(&mut self) -> BoxFuture<'_, Option<Result<FeedMessage>>> {
        async move { self.inbound.recv().await.map(Ok) }.boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        async move {
            if self.behavior.stall_close.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.closed.store(true, Ordering::SeqCst);
        }
        .boxed()
    }
}

#[derive(Clone)]
pub struct FakeConnector {
    connections: mpsc::UnboundedSender<FakeConnection>,
    failures_left: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    behavior: Arc<Behavior>,
}

impl FakeConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FakeConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                connections: tx,
                failures_left: Arc::new(AtomicUsize::new(0)),
                attempts: Arc::new(AtomicUsize::new(0)),
                behavior: Arc::new(Behavior::default()),
            },
            rx,
        )
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Make every send on current and future transports hang forever.
    pub fn stall_sends(&self, on: bool) {
        self.behavior.stall_send.store(on, Ordering::SeqCst);
    }

    /// Make every close on current and future transports hang forever.
    pub fn stall_closes(&self, on: bool) {
        self.behavior.stall_close.store(on, Ordering::SeqCst);
    }

    /// Transports handed out and not yet dropped.
    pub fn live_transports(&self) -> usize {
        self.behavior.live.load(Ordering::SeqCst)
    }

    /// Highest number of transports alive at the same time.
    pub fn max_live_transports(&self) -> usize {
        self.behavior.max_live.load(Ordering::SeqCst)
    }
}

impl FeedConnector for FakeConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Box<dyn FeedTransport>>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let connections = self.connections.clone();
        let behavior = self.behavior.clone();
        async move {
            if fail {
                return Err(anyhow!("connection refused"));
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));
            connections
                .send(FakeConnection {
                    url,
                    outbound: out_rx,
                    inbound: in_tx,
                    closed: closed.clone(),
                })
                .map_err(|_| anyhow!("test harness gone"))?;
            let live = behavior.live.fetch_add(1, Ordering::SeqCst) + 1;
            behavior.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(Box::new(FakeTransport {
                outbound: out_tx,
                inbound: in_rx,
                closed,
                behavior,
            }) as Box<dyn FeedTransport>)
        }
        .boxed()
    }
}

pub fn test_settings() -> FeedSettings {
    let mut settings = FeedSettings::new(Url::parse("ws://feed.test/ws").unwrap());
    settings.synthetic.seed = Some(11);
    settings
}

pub struct Harness {
    pub manager: Arc<TickStreamManager>,
    pub connector: FakeConnector,
    pub connections: mpsc::UnboundedReceiver<FakeConnection>,
    pub clock: Arc<TestClock>,
    pub store: Arc<PriceStore>,
    pub events: broadcast::Receiver<AppEvent>,
}

impl Harness {
    pub fn start(at: DateTime<Utc>, settings: FeedSettings) -> Self {
        let (connector, connections) = FakeConnector::new();
        let clock = TestClock::starting_at(at);
        let store = Arc::new(PriceStore::new());
        let manager = Arc::new(TickStreamManager::spawn(
            settings,
            MarketSchedule::nse(),
            Arc::new(connector.clone()),
            store.clone(),
            clock.clone(),
        ));
        let events = manager.events();
        Self {
            manager,
            connector,
            connections,
            clock,
            store,
            events,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn next_connection(&mut self) -> FakeConnection {
        tokio::time::timeout(Duration::from_secs(300), self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// Wait for the first event matching `pred`, skipping others.
    pub async fn wait_event<F>(&mut self, mut pred: F) -> AppEvent
    where
        F: FnMut(&AppEvent) -> bool,
    {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(300), async move {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Events already queued, without waiting.
    pub fn queued_events(&mut self) -> Vec<AppEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}
