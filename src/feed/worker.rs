//! Per-subscription task: live connection state machine or synthetic generator,
//! depending on the manager's current [`FeedMode`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use super::backoff::ExponentialBackoff;
use super::manager::FeedSettings;
use super::synthetic::SyntheticWalk;
use super::transport::{FeedConnector, FeedMessage, FeedTransport};
use super::wire::{parse_inbound, ControlFrame, Inbound};
use crate::event::AppEvent;
use crate::model::subscription::{ConnectionState, FeedMode, Subscription};
use crate::model::tick::Tick;
use crate::price_store::PriceStore;
use crate::schedule::Clock;

pub(crate) struct WorkerContext {
    pub subscription: Subscription,
    pub settings: Arc<FeedSettings>,
    pub connector: Arc<dyn FeedConnector>,
    pub store: Arc<PriceStore>,
    pub clock: Arc<dyn Clock>,
    pub events: broadcast::Sender<AppEvent>,
    pub state_tx: watch::Sender<ConnectionState>,
}

impl WorkerContext {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous == state {
            return;
        }
        tracing::debug!(
            subscription = %self.subscription,
            from = previous.as_str(),
            to = state.as_str(),
            "Connection state changed"
        );
        let _ = self.events.send(AppEvent::ConnectionState {
            subscription: self.subscription.clone(),
            state,
        });
    }

    fn publish_tick(&self, tick: Tick) {
        self.store.apply(&tick);
        let _ = self.events.send(AppEvent::PriceUpdated(tick));
    }
}

/// Why a mode runner returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stopped,
    ModeChanged,
}

enum SessionEnd {
    Interrupted(Exit),
    Lost(anyhow::Error),
}

pub(crate) struct Signals {
    pub stop_rx: watch::Receiver<bool>,
    pub mode_rx: watch::Receiver<FeedMode>,
}

impl Signals {
    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Resolves once the worker is stopped or the feed mode moves away from `mode`.
    /// Stop wins when both are pending.
    async fn interrupted(&mut self, mode: FeedMode) -> Exit {
        tokio::select! {
            biased;
            _ = wait_stopped(&mut self.stop_rx) => Exit::Stopped,
            _ = wait_mode_change(&mut self.mode_rx, mode) => Exit::ModeChanged,
        }
    }
}

async fn wait_stopped(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        // A dropped sender means the owning handle is gone.
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_mode_change(mode_rx: &mut watch::Receiver<FeedMode>, current: FeedMode) {
    loop {
        if *mode_rx.borrow_and_update() != current {
            return;
        }
        if mode_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub(crate) async fn run_worker(
    ctx: WorkerContext,
    mut signals: Signals,
    previous: Option<watch::Receiver<bool>>,
) {
    // A resubscribe waits for the previous worker of the same key to finish its teardown.
    if let Some(mut previous) = previous {
        tokio::select! {
            biased;
            _ = wait_stopped(&mut signals.stop_rx) => {}
            _ = wait_finished(&mut previous) => {}
        }
    }
    loop {
        if signals.is_stopped() {
            break;
        }
        let mode = *signals.mode_rx.borrow_and_update();
        let exit = match mode {
            FeedMode::Live => run_live(&ctx, &mut signals).await,
            FeedMode::Synthetic => run_synthetic(&ctx, &mut signals).await,
        };
        if exit == Exit::Stopped {
            break;
        }
        tracing::info!(subscription = %ctx.subscription, "Feed mode changed, switching source");
    }
    ctx.set_state(ConnectionState::Closed);
    tracing::info!(subscription = %ctx.subscription, "Subscription closed");
}

/// Resolves once the worker owning the paired sender has ended.
pub(crate) async fn wait_finished(finished: &mut watch::Receiver<bool>) {
    while finished.changed().await.is_ok() {}
}

/// Send with the configured write bound.
async fn send_bounded(
    transport: &mut dyn FeedTransport,
    text: String,
    limit: Duration,
) -> anyhow::Result<()> {
    match tokio::time::timeout(limit, transport.send_text(text)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("send timed out after {}ms", limit.as_millis())),
    }
}

async fn close_bounded(ctx: &WorkerContext, transport: &mut dyn FeedTransport) {
    let limit = ctx.settings.write_timeout;
    if tokio::time::timeout(limit, transport.close()).await.is_err() {
        tracing::debug!(subscription = %ctx.subscription, "Close timed out, dropping connection");
    }
}

async fn run_synthetic(ctx: &WorkerContext, signals: &mut Signals) -> Exit {
    ctx.set_state(ConnectionState::Idle);
    let params = &ctx.settings.synthetic;
    let mut walk = SyntheticWalk::new(params);
    let mut ticker = tokio::time::interval_at(Instant::now() + params.interval, params.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tracing::info!(subscription = %ctx.subscription, "Synthetic generator started");

    loop {
        tokio::select! {
            biased;
            exit = signals.interrupted(FeedMode::Synthetic) => {
                tracing::info!(subscription = %ctx.subscription, "Synthetic generator stopped");
                return exit;
            }
            _ = ticker.tick() => {
                let price = walk.next_price();
                ctx.publish_tick(Tick::synthetic(ctx.subscription.symbol.clone(), price, ctx.clock.now()));
            }
        }
    }
}

async fn run_live(ctx: &WorkerContext, signals: &mut Signals) -> Exit {
    let settings = &ctx.settings;
    let mut backoff = ExponentialBackoff::new(
        settings.reconnect_initial,
        settings.reconnect_max,
        settings.reconnect_factor,
    );
    let mut attempt: u32 = 0;

    loop {
        if signals.is_stopped() {
            return Exit::Stopped;
        }
        ctx.set_state(ConnectionState::Connecting);
        let url = settings.stream_url(&ctx.subscription.source);
        tracing::debug!(subscription = %ctx.subscription, url = %url, "Connecting");

        let connected = tokio::select! {
            biased;
            exit = signals.interrupted(FeedMode::Live) => return exit,
            result = ctx.connector.connect(url) => result,
        };

        let failure = match connected {
            Err(e) => e,
            Ok(mut transport) => {
                let subscribe = ControlFrame::subscribe(&ctx.subscription).to_json();
                let sent = tokio::select! {
                    biased;
                    exit = signals.interrupted(FeedMode::Live) => Err(exit),
                    result = send_bounded(transport.as_mut(), subscribe, settings.write_timeout) => Ok(result),
                };
                match sent {
                    Err(exit) => {
                        close_bounded(ctx, transport.as_mut()).await;
                        return exit;
                    }
                    Ok(Err(e)) => {
                        close_bounded(ctx, transport.as_mut()).await;
                        e.context("subscribe failed")
                    }
                    Ok(Ok(())) => {
                        ctx.set_state(ConnectionState::Open);
                        tracing::info!(subscription = %ctx.subscription, "Subscribed to live feed");
                        backoff.reset();
                        attempt = 0;
                        match run_session(ctx, transport.as_mut(), signals).await {
                            SessionEnd::Interrupted(exit) => {
                                let unsubscribe = ControlFrame::unsubscribe(&ctx.subscription).to_json();
                                if let Err(e) =
                                    send_bounded(transport.as_mut(), unsubscribe, settings.write_timeout).await
                                {
                                    tracing::debug!(subscription = %ctx.subscription, error = %e, "Unsubscribe not delivered");
                                }
                                close_bounded(ctx, transport.as_mut()).await;
                                return exit;
                            }
                            SessionEnd::Lost(e) => {
                                close_bounded(ctx, transport.as_mut()).await;
                                e
                            }
                        }
                    }
                }
            }
        };

        attempt += 1;
        let delay = backoff.next_delay();
        tracing::warn!(
            subscription = %ctx.subscription,
            error = %failure,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Live feed lost, reconnecting"
        );
        ctx.set_state(ConnectionState::Reconnecting);
        let _ = ctx.events.send(AppEvent::Reconnecting {
            subscription: ctx.subscription.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        tokio::select! {
            biased;
            exit = signals.interrupted(FeedMode::Live) => return exit,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Read loop of one open connection.
///
/// Any inbound message re-arms the liveness deadline. The first silent period
/// moves the state to `AwaitingLiveness`; a second consecutive one ends the session.
async fn run_session(
    ctx: &WorkerContext,
    transport: &mut dyn FeedTransport,
    signals: &mut Signals,
) -> SessionEnd {
    let timeout = ctx.settings.liveness_timeout;
    let mut deadline = Instant::now() + timeout;
    let mut awaiting = false;

    loop {
        tokio::select! {
            biased;
            exit = signals.interrupted(FeedMode::Live) => return SessionEnd::Interrupted(exit),
            msg = transport.next_message() => {
                let msg = match msg {
                    None => return SessionEnd::Lost(anyhow!("stream ended")),
                    Some(Err(e)) => return SessionEnd::Lost(e),
                    Some(Ok(msg)) => msg,
                };
                deadline = Instant::now() + timeout;
                if awaiting {
                    awaiting = false;
                    ctx.set_state(ConnectionState::Open);
                }
                if let FeedMessage::Text(text) = msg {
                    if let Err(e) = handle_text(ctx, transport, &text).await {
                        return SessionEnd::Lost(e);
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                if awaiting {
                    return SessionEnd::Lost(anyhow!("no traffic for two liveness intervals"));
                }
                awaiting = true;
                deadline += timeout;
                ctx.set_state(ConnectionState::AwaitingLiveness);
            }
        }
    }
}

async fn handle_text(
    ctx: &WorkerContext,
    transport: &mut dyn FeedTransport,
    text: &str,
) -> anyhow::Result<()> {
    match parse_inbound(text) {
        Ok(Inbound::Heartbeat(style)) => {
            send_bounded(transport, style.pong(), ctx.settings.write_timeout).await?;
        }
        Ok(Inbound::Tick(payload)) => {
            if !payload.symbol.eq_ignore_ascii_case(&ctx.subscription.symbol) {
                tracing::trace!(subscription = %ctx.subscription, symbol = %payload.symbol, "Tick for other symbol");
                return Ok(());
            }
            let observed_at = payload.timestamp.unwrap_or_else(|| ctx.clock.now());
            ctx.publish_tick(Tick::new(
                ctx.subscription.symbol.clone(),
                payload.token,
                payload.price,
                observed_at,
            ));
        }
        Ok(Inbound::Ignored) => {}
        Err(e) => {
            tracing::debug!(subscription = %ctx.subscription, error = %e, "Dropping inbound frame");
        }
    }
    Ok(())
}
