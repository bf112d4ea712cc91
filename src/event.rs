use crate::model::subscription::{ConnectionState, FeedMode, Subscription};
use crate::model::tick::Tick;

/// Change notifications for the presentation layer.
#[derive(Debug, Clone)]
pub enum AppEvent {
    PriceUpdated(Tick),
    ConnectionState {
        subscription: Subscription,
        state: ConnectionState,
    },
    Reconnecting {
        subscription: Subscription,
        attempt: u32,
        delay_ms: u64,
    },
    ModeChanged(FeedMode),
    EvaluationChanged {
        satisfied: bool,
    },
}
