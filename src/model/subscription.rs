use std::fmt;

/// One logical stream: a symbol fed by a named data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subscription {
    pub symbol: String,
    pub source: String,
}

impl Subscription {
    pub fn new(symbol: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into().trim().to_string(),
            source: source.into().trim().to_string(),
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.source)
    }
}

/// Connection lifecycle of a single subscription.
///
/// `Idle -> Connecting -> Open -> AwaitingLiveness -> (Open | Reconnecting) -> Closed`.
/// A subscription running on the synthetic generator sits in `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    AwaitingLiveness,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::AwaitingLiveness => "awaiting_liveness",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

/// Where ticks come from right now. Shared by every subscription of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Live,
    Synthetic,
}
