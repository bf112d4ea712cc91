use chrono::{DateTime, Utc};

/// Source token stamped on ticks produced by the synthetic generator.
pub const SYNTHETIC_SOURCE_TOKEN: &str = "DUMMY";

#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub source_token: String,
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

impl Tick {
    pub fn new(
        symbol: impl Into<String>,
        source_token: impl Into<String>,
        price: f64,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            source_token: source_token.into(),
            price,
            observed_at,
        }
    }

    /// Create a tick from the synthetic generator (used while the session is closed).
    pub fn synthetic(symbol: impl Into<String>, price: f64, observed_at: DateTime<Utc>) -> Self {
        Self::new(symbol, SYNTHETIC_SOURCE_TOKEN, price, observed_at)
    }

    pub fn is_synthetic(&self) -> bool {
        self.source_token == SYNTHETIC_SOURCE_TOKEN
    }
}
