use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::model::tick::Tick;

/// Anything that can answer "what is the latest price of this symbol".
pub trait PriceLookup {
    fn price(&self, symbol: &str) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

/// Point-in-time copy of the store.
///
/// Each entry is the latest price seen for that symbol; entries for different
/// symbols may have been observed at different instants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceSnapshot {
    prices: HashMap<String, PricePoint>,
}

impl PriceSnapshot {
    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.prices.get(symbol).map(|p| p.price)
    }

    pub fn point(&self, symbol: &str) -> Option<PricePoint> {
        self.prices.get(symbol).copied()
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.prices.keys().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for PriceSnapshot {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        let observed_at = Utc::now();
        Self {
            prices: iter
                .into_iter()
                .map(|(symbol, price)| (symbol.into(), PricePoint { price, observed_at }))
                .collect(),
        }
    }
}

impl PriceLookup for PriceSnapshot {
    fn price(&self, symbol: &str) -> Option<f64> {
        self.get(symbol)
    }
}

impl PriceLookup for HashMap<String, f64> {
    fn price(&self, symbol: &str) -> Option<f64> {
        self.get(symbol).copied()
    }
}

/// Latest observed price per symbol, shared between stream workers and evaluators.
///
/// Writes are last-writer-wins with no timestamp ordering: a late tick can replace
/// a newer one. Readers take a short read lock and copy out.
#[derive(Debug, Default)]
pub struct PriceStore {
    prices: RwLock<HashMap<String, PricePoint>>,
}

impl PriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, symbol: &str, price: f64, observed_at: DateTime<Utc>) {
        let point = PricePoint { price, observed_at };
        let mut prices = self.prices.write();
        match prices.get_mut(symbol) {
            Some(existing) => *existing = point,
            None => {
                prices.insert(symbol.to_string(), point);
            }
        }
    }

    pub fn apply(&self, tick: &Tick) {
        self.update(&tick.symbol, tick.price, tick.observed_at);
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.prices.read().get(symbol).map(|p| p.price)
    }

    pub fn point(&self, symbol: &str) -> Option<PricePoint> {
        self.prices.read().get(symbol).copied()
    }

    pub fn snapshot(&self) -> PriceSnapshot {
        PriceSnapshot {
            prices: self.prices.read().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.prices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.read().is_empty()
    }
}

impl PriceLookup for PriceStore {
    fn price(&self, symbol: &str) -> Option<f64> {
        self.get(symbol)
    }
}
