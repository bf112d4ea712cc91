use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticParams {
    pub interval: Duration,
    /// Starting price is drawn from `[start_min, start_min + start_span)`.
    pub start_min: f64,
    pub start_span: f64,
    /// Largest absolute change per step.
    pub max_step: f64,
    /// Prices never go below this.
    pub floor: f64,
    pub seed: Option<u64>,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            start_min: 100.0,
            start_span: 50.0,
            max_step: 1.0,
            floor: 10.0,
            seed: None,
        }
    }
}

/// Bounded random walk used as a stand-in price feed outside trading hours.
#[derive(Debug)]
pub struct SyntheticWalk {
    price: f64,
    max_step: f64,
    floor: f64,
    rng: StdRng,
}

impl SyntheticWalk {
    pub fn new(params: &SyntheticParams) -> Self {
        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let floor = params.floor.max(f64::MIN_POSITIVE);
        let start = params.start_min + rng.gen::<f64>() * params.start_span.max(0.0);
        Self {
            price: start.max(floor),
            max_step: params.max_step.abs(),
            floor,
            rng,
        }
    }

    /// Advance one step and return the new price rounded to cents.
    pub fn next_price(&mut self) -> f64 {
        let change = (self.rng.gen::<f64>() - 0.5) * 2.0 * self.max_step;
        self.price = (self.price + change).max(self.floor);
        round_cents(self.price)
    }
}

fn round_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_walk_is_reproducible() {
        let params = SyntheticParams {
            seed: Some(7),
            ..SyntheticParams::default()
        };
        let mut a = SyntheticWalk::new(&params);
        let mut b = SyntheticWalk::new(&params);
        for _ in 0..20 {
            assert_eq!(a.next_price(), b.next_price());
        }
    }

    #[test]
    fn steps_stay_bounded_and_above_floor() {
        let params = SyntheticParams {
            start_min: 11.0,
            start_span: 0.0,
            max_step: 5.0,
            floor: 10.0,
            seed: Some(42),
            ..SyntheticParams::default()
        };
        let mut walk = SyntheticWalk::new(&params);
        let mut prev = 11.0;
        for _ in 0..500 {
            let p = walk.next_price();
            assert!(p >= 10.0, "price {} fell below floor", p);
            assert!((p - prev).abs() <= 5.0 + 0.01);
            assert_eq!(p, round_cents(p));
            prev = p;
        }
    }
}
