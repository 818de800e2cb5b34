//! Price-lock mode: pause new orders once price crosses a configured
//! threshold, release when it retreats back inside the corridor.

use log::{info, warn};
use rust_decimal::Decimal;

use crate::config::GridConfig;

#[derive(Debug)]
pub struct PriceLockManager {
    threshold: Decimal,
    long_family: bool,
    locked: bool,
}

impl PriceLockManager {
    /// Returns `None` when no threshold is configured
    pub fn new(config: &GridConfig) -> Option<Self> {
        config.price_lock_threshold.map(|threshold| Self {
            threshold,
            long_family: config.is_long_family(),
            locked: false,
        })
    }

    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Lock once price crosses the threshold: above it for long grids,
    /// below it for short grids. Returns true when the state flipped.
    pub fn check_lock(&mut self, price: Decimal) -> bool {
        if self.locked {
            return false;
        }
        let crossed = if self.long_family {
            price >= self.threshold
        } else {
            price <= self.threshold
        };
        if crossed {
            self.locked = true;
            warn!("price lock engaged at {price} (threshold {})", self.threshold);
        }
        crossed
    }

    /// Unlock when price is back inside the corridor. Returns true when
    /// the state flipped.
    pub fn check_unlock(&mut self, price: Decimal, lower: Decimal, upper: Decimal) -> bool {
        if self.locked && price >= lower && price <= upper {
            self.locked = false;
            info!("price lock released at {price}");
            return true;
        }
        false
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }
}
