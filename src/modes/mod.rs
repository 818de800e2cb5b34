//! Grid mode subsystems.
//!
//! Each manager is a small state machine consulted by the coordinator and
//! the monitors. A disabled mode has no manager at all; a constructed
//! manager is armed and flips active when its trigger condition holds.
//! Evaluation priority when several could act on the same fill:
//! capital protection, then scalping, then take-profit.

mod capital;
mod price_follow;
mod price_lock;
mod scalping;
mod take_profit;

pub use capital::CapitalProtectionManager;
pub use price_follow::PriceFollowManager;
pub use price_lock::PriceLockManager;
pub use scalping::ScalpingManager;
pub use take_profit::TakeProfitManager;

use std::sync::Mutex;

use log::info;
use rust_decimal::Decimal;

use crate::config::GridConfig;

/// All mode managers for one grid, shared across coordinator and monitors.
///
/// The inner mutexes are plain `std::sync` locks: every manager operation
/// is a short synchronous state transition and no lock is held across a
/// suspension point.
pub struct ModeManagers {
    pub scalping: Option<Mutex<ScalpingManager>>,
    pub capital_protection: Option<Mutex<CapitalProtectionManager>>,
    pub take_profit: Option<Mutex<TakeProfitManager>>,
    pub price_lock: Option<Mutex<PriceLockManager>>,
    pub price_follow: Option<Mutex<PriceFollowManager>>,
}

impl ModeManagers {
    pub fn from_config(config: &GridConfig) -> Self {
        let scalping = config
            .scalping_enabled
            .then(|| Mutex::new(ScalpingManager::new(config)));
        if scalping.is_some() {
            info!("scalping manager armed");
        }

        let capital_protection = config
            .capital_protection_enabled
            .then(|| Mutex::new(CapitalProtectionManager::new(config)));
        if capital_protection.is_some() {
            info!("capital protection manager armed");
        }

        let take_profit = config
            .take_profit_enabled
            .then(|| Mutex::new(TakeProfitManager::new(config)));
        if take_profit.is_some() {
            info!("take-profit manager armed");
        }

        let price_lock = config
            .price_lock_enabled
            .then(|| PriceLockManager::new(config))
            .flatten()
            .map(Mutex::new);
        if price_lock.is_some() {
            info!("price-lock manager armed");
        }

        let price_follow = config
            .is_follow_mode()
            .then(|| Mutex::new(PriceFollowManager::new(config)));
        if price_follow.is_some() {
            info!("price-follow manager armed");
        }

        Self {
            scalping,
            capital_protection,
            take_profit,
            price_lock,
            price_follow,
        }
    }

    pub fn with_scalping<R>(&self, f: impl FnOnce(&mut ScalpingManager) -> R) -> Option<R> {
        self.scalping
            .as_ref()
            .map(|m| f(&mut m.lock().expect("scalping lock poisoned")))
    }

    pub fn with_capital_protection<R>(
        &self,
        f: impl FnOnce(&mut CapitalProtectionManager) -> R,
    ) -> Option<R> {
        self.capital_protection
            .as_ref()
            .map(|m| f(&mut m.lock().expect("capital protection lock poisoned")))
    }

    pub fn with_take_profit<R>(&self, f: impl FnOnce(&mut TakeProfitManager) -> R) -> Option<R> {
        self.take_profit
            .as_ref()
            .map(|m| f(&mut m.lock().expect("take-profit lock poisoned")))
    }

    pub fn with_price_lock<R>(&self, f: impl FnOnce(&mut PriceLockManager) -> R) -> Option<R> {
        self.price_lock
            .as_ref()
            .map(|m| f(&mut m.lock().expect("price-lock lock poisoned")))
    }

    pub fn with_price_follow<R>(&self, f: impl FnOnce(&mut PriceFollowManager) -> R) -> Option<R> {
        self.price_follow
            .as_ref()
            .map(|m| f(&mut m.lock().expect("price-follow lock poisoned")))
    }

    pub fn scalping_active(&self) -> bool {
        self.with_scalping(|m| m.is_active()).unwrap_or(false)
    }

    pub fn capital_protection_active(&self) -> bool {
        self.with_capital_protection(|m| m.is_active())
            .unwrap_or(false)
    }

    pub fn price_lock_locked(&self) -> bool {
        self.with_price_lock(|m| m.is_locked()).unwrap_or(false)
    }

    /// Seed `initial_capital` on managers that have none yet. Called from
    /// the balance monitor's first successful snapshot.
    pub fn seed_initial_capital(&self, collateral: Decimal) {
        self.with_scalping(|m| m.seed_capital(collateral));
        self.with_capital_protection(|m| m.seed_capital(collateral));
        self.with_take_profit(|m| m.seed_capital(collateral));
    }

    /// Overwrite `initial_capital` on every armed manager. Called after a
    /// reset with capital re-initialization.
    pub fn reinit_capital(&self, collateral: Decimal) {
        self.with_scalping(|m| m.set_capital(collateral));
        self.with_capital_protection(|m| m.set_capital(collateral));
        self.with_take_profit(|m| m.set_capital(collateral));
        info!("mode managers re-seeded with capital {collateral}");
    }

    /// Drop every manager back to armed. Mode state is volatile across
    /// resets; capital is re-seeded from the next balance snapshot.
    pub fn deactivate_all(&self) {
        self.with_scalping(|m| m.deactivate());
        self.with_capital_protection(|m| m.deactivate());
        self.with_take_profit(|m| m.deactivate());
        self.with_price_lock(|m| m.unlock());
        self.with_price_follow(|m| m.clear());
    }
}
