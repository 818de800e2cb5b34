//! Take-profit mode: whole-system reset once equity gains reach the
//! configured percentage of initial capital.

use rust_decimal::Decimal;

use crate::config::GridConfig;

#[derive(Debug)]
pub struct TakeProfitManager {
    percentage: Decimal,
    active: bool,
    initial_capital: Decimal,
    trigger_count: u64,
}

impl TakeProfitManager {
    pub fn new(config: &GridConfig) -> Self {
        Self {
            percentage: config.take_profit_percentage,
            active: false,
            initial_capital: Decimal::ZERO,
            trigger_count: 0,
        }
    }

    /// `(collateral - initial) / initial >= percentage`
    pub fn check_take_profit(&self, collateral: Decimal) -> bool {
        if self.active || self.initial_capital <= Decimal::ZERO {
            return false;
        }
        (collateral - self.initial_capital) / self.initial_capital >= self.percentage
    }

    pub fn activate(&mut self) {
        self.active = true;
        self.trigger_count += 1;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn seed_capital(&mut self, collateral: Decimal) {
        if self.initial_capital.is_zero() && collateral > Decimal::ZERO {
            self.initial_capital = collateral;
        }
    }

    pub fn set_capital(&mut self, collateral: Decimal) {
        self.initial_capital = collateral;
    }

    pub fn initial_capital(&self) -> Decimal {
        self.initial_capital
    }

    pub fn profit_amount(&self, collateral: Decimal) -> Decimal {
        collateral - self.initial_capital
    }

    pub fn trigger_count(&self) -> u64 {
        self.trigger_count
    }
}
