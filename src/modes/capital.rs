//! Capital protection: freeze the grid after heavy adverse drift and only
//! rebuild once account equity recovers to the recorded initial capital.

use log::warn;
use rust_decimal::Decimal;

use crate::config::GridConfig;

#[derive(Debug)]
pub struct CapitalProtectionManager {
    trigger_grid: u32,
    active: bool,
    initial_capital: Decimal,
}

impl CapitalProtectionManager {
    pub fn new(config: &GridConfig) -> Self {
        Self {
            trigger_grid: config.capital_protection_trigger_grid(),
            active: false,
            initial_capital: Decimal::ZERO,
        }
    }

    pub fn trigger_grid(&self) -> u32 {
        self.trigger_grid
    }

    pub fn should_trigger(&self, _price: Decimal, grid_idx: u32) -> bool {
        !self.active && grid_idx <= self.trigger_grid
    }

    pub fn activate(&mut self) {
        self.active = true;
        warn!(
            "capital protection activated, waiting for equity to recover to {}",
            self.initial_capital
        );
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Recovery condition: equity back at or above the initial capital
    pub fn check_capital_recovery(&self, collateral: Decimal) -> bool {
        self.active && self.initial_capital > Decimal::ZERO && collateral >= self.initial_capital
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

    pub fn profit_loss(&self, collateral: Decimal) -> Decimal {
        collateral - self.initial_capital
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::settings_long;
    use rust_decimal_macros::dec;

    fn manager() -> CapitalProtectionManager {
        let mut settings = settings_long();
        settings.capital_protection_enabled = true;
        settings.capital_protection_trigger_percent = 50;
        let config = GridConfig::from_settings(settings).unwrap();
        CapitalProtectionManager::new(&config)
    }

    #[test]
    fn test_trigger_at_halfway_grid() {
        let m = manager();
        assert_eq!(m.trigger_grid(), 50);
        assert!(!m.should_trigger(dec!(105.50), 56));
        assert!(m.should_trigger(dec!(104.90), 50));
    }

    #[test]
    fn test_recovery_requires_active_and_capital() {
        let mut m = manager();
        assert!(!m.check_capital_recovery(dec!(2000.00)));

        m.seed_capital(dec!(1000.00));
        m.activate();
        assert!(!m.check_capital_recovery(dec!(999.99)));
        assert!(m.check_capital_recovery(dec!(1000.00)));
        assert!(m.check_capital_recovery(dec!(1200.00)));
    }

    #[test]
    fn test_seed_does_not_overwrite() {
        let mut m = manager();
        m.seed_capital(dec!(1000.00));
        m.seed_capital(dec!(500.00));
        assert_eq!(m.initial_capital(), dec!(1000.00));

        m.set_capital(dec!(1010.00));
        assert_eq!(m.initial_capital(), dec!(1010.00));
    }
}
