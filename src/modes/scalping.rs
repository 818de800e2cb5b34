//! Scalping mode: forced-liquidation safety net.
//!
//! Arms deep in the adverse direction. On activation the coordinator
//! cancels every counter-side order and posts a single take-profit order
//! against the accumulated position; while active, fills on the
//! position-building side get no reverse order; the take-profit order is
//! the only exit.

use log::{info, warn};
use rust_decimal::Decimal;

use crate::config::GridConfig;
use crate::types::{GridOrder, OrderSide};

#[derive(Debug)]
pub struct ScalpingManager {
    trigger_grid: u32,
    take_profit_grids: u32,
    grid_interval: Decimal,
    long_family: bool,

    active: bool,
    position: Decimal,
    average_cost: Decimal,
    initial_capital: Decimal,

    tp_order_id: Option<String>,
    /// Position size the current take-profit order was priced for
    tp_order_position: Decimal,
}

impl ScalpingManager {
    pub fn new(config: &GridConfig) -> Self {
        Self {
            trigger_grid: config.scalping_trigger_grid(),
            take_profit_grids: config.scalping_take_profit_grids,
            grid_interval: config.grid_interval,
            long_family: config.is_long_family(),
            active: false,
            position: Decimal::ZERO,
            average_cost: Decimal::ZERO,
            initial_capital: Decimal::ZERO,
            tp_order_id: None,
            tp_order_position: Decimal::ZERO,
        }
    }

    pub fn trigger_grid(&self) -> u32 {
        self.trigger_grid
    }

    /// Arm condition: current grid at or past the trigger grid toward the
    /// adverse extreme (Grid 1)
    pub fn should_trigger(&self, _price: Decimal, grid_idx: u32) -> bool {
        !self.active && grid_idx <= self.trigger_grid
    }

    /// Exit condition: price recovered past the trigger grid
    pub fn should_exit(&self, _price: Decimal, grid_idx: u32) -> bool {
        self.active && grid_idx > self.trigger_grid
    }

    pub fn activate(&mut self) {
        self.active = true;
        warn!("scalping mode activated (trigger grid {})", self.trigger_grid);
    }

    pub fn deactivate(&mut self) {
        if self.active {
            info!("scalping mode deactivated");
        }
        self.active = false;
        self.tp_order_id = None;
        self.tp_order_position = Decimal::ZERO;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn update_position(&mut self, position: Decimal, average_cost: Decimal) {
        self.position = position;
        self.average_cost = average_cost;
    }

    pub fn position(&self) -> Decimal {
        self.position
    }

    pub fn average_cost(&self) -> Decimal {
        self.average_cost
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

    /// The single take-profit order against the tracked position:
    /// `avg_cost ± take_profit_grids * grid_interval`, reduce direction by
    /// position sign. `None` when flat.
    pub fn take_profit_order(&self, config: &GridConfig) -> Option<GridOrder> {
        if self.position.is_zero() {
            return None;
        }
        let span = Decimal::from(self.take_profit_grids) * self.grid_interval;
        let (side, price) = if self.position > Decimal::ZERO {
            (OrderSide::Sell, self.average_cost + span)
        } else {
            (OrderSide::Buy, self.average_cost - span)
        };
        let amount = config.round_amount(self.position.abs());
        if amount.is_zero() {
            warn!("position {} rounds to zero, no take-profit order", self.position);
            return None;
        }
        Some(GridOrder::new(config.index_of(price), side, price, amount))
    }

    pub fn record_take_profit_order(&mut self, order: &GridOrder) {
        self.tp_order_id = Some(order.client_id.clone());
        self.tp_order_position = self.position;
    }

    pub fn clear_take_profit_order(&mut self) {
        self.tp_order_id = None;
        self.tp_order_position = Decimal::ZERO;
    }

    pub fn take_profit_order_id(&self) -> Option<&str> {
        self.tp_order_id.as_deref()
    }

    pub fn is_take_profit_order(&self, order: &GridOrder) -> bool {
        self.tp_order_id
            .as_deref()
            .map(|id| {
                id == order.client_id || order.venue_id.as_deref() == Some(id)
            })
            .unwrap_or(false)
    }

    /// The resting take-profit order no longer matches the live position
    pub fn is_take_profit_outdated(&self, current_position: Decimal) -> bool {
        self.active && self.tp_order_id.is_some() && self.tp_order_position != current_position
    }

    /// Whether the coordinator may post the reverse order for this fill
    /// while scalping is active.
    ///
    /// Position-building fills (buys in a long grid, sells in a short one)
    /// get no counter-order; the take-profit order is the only exit.
    /// Counter-side fills still restock their level.
    pub fn should_post_reverse(&self, filled_side: OrderSide) -> bool {
        if self.long_family {
            filled_side == OrderSide::Sell
        } else {
            filled_side == OrderSide::Buy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::{settings_long, config_short};
    use crate::config::GridConfig;
    use rust_decimal_macros::dec;

    fn scalping_config() -> GridConfig {
        let mut settings = settings_long();
        settings.scalping_enabled = true;
        settings.scalping_trigger_percent = 90;
        settings.scalping_take_profit_grids = 2;
        GridConfig::from_settings(settings).unwrap()
    }

    #[test]
    fn test_trigger_and_exit() {
        let config = scalping_config();
        let mut manager = ScalpingManager::new(&config);
        assert_eq!(manager.trigger_grid(), 10);

        assert!(!manager.should_trigger(dec!(102.00), 21));
        assert!(manager.should_trigger(dec!(100.90), 10));
        manager.activate();
        assert!(!manager.should_trigger(dec!(100.90), 10));

        assert!(!manager.should_exit(dec!(100.90), 10));
        assert!(manager.should_exit(dec!(101.10), 12));
    }

    #[test]
    fn test_take_profit_order_long() {
        // S4: position +85 at avg 105.00, tp 2 grids -> sell 85 @ 105.20
        let config = scalping_config();
        let mut manager = ScalpingManager::new(&config);
        manager.activate();
        manager.update_position(dec!(85.000), dec!(105.00));

        let order = manager.take_profit_order(&config).unwrap();
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.price, dec!(105.20));
        assert_eq!(order.amount, dec!(85.000));
    }

    #[test]
    fn test_take_profit_order_short() {
        let config = config_short();
        let mut manager = ScalpingManager::new(&config);
        manager.activate();
        manager.update_position(dec!(-85.000), dec!(105.00));

        let order = manager.take_profit_order(&config).unwrap();
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.price, dec!(104.80));
        assert_eq!(order.amount, dec!(85.000));
    }

    #[test]
    fn test_no_take_profit_when_flat() {
        let config = scalping_config();
        let manager = ScalpingManager::new(&config);
        assert!(manager.take_profit_order(&config).is_none());
    }

    #[test]
    fn test_reverse_suppression_long() {
        // Long grid while scalping: buy fills build the position and get
        // no reverse sell; sell fills still restock
        let config = scalping_config();
        let mut manager = ScalpingManager::new(&config);
        manager.activate();

        assert!(!manager.should_post_reverse(OrderSide::Buy));
        assert!(manager.should_post_reverse(OrderSide::Sell));
    }

    #[test]
    fn test_reverse_suppression_short_parity() {
        let config = config_short();
        let mut manager = ScalpingManager::new(&config);
        manager.activate();

        assert!(!manager.should_post_reverse(OrderSide::Sell));
        assert!(manager.should_post_reverse(OrderSide::Buy));
    }

    #[test]
    fn test_take_profit_staleness() {
        let config = scalping_config();
        let mut manager = ScalpingManager::new(&config);
        manager.activate();
        manager.update_position(dec!(10.000), dec!(103.00));

        let order = manager.take_profit_order(&config).unwrap();
        manager.record_take_profit_order(&order);
        assert!(!manager.is_take_profit_outdated(dec!(10.000)));
        assert!(manager.is_take_profit_outdated(dec!(11.000)));

        assert!(manager.is_take_profit_order(&order));
        manager.clear_take_profit_order();
        assert!(!manager.is_take_profit_order(&order));
    }
}
