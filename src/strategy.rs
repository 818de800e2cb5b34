//! Grid strategy: initial order batch and reverse-order computation

use log::warn;
use rust_decimal::Decimal;

use crate::config::GridConfig;
use crate::types::{GridOrder, OrderSide};

/// Stateless order calculator for a grid configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct GridStrategy;

impl GridStrategy {
    pub fn new() -> Self {
        Self
    }

    /// The full initial batch: one resting order per grid level.
    ///
    /// Long grids ladder buys across the corridor; short grids ladder
    /// sells. Levels that happen to be marketable at submission time fill
    /// immediately and are picked up by the engine's immediate-fill sync.
    pub fn initial_orders(&self, config: &GridConfig) -> Vec<GridOrder> {
        let side = if config.is_long_family() {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };

        (1..=config.grid_count)
            .map(|grid_id| {
                GridOrder::new(
                    grid_id,
                    side,
                    config.price_of(grid_id),
                    config.order_amount_of_rounded(grid_id),
                )
            })
            .collect()
    }

    /// Counter-order for a fill, `reverse_order_grid_distance` grids away
    /// on the profit side. Returns `None` when the counter level would fall
    /// off the adverse end of the ladder.
    pub fn reverse_order(&self, filled: &GridOrder, config: &GridConfig) -> Option<GridOrder> {
        let distance = config.reverse_order_grid_distance;
        let new_side = filled.side.opposite();

        // Posting the counter-side moves toward higher grid indexes when it
        // prices away from the adverse extreme, lower when it prices back.
        let toward_extension = match (config.is_long_family(), new_side) {
            (true, OrderSide::Sell) => true,
            (true, OrderSide::Buy) => false,
            (false, OrderSide::Buy) => true,
            (false, OrderSide::Sell) => false,
        };

        let new_grid = if toward_extension {
            filled.grid_id.checked_add(distance)?
        } else {
            if filled.grid_id <= distance {
                warn!(
                    "no ladder room for reverse order below grid {}",
                    filled.grid_id
                );
                return None;
            }
            filled.grid_id - distance
        };

        let amount = filled.filled_amount.unwrap_or(filled.amount);
        let mut order = GridOrder::new(new_grid, new_side, config.price_of(new_grid), amount);
        order.parent_order_id = Some(filled.id().to_string());
        Some(order)
    }

    /// Refill order for a vacant grid during health repair. Side follows
    /// the current price; a level exactly at the price is left vacant.
    pub fn refill_order(
        &self,
        grid_id: u32,
        current_price: Decimal,
        config: &GridConfig,
    ) -> Option<GridOrder> {
        let price = config.price_of(grid_id);
        let side = if price < current_price {
            OrderSide::Buy
        } else if price > current_price {
            OrderSide::Sell
        } else {
            return None;
        };
        Some(GridOrder::new(
            grid_id,
            side,
            price,
            config.order_amount_of_rounded(grid_id),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::{config_long, config_short, settings_long};
    use crate::config::{GridConfig, GridType};
    use rust_decimal_macros::dec;

    fn filled(grid_id: u32, side: OrderSide, config: &GridConfig) -> GridOrder {
        let mut order = GridOrder::new(grid_id, side, config.price_of(grid_id), dec!(1.000));
        order.mark_open(format!("v-{grid_id}"));
        order.mark_filled(config.price_of(grid_id), dec!(1.000));
        order
    }

    #[test]
    fn test_initial_orders_long_is_all_buys() {
        let config = config_long();
        let orders = GridStrategy::new().initial_orders(&config);

        assert_eq!(orders.len(), 100);
        assert!(orders.iter().all(|o| o.side == OrderSide::Buy));
        assert_eq!(orders[0].price, dec!(100.00));
        assert_eq!(orders[99].price, dec!(109.90));
    }

    #[test]
    fn test_initial_orders_short_is_all_sells() {
        let config = config_short();
        let orders = GridStrategy::new().initial_orders(&config);

        assert!(orders.iter().all(|o| o.side == OrderSide::Sell));
        assert_eq!(orders[0].price, dec!(110.00));
        assert_eq!(orders[99].price, dec!(100.10));
    }

    #[test]
    fn test_initial_orders_martingale_amounts_rounded() {
        let mut settings = settings_long();
        settings.grid_type = GridType::MartingaleLong;
        settings.martingale_increment = Some(dec!(0.0015));
        let config = GridConfig::from_settings(settings).unwrap();

        let orders = GridStrategy::new().initial_orders(&config);
        for order in &orders {
            assert_eq!(order.amount, config.order_amount_of_rounded(order.grid_id));
        }
    }

    #[test]
    fn test_reverse_for_long_buy_fill() {
        // S1: buy at Grid 50 (104.90) reverses to a sell at Grid 51 (105.00)
        let config = config_long();
        let reverse = GridStrategy::new()
            .reverse_order(&filled(50, OrderSide::Buy, &config), &config)
            .unwrap();

        assert_eq!(reverse.side, OrderSide::Sell);
        assert_eq!(reverse.grid_id, 51);
        assert_eq!(reverse.price, dec!(105.00));
        assert_eq!(reverse.amount, dec!(1.000));
    }

    #[test]
    fn test_reverse_for_long_sell_fill() {
        let config = config_long();
        let reverse = GridStrategy::new()
            .reverse_order(&filled(51, OrderSide::Sell, &config), &config)
            .unwrap();

        assert_eq!(reverse.side, OrderSide::Buy);
        assert_eq!(reverse.grid_id, 50);
        assert_eq!(reverse.price, dec!(104.90));
    }

    #[test]
    fn test_reverse_for_short_sell_fill() {
        // Short grid: sell fill takes profit with a buy one interval lower,
        // which is one index further along the (descending) ladder
        let config = config_short();
        let reverse = GridStrategy::new()
            .reverse_order(&filled(50, OrderSide::Sell, &config), &config)
            .unwrap();

        assert_eq!(reverse.side, OrderSide::Buy);
        assert_eq!(reverse.grid_id, 51);
        assert_eq!(reverse.price, config.price_of(50) - dec!(0.10));
    }

    #[test]
    fn test_reverse_respects_distance() {
        let mut settings = settings_long();
        settings.reverse_order_grid_distance = 3;
        let config = GridConfig::from_settings(settings).unwrap();

        let reverse = GridStrategy::new()
            .reverse_order(&filled(50, OrderSide::Buy, &config), &config)
            .unwrap();
        assert_eq!(reverse.grid_id, 53);
        assert_eq!(reverse.price, dec!(105.20));
    }

    #[test]
    fn test_reverse_past_top_extends_ladder() {
        let config = config_long();
        let reverse = GridStrategy::new()
            .reverse_order(&filled(100, OrderSide::Buy, &config), &config)
            .unwrap();
        // Grid 101 lives above the corridor
        assert_eq!(reverse.grid_id, 101);
        assert_eq!(reverse.price, dec!(110.00));
    }

    #[test]
    fn test_reverse_off_ladder_bottom_is_none() {
        let config = config_long();
        let strategy = GridStrategy::new();
        assert!(strategy
            .reverse_order(&filled(1, OrderSide::Sell, &config), &config)
            .is_none());
    }

    #[test]
    fn test_refill_side_follows_price() {
        let config = config_long();
        let strategy = GridStrategy::new();

        let below = strategy
            .refill_order(30, dec!(105.00), &config)
            .unwrap();
        assert_eq!(below.side, OrderSide::Buy);

        let above = strategy
            .refill_order(60, dec!(105.00), &config)
            .unwrap();
        assert_eq!(above.side, OrderSide::Sell);

        // Grid 51 prices exactly at 105.00: left vacant
        assert!(strategy.refill_order(51, dec!(105.00), &config).is_none());
    }
}
