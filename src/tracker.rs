//! Position tracker: derives position, average cost and realized P&L from
//! the fill stream.
//!
//! The tracker is a derived view, not the authoritative ledger: the
//! position monitor overwrites it from venue REST on every poll via
//! `sync_initial_position`.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use rust_decimal::Decimal;

use crate::config::GridConfig;
use crate::types::{GridOrder, OrderSide, TradeRecord};

const TRADE_HISTORY_CAPACITY: usize = 1000;

#[derive(Debug)]
pub struct PositionTracker {
    config: Arc<GridConfig>,

    current_position: Decimal,
    position_cost: Decimal,
    average_cost: Decimal,

    realized_pnl: Decimal,
    total_fees: Decimal,

    trade_history: VecDeque<TradeRecord>,

    buy_count: u64,
    sell_count: u64,
}

impl PositionTracker {
    pub fn new(config: Arc<GridConfig>) -> Self {
        Self {
            config,
            current_position: Decimal::ZERO,
            position_cost: Decimal::ZERO,
            average_cost: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            trade_history: VecDeque::with_capacity(TRADE_HISTORY_CAPACITY),
            buy_count: 0,
            sell_count: 0,
        }
    }

    /// Record a filled order.
    ///
    /// Buys add to cost basis. Sells against a long position realize
    /// `(sell_price - avg_cost) * amount`; sells with no long position are
    /// short-build legs and realize nothing.
    pub fn record_filled_order(&mut self, order: &GridOrder) {
        if !order.is_filled() {
            debug!("order {} not filled, skipping record", order.id());
            return;
        }

        let price = order.filled_price.unwrap_or(order.price);
        let amount = order.filled_amount.unwrap_or(order.amount);
        let mut profit = None;

        match order.side {
            OrderSide::Buy => {
                self.position_cost += price * amount;
                self.current_position += amount;
                self.buy_count += 1;
            }
            OrderSide::Sell => {
                if self.current_position > Decimal::ZERO {
                    let avg = self.position_cost / self.current_position;
                    let basis = avg * amount;
                    let realized = price * amount - basis;
                    self.realized_pnl += realized;
                    self.position_cost -= basis;
                    self.current_position -= amount;
                    profit = Some(realized);
                } else {
                    // Short-build leg
                    self.position_cost -= price * amount;
                    self.current_position -= amount;
                }
                self.sell_count += 1;
            }
        }

        self.average_cost = if self.current_position.is_zero() {
            Decimal::ZERO
        } else {
            self.position_cost / self.current_position.abs()
        };

        self.total_fees += price * amount * self.config.fee_rate;

        self.push_trade(TradeRecord {
            time: Utc::now(),
            grid_id: order.grid_id,
            side: order.side,
            price,
            amount,
            profit,
            realized_pnl: self.realized_pnl,
        });

        info!(
            "recorded fill: {} {}@{} position={} realized_pnl={}",
            order.side.as_str(),
            amount,
            price,
            self.current_position,
            self.realized_pnl
        );
    }

    fn push_trade(&mut self, record: TradeRecord) {
        if self.trade_history.len() == TRADE_HISTORY_CAPACITY {
            self.trade_history.pop_front();
        }
        self.trade_history.push_back(record);
    }

    /// Overwrite tracker state from an external authority (venue REST)
    pub fn sync_initial_position(&mut self, position: Decimal, entry_price: Decimal) {
        let changed = position != self.current_position || entry_price != self.average_cost;
        self.current_position = position;
        self.average_cost = entry_price;
        self.position_cost = if position.is_zero() {
            Decimal::ZERO
        } else {
            position.abs() * entry_price
        };
        if changed {
            debug!("position synced from venue: {position} @ {entry_price}");
        }
    }

    pub fn current_position(&self) -> Decimal {
        self.current_position
    }

    pub fn average_cost(&self) -> Decimal {
        self.average_cost
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn total_fees(&self) -> Decimal {
        self.total_fees
    }

    pub fn buy_count(&self) -> u64 {
        self.buy_count
    }

    pub fn sell_count(&self) -> u64 {
        self.sell_count
    }

    /// Completed buy-sell cycles
    pub fn completed_cycles(&self) -> u64 {
        self.buy_count.min(self.sell_count)
    }

    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        if self.current_position.is_zero() {
            Decimal::ZERO
        } else {
            (current_price - self.average_cost) * self.current_position
        }
    }

    pub fn trade_history(&self, limit: usize) -> Vec<TradeRecord> {
        self.trade_history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub fn reset(&mut self) {
        self.current_position = Decimal::ZERO;
        self.position_cost = Decimal::ZERO;
        self.average_cost = Decimal::ZERO;
        self.realized_pnl = Decimal::ZERO;
        self.total_fees = Decimal::ZERO;
        self.trade_history.clear();
        self.buy_count = 0;
        self.sell_count = 0;
        info!("position tracker reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::config_long;
    use rust_decimal_macros::dec;

    fn filled(grid_id: u32, side: OrderSide, price: Decimal, amount: Decimal) -> GridOrder {
        let mut order = GridOrder::new(grid_id, side, price, amount);
        order.mark_open(format!("v-{grid_id}"));
        order.mark_filled(price, amount);
        order
    }

    #[test]
    fn test_single_buy() {
        let mut tracker = PositionTracker::new(Arc::new(config_long()));
        tracker.record_filled_order(&filled(50, OrderSide::Buy, dec!(104.90), dec!(1.000)));

        assert_eq!(tracker.current_position(), dec!(1.000));
        assert_eq!(tracker.average_cost(), dec!(104.90));
        assert_eq!(tracker.realized_pnl(), dec!(0));
        assert_eq!(tracker.buy_count(), 1);
    }

    #[test]
    fn test_round_trip_realizes_profit() {
        let mut tracker = PositionTracker::new(Arc::new(config_long()));
        tracker.record_filled_order(&filled(50, OrderSide::Buy, dec!(104.90), dec!(1.000)));
        tracker.record_filled_order(&filled(51, OrderSide::Sell, dec!(105.00), dec!(1.000)));

        assert_eq!(tracker.current_position(), dec!(0.000));
        assert_eq!(tracker.average_cost(), dec!(0));
        assert_eq!(tracker.realized_pnl(), dec!(0.10000));
        assert_eq!(tracker.completed_cycles(), 1);
    }

    #[test]
    fn test_partial_sell_keeps_average() {
        let mut tracker = PositionTracker::new(Arc::new(config_long()));
        tracker.record_filled_order(&filled(50, OrderSide::Buy, dec!(100.00), dec!(2.000)));
        tracker.record_filled_order(&filled(51, OrderSide::Sell, dec!(101.00), dec!(1.000)));

        assert_eq!(tracker.current_position(), dec!(1.000));
        assert_eq!(tracker.average_cost(), dec!(100.00));
        assert_eq!(tracker.realized_pnl(), dec!(1.00000));
    }

    #[test]
    fn test_short_build_has_no_realized_pnl() {
        let mut tracker = PositionTracker::new(Arc::new(config_long()));
        tracker.record_filled_order(&filled(10, OrderSide::Sell, dec!(109.00), dec!(1.000)));

        assert_eq!(tracker.current_position(), dec!(-1.000));
        assert_eq!(tracker.realized_pnl(), dec!(0));
        // Average cost is cost / |position|: negative basis over a short
        assert_eq!(tracker.average_cost(), dec!(-109.00));
    }

    #[test]
    fn test_fee_accumulation() {
        let mut tracker = PositionTracker::new(Arc::new(config_long()));
        tracker.record_filled_order(&filled(50, OrderSide::Buy, dec!(104.90), dec!(1.000)));
        // 104.90 * 1.000 * 0.0001
        assert_eq!(tracker.total_fees(), dec!(0.0104900000));
    }

    #[test]
    fn test_sync_overwrites_local_view() {
        let mut tracker = PositionTracker::new(Arc::new(config_long()));
        tracker.record_filled_order(&filled(50, OrderSide::Buy, dec!(104.90), dec!(1.000)));

        tracker.sync_initial_position(dec!(5.000), dec!(103.00));
        assert_eq!(tracker.current_position(), dec!(5.000));
        assert_eq!(tracker.average_cost(), dec!(103.00));

        tracker.sync_initial_position(dec!(0), dec!(0));
        assert_eq!(tracker.current_position(), dec!(0));
        assert_eq!(tracker.average_cost(), dec!(0));
    }

    #[test]
    fn test_trade_ring_is_bounded() {
        let mut tracker = PositionTracker::new(Arc::new(config_long()));
        for i in 0..1100u32 {
            tracker.record_filled_order(&filled(
                (i % 100) + 1,
                OrderSide::Buy,
                dec!(100.00),
                dec!(0.001),
            ));
        }
        assert_eq!(tracker.trade_history(2000).len(), 1000);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut tracker = PositionTracker::new(Arc::new(config_long()));
        tracker.record_filled_order(&filled(50, OrderSide::Buy, dec!(104.90), dec!(1.000)));
        tracker.reset();

        assert_eq!(tracker.current_position(), dec!(0));
        assert_eq!(tracker.realized_pnl(), dec!(0));
        assert_eq!(tracker.buy_count(), 0);
        assert!(tracker.trade_history(10).is_empty());
    }
}
