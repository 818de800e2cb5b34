//! Order health checker.
//!
//! One periodic pass reconciles the venue's resting orders and position
//! against the configured lattice: duplicates and out-of-range orders are
//! cancelled, genuinely vacant grids are refilled (never past the
//! configured level count), and only once the order set is correct is the
//! position nudged back with a market order. Orders first, then position:
//! the expected position is a function of what orders remain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

use crate::config::GridConfig;
use crate::control::ControlFlags;
use crate::engine::ExecutionEngine;
use crate::errors::GridResult;
use crate::exchange::{ExchangeAdapter, OrderData, PositionData};
use crate::modes::ModeManagers;
use crate::strategy::GridStrategy;
use crate::types::OrderSide;

const STARTUP_DELAY: Duration = Duration::from_secs(60);
/// Wait between the first and second snapshot when something looks off,
/// to ride out a mid-fill race
const RECHECK_DELAY: Duration = Duration::from_secs(3);
const CLEANUP_SETTLE: Duration = Duration::from_secs(2);
const ADJUST_SETTLE: Duration = Duration::from_secs(3);
/// Scalping-mode deviation thresholds (percent of expected position)
const SCALPING_WARN_DEVIATION: u32 = 10;
const SCALPING_EMERGENCY_DEVIATION: u32 = 50;

#[derive(Debug, Clone)]
struct TheoreticalRange {
    min_grid: i64,
    max_grid: i64,
    extended: bool,
    expected_count: usize,
}

#[derive(Debug)]
struct ProblemOrders {
    duplicates: Vec<OrderData>,
    out_of_range: Vec<(OrderData, i64)>,
}

#[derive(Debug, Clone, Copy)]
struct PositionCheck {
    expected: Decimal,
    actual: Decimal,
    delta: Decimal,
    healthy: bool,
}

pub struct OrderHealthChecker {
    config: Arc<GridConfig>,
    exchange: Arc<dyn ExchangeAdapter>,
    engine: Arc<ExecutionEngine>,
    modes: Arc<ModeManagers>,
    flags: Arc<ControlFlags>,
    strategy: GridStrategy,
}

impl OrderHealthChecker {
    pub fn new(
        config: Arc<GridConfig>,
        exchange: Arc<dyn ExchangeAdapter>,
        engine: Arc<ExecutionEngine>,
        modes: Arc<ModeManagers>,
        flags: Arc<ControlFlags>,
    ) -> Self {
        Self {
            config,
            exchange,
            engine,
            modes,
            flags,
            strategy: GridStrategy::new(),
        }
    }

    /// Periodic loop: first pass after a 60s settle, then at the
    /// configured interval. Passes are skipped while a reset runs.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let checker = self.clone();
        let period = Duration::from_secs(checker.config.order_health_check_interval);
        tokio::spawn(async move {
            sleep(STARTUP_DELAY).await;
            info!(
                "order health checker started (interval {}s)",
                period.as_secs()
            );
            let mut tick = interval_at(Instant::now(), period);
            loop {
                tick.tick().await;
                if checker.flags.is_resetting() || !checker.flags.is_running() {
                    debug!("health pass skipped (reset in progress or stopped)");
                    continue;
                }
                if let Err(e) = checker.perform_check().await {
                    error!("health check failed: {e}");
                }
            }
        })
    }

    async fn fetch_both(&self) -> GridResult<(Vec<OrderData>, Vec<PositionData>)> {
        let symbols = [self.config.symbol.clone()];
        let (orders, positions) = tokio::join!(
            self.exchange.get_open_orders(&self.config.symbol),
            self.exchange.get_positions(Some(&symbols)),
        );
        Ok((orders?, positions.unwrap_or_default()))
    }

    /// One full pass
    pub async fn perform_check(&self) -> GridResult<()> {
        debug!("health check: twin-snapshot fetch");
        let (mut orders, mut positions) = self.fetch_both().await?;
        if orders.is_empty() {
            warn!("no open orders at venue, skipping health pass");
            return Ok(());
        }

        let grid_count = self.config.grid_count as usize;
        let (mut buys, mut sells) = count_sides(&orders);
        let mut check = self.check_position(self.expected_position(buys, sells), &positions);

        // Debounce: a pass that starts mid-fill sees both snapshots
        // mid-transition; re-fetch once before judging
        if orders.len() != grid_count || !check.healthy {
            debug!(
                "anomaly suspected (orders={}, expected {grid_count}, position delta={}), \
                 re-fetching in {}s",
                orders.len(),
                check.delta,
                RECHECK_DELAY.as_secs()
            );
            sleep(RECHECK_DELAY).await;
            let refetched = self.fetch_both().await?;
            orders = refetched.0;
            positions = refetched.1;
            let counted = count_sides(&orders);
            buys = counted.0;
            sells = counted.1;
            check = self.check_position(self.expected_position(buys, sells), &positions);

            if orders.len() == grid_count && check.healthy {
                debug!("second snapshot clean: transient mid-fill state");
            }
        }

        // Scalping manages its own order set: diagnose, never remediate,
        // but a large position deviation is an emergency
        if self.modes.scalping_active() {
            return self.scalping_diagnostics(&orders, check);
        }

        let range = self.theoretical_range(&orders);
        self.log_range_comparison(&orders, &range);

        let problems = self.diagnose(&orders, &range);
        if !problems.duplicates.is_empty() || !problems.out_of_range.is_empty() {
            let cleaned = self.clean(&problems).await;
            if cleaned > 0 {
                info!("cleaned {cleaned} problem orders, letting cancels settle");
                sleep(CLEANUP_SETTLE).await;
                orders = self.exchange.get_open_orders(&self.config.symbol).await?;
            }
        }

        let (_covered, missing, gap) = self.coverage(&orders, &range);
        if !missing.is_empty() {
            // Price lock suppresses new orders; vacancies wait for release
            if self.modes.price_lock_locked() {
                info!(
                    "price locked: {} vacant grids left unfilled",
                    missing.len()
                );
            } else if orders.len() < grid_count {
                // Never exceed the configured level count
                info!(
                    "refilling {} vacant grids ({} profit-gap grids left alone)",
                    missing.len(),
                    gap.len()
                );
                self.refill(&missing).await;
            } else {
                warn!(
                    "{} grids vacant but {} orders already resting (cap {grid_count}), \
                     refill blocked",
                    missing.len(),
                    orders.len()
                );
            }
        }

        self.reconcile_position().await?;
        Ok(())
    }

    fn scalping_diagnostics(&self, orders: &[OrderData], check: PositionCheck) -> GridResult<()> {
        debug!(
            "scalping active: diagnostics only ({} orders, expected position {}, actual {})",
            orders.len(),
            check.expected,
            check.actual
        );

        if check.expected.is_zero() {
            if !check.actual.is_zero() {
                self.flags.emergency_stop(&format!(
                    "scalping position check: expected flat, venue reports {}",
                    check.actual
                ));
            }
            return Ok(());
        }

        let deviation = (check.actual - check.expected).abs() / check.expected.abs()
            * Decimal::from(100);
        if deviation >= Decimal::from(SCALPING_EMERGENCY_DEVIATION) {
            self.flags.emergency_stop(&format!(
                "scalping position deviation {deviation:.1}% (expected {}, actual {})",
                check.expected, check.actual
            ));
        } else if deviation >= Decimal::from(SCALPING_WARN_DEVIATION) {
            warn!(
                "scalping position deviation {deviation:.1}% (expected {}, actual {})",
                check.expected, check.actual
            );
        }
        Ok(())
    }

    /// Expected position from the open-order counts.
    ///
    /// Long grids start with `grid_count` buys, so fills equal
    /// `grid_count - open_buys` and walk down from the top of the ladder.
    /// Martingale sizes are rounded per grid before summing; the venue
    /// rounds each order, so summing first gives the wrong total.
    fn expected_position(&self, open_buys: usize, open_sells: usize) -> Decimal {
        let grid_count = self.config.grid_count;

        if self.config.is_long_family() {
            let filled = (grid_count as usize).saturating_sub(open_buys) as u32;
            if self.config.is_martingale_mode() {
                let start = grid_count - filled + 1;
                (start..=grid_count)
                    .map(|g| self.config.order_amount_of_rounded(g))
                    .sum()
            } else {
                Decimal::from(filled) * self.config.order_amount
            }
        } else {
            let filled = (grid_count as usize).saturating_sub(open_sells) as u32;
            let magnitude: Decimal = if self.config.is_martingale_mode() {
                (1..=filled)
                    .map(|g| self.config.order_amount_of_rounded(g))
                    .sum()
            } else {
                Decimal::from(filled) * self.config.order_amount
            };
            -magnitude
        }
    }

    fn check_position(&self, expected: Decimal, positions: &[PositionData]) -> PositionCheck {
        let actual = positions
            .iter()
            .find(|p| p.symbol == self.config.symbol)
            .or_else(|| positions.first())
            .map(|p| {
                // A zero size with a direction attached is a ghost position
                if p.size.is_zero() {
                    Decimal::ZERO
                } else {
                    p.signed_size()
                }
            })
            .unwrap_or(Decimal::ZERO);

        let delta = expected - actual;
        PositionCheck {
            expected,
            actual,
            delta,
            healthy: delta.abs() <= self.config.position_tolerance_amount(),
        }
    }

    /// Base range is the ladder itself; a long grid holding sells extends
    /// upward by the reverse distance (mirrored for shorts with buys). The
    /// expected order count stays `grid_count` because the reversed-from
    /// levels leave the profit gap behind.
    fn theoretical_range(&self, orders: &[OrderData]) -> TheoreticalRange {
        let has_buy = orders.iter().any(|o| o.side == OrderSide::Buy);
        let has_sell = orders.iter().any(|o| o.side == OrderSide::Sell);
        let distance = self.config.reverse_order_grid_distance as i64;

        let mut range = TheoreticalRange {
            min_grid: 1,
            max_grid: self.config.grid_count as i64,
            extended: false,
            expected_count: self.config.grid_count as usize,
        };

        if self.config.is_long_family() && has_sell {
            range.extended = true;
            range.max_grid += distance;
        } else if self.config.is_short_family() && has_buy {
            range.extended = true;
            range.max_grid += distance;
        }
        range
    }

    fn log_range_comparison(&self, orders: &[OrderData], range: &TheoreticalRange) {
        let indexes: Vec<i64> = orders
            .iter()
            .map(|o| self.config.raw_index_of(o.price))
            .collect();
        if let (Some(min), Some(max)) = (indexes.iter().min(), indexes.iter().max()) {
            debug!(
                "occupied grids [{min}, {max}] vs theoretical [{}, {}] (extended={})",
                range.min_grid, range.max_grid, range.extended
            );
            if *min < range.min_grid || *max > range.max_grid {
                warn!(
                    "orders outside theoretical range: occupied [{min}, {max}], \
                     allowed [{}, {}]",
                    range.min_grid, range.max_grid
                );
            }
        }
    }

    /// Duplicates (same price, keep the first) and out-of-range orders
    fn diagnose(&self, orders: &[OrderData], range: &TheoreticalRange) -> ProblemOrders {
        let mut problems = ProblemOrders {
            duplicates: Vec::new(),
            out_of_range: Vec::new(),
        };

        let mut seen_prices: HashMap<Decimal, &OrderData> = HashMap::new();
        for order in orders {
            if let Some(kept) = seen_prices.get(&order.price) {
                warn!(
                    "duplicate order at {}: keeping {}, cancelling {}",
                    order.price, kept.id, order.id
                );
                problems.duplicates.push(order.clone());
            } else {
                seen_prices.insert(order.price, order);
            }
        }

        for order in orders {
            let raw = self.config.raw_index_of(order.price);
            if raw < range.min_grid || raw > range.max_grid {
                warn!(
                    "order {} at {} maps to grid {raw}, outside [{}, {}]",
                    order.id, order.price, range.min_grid, range.max_grid
                );
                problems.out_of_range.push((order.clone(), raw));
            }
        }

        problems
    }

    async fn clean(&self, problems: &ProblemOrders) -> usize {
        let mut cleaned = 0;
        for order in &problems.duplicates {
            match self.engine.cancel_order(&order.id).await {
                Ok(true) => cleaned += 1,
                Ok(false) => warn!("duplicate {} could not be cancelled", order.id),
                Err(e) => error!("cancel of duplicate {} failed: {e}", order.id),
            }
        }
        for (order, raw) in &problems.out_of_range {
            match self.engine.cancel_order(&order.id).await {
                Ok(true) => {
                    debug!("cancelled out-of-range order {} (grid {raw})", order.id);
                    cleaned += 1;
                }
                Ok(false) => warn!("out-of-range {} could not be cancelled", order.id),
                Err(e) => error!("cancel of out-of-range {} failed: {e}", order.id),
            }
        }
        cleaned
    }

    /// Covered grids, genuinely missing grids, and the profit gap.
    ///
    /// The gap is computed dynamically as the band between the highest
    /// buy and the lowest sell; it is expected vacancy, not damage.
    fn coverage(
        &self,
        orders: &[OrderData],
        range: &TheoreticalRange,
    ) -> (HashSet<i64>, Vec<i64>, HashSet<i64>) {
        let mut covered = HashSet::new();
        let mut buy_grids: Vec<i64> = Vec::new();
        let mut sell_grids: Vec<i64> = Vec::new();

        for order in orders {
            let raw = self.config.raw_index_of(order.price);
            if raw < range.min_grid || raw > range.max_grid {
                error!(
                    "order {} still outside theoretical range after cleanup (grid {raw})",
                    order.id
                );
                continue;
            }
            covered.insert(raw);
            match order.side {
                OrderSide::Buy => buy_grids.push(raw),
                OrderSide::Sell => sell_grids.push(raw),
            }
        }

        let mut gap = HashSet::new();
        if let (Some(&max_buy), Some(&min_sell)) =
            (buy_grids.iter().max(), sell_grids.iter().min())
        {
            if min_sell > max_buy {
                gap.extend(max_buy + 1..min_sell);
            }
        }

        let missing: Vec<i64> = (range.min_grid..=range.max_grid)
            .filter(|g| !covered.contains(g) && !gap.contains(g))
            .collect();

        debug!(
            "coverage: {} covered, {} profit-gap, {} missing of expected {}",
            covered.len(),
            gap.len(),
            missing.len(),
            range.expected_count
        );
        (covered, missing, gap)
    }

    async fn refill(&self, missing: &[i64]) {
        let current_price = match self.engine.get_current_price().await {
            Ok(price) => price,
            Err(e) => {
                error!("refill aborted, no current price: {e}");
                return;
            }
        };

        let mut placed = 0;
        for &grid in missing {
            if grid < 1 {
                continue;
            }
            let Some(order) = self
                .strategy
                .refill_order(grid as u32, current_price, &self.config)
            else {
                continue;
            };
            match self.engine.place_order(order).await {
                Ok(placed_order) => {
                    debug!(
                        "refilled grid {grid}: {} {}@{}",
                        placed_order.side.as_str(),
                        placed_order.amount,
                        placed_order.price
                    );
                    placed += 1;
                }
                Err(e) => error!("refill of grid {grid} failed: {e}"),
            }
        }
        info!("refill complete: {placed}/{} orders placed", missing.len());
    }

    /// Final stage: with the order set settled, compare the venue position
    /// to the expected position and close the gap with a market order.
    /// Requires the order count to be exactly right, since the expectation is
    /// meaningless otherwise.
    async fn reconcile_position(&self) -> GridResult<()> {
        let (orders, positions) = self.fetch_both().await?;
        let (buys, sells) = count_sides(&orders);

        if orders.len() != self.config.grid_count as usize {
            debug!(
                "position reconciliation deferred: {} orders vs {} expected",
                orders.len(),
                self.config.grid_count
            );
            return Ok(());
        }

        let check = self.check_position(self.expected_position(buys, sells), &positions);
        if check.healthy {
            debug!("position healthy (delta {})", check.delta);
            return Ok(());
        }

        if self.modes.price_lock_locked() {
            info!(
                "price locked: position gap {} left for a later pass",
                check.delta
            );
            return Ok(());
        }

        let side = if check.delta > Decimal::ZERO {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        let amount = self.config.round_amount(check.delta.abs());
        if amount.is_zero() {
            return Ok(());
        }

        warn!(
            "position off by {} (expected {}, actual {}), issuing {} market order for {amount}",
            check.delta,
            check.expected,
            check.actual,
            side.as_str()
        );
        self.engine.place_market_order(side, amount, false).await?;

        sleep(ADJUST_SETTLE).await;
        let (_, verify_positions) = self.fetch_both().await?;
        let verify = self.check_position(check.expected, &verify_positions);
        if verify.healthy {
            info!("position reconciled");
        } else {
            warn!(
                "position still off after adjustment (delta {}), deferring to next pass",
                verify.delta
            );
        }
        Ok(())
    }
}

fn count_sides(orders: &[OrderData]) -> (usize, usize) {
    let buys = orders.iter().filter(|o| o.side == OrderSide::Buy).count();
    (buys, orders.len() - buys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::settings_long;
    use crate::config::{GridConfig, GridType};
    use crate::exchange::mock::MockExchange;
    use crate::exchange::{PositionSide, VenueOrderStatus};
    use rust_decimal_macros::dec;

    fn order_at(id: &str, side: OrderSide, price: Decimal) -> OrderData {
        OrderData {
            id: id.into(),
            client_id: None,
            side,
            price,
            amount: dec!(1.000),
            filled: dec!(0),
            average: None,
            status: VenueOrderStatus::Open,
        }
    }

    fn checker_with(config: GridConfig) -> (Arc<OrderHealthChecker>, Arc<MockExchange>) {
        let venue = Arc::new(MockExchange::new(dec!(105.00)));
        let config = Arc::new(config);
        let engine = Arc::new(ExecutionEngine::new(config.clone(), venue.clone()));
        let modes = Arc::new(ModeManagers::from_config(&config));
        let flags = Arc::new(ControlFlags::new());
        flags.set_running(true);
        let checker = Arc::new(OrderHealthChecker::new(
            config,
            venue.clone(),
            engine,
            modes,
            flags,
        ));
        (checker, venue)
    }

    #[test]
    fn test_expected_position_flat_grid() {
        let (checker, _) = checker_with(GridConfig::from_settings(settings_long()).unwrap());
        // 97 buys resting of 100: three fills of 1.000 each
        assert_eq!(checker.expected_position(97, 0), dec!(3.000));
        // Untouched grid
        assert_eq!(checker.expected_position(100, 0), dec!(0));
    }

    #[test]
    fn test_expected_position_short_is_negative() {
        let mut settings = settings_long();
        settings.grid_type = GridType::Short;
        let (checker, _) = checker_with(GridConfig::from_settings(settings).unwrap());
        assert_eq!(checker.expected_position(0, 95), dec!(-5.000));
    }

    #[test]
    fn test_expected_position_martingale_rounds_per_order() {
        let mut settings = settings_long();
        settings.grid_type = GridType::MartingaleLong;
        settings.martingale_increment = Some(dec!(0.0005));
        settings.quantity_precision = 3;
        let (checker, _) = checker_with(GridConfig::from_settings(settings).unwrap());

        // Four fills walk down grids 100..97 with raw sizes 1.0000,
        // 1.0005, 1.0010, 1.0015; per-order half-up rounding gives
        // 1.000 + 1.001 + 1.001 + 1.002 = 4.004. Summing raw sizes first
        // and rounding once would give 4.003; the venue's answer is the
        // per-order one.
        assert_eq!(checker.expected_position(96, 0), dec!(4.004));
    }

    #[test]
    fn test_theoretical_range_extends_with_sells() {
        let (checker, _) = checker_with(GridConfig::from_settings(settings_long()).unwrap());

        let buys_only = vec![order_at("a", OrderSide::Buy, dec!(104.90))];
        let range = checker.theoretical_range(&buys_only);
        assert!(!range.extended);
        assert_eq!(range.max_grid, 100);

        let with_sell = vec![
            order_at("a", OrderSide::Buy, dec!(104.90)),
            order_at("b", OrderSide::Sell, dec!(105.00)),
        ];
        let range = checker.theoretical_range(&with_sell);
        assert!(range.extended);
        assert_eq!(range.max_grid, 101);
        // Expected count unchanged: the profit gap accounts for the slack
        assert_eq!(range.expected_count, 100);
    }

    #[test]
    fn test_diagnose_duplicates_and_out_of_range() {
        let (checker, _) = checker_with(GridConfig::from_settings(settings_long()).unwrap());
        let orders = vec![
            order_at("a", OrderSide::Buy, dec!(104.90)),
            order_at("b", OrderSide::Buy, dec!(104.90)),
            order_at("c", OrderSide::Buy, dec!(104.90)),
            order_at("d", OrderSide::Buy, dec!(99.00)),
        ];
        let range = checker.theoretical_range(&orders);
        let problems = checker.diagnose(&orders, &range);

        // First of the three at 104.90 is kept
        assert_eq!(problems.duplicates.len(), 2);
        assert!(problems.duplicates.iter().all(|o| o.id != "a"));
        assert_eq!(problems.out_of_range.len(), 1);
        assert_eq!(problems.out_of_range[0].0.id, "d");
    }

    #[test]
    fn test_coverage_respects_profit_gap() {
        let (checker, _) = checker_with(GridConfig::from_settings(settings_long()).unwrap());

        // Buys at grids 1..=97, sells at 99..=101: grid 98 is the profit
        // gap left by the reversed fill, not a vacancy
        let mut orders = Vec::new();
        for g in 1..=97u32 {
            orders.push(order_at(
                &format!("b{g}"),
                OrderSide::Buy,
                dec!(100.00) + Decimal::from(g - 1) * dec!(0.10),
            ));
        }
        for g in 99..=101u32 {
            orders.push(order_at(
                &format!("s{g}"),
                OrderSide::Sell,
                dec!(100.00) + Decimal::from(g - 1) * dec!(0.10),
            ));
        }

        let range = checker.theoretical_range(&orders);
        let (covered, missing, gap) = checker.coverage(&orders, &range);
        assert_eq!(covered.len(), 100);
        assert_eq!(gap, HashSet::from([98]));
        assert!(missing.is_empty());
    }

    #[test]
    fn test_coverage_finds_true_vacancy() {
        let (checker, _) = checker_with(GridConfig::from_settings(settings_long()).unwrap());

        // Buys at 1..=97 except grid 50; sells at 99..=101
        let mut orders = Vec::new();
        for g in (1..=97u32).filter(|&g| g != 50) {
            orders.push(order_at(
                &format!("b{g}"),
                OrderSide::Buy,
                dec!(100.00) + Decimal::from(g - 1) * dec!(0.10),
            ));
        }
        for g in 99..=101u32 {
            orders.push(order_at(
                &format!("s{g}"),
                OrderSide::Sell,
                dec!(100.00) + Decimal::from(g - 1) * dec!(0.10),
            ));
        }

        let range = checker.theoretical_range(&orders);
        let (_, missing, _) = checker.coverage(&orders, &range);
        assert_eq!(missing, vec![50]);
    }

    fn small_config() -> GridConfig {
        // 10-grid lattice [100, 101] for end-to-end passes
        let mut settings = settings_long();
        settings.lower_price = Some(dec!(100.00));
        settings.upper_price = Some(dec!(101.00));
        GridConfig::from_settings(settings).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_pass_cleans_duplicate_and_refills() {
        let (checker, venue) = checker_with(small_config());
        venue.connect().await.unwrap();
        venue.set_mid_price(dec!(100.55));

        // Grids 1..=5 buys; grid 3 duplicated; grids 6..=10 sells except
        // grid 8 vacant. Highest buy is 5, lowest sell is 7, so the
        // profit gap is grid 6 and grid 8 is true vacancy
        for g in 1..=5u32 {
            venue.seed_open_order(order_at(
                &format!("b{g}"),
                OrderSide::Buy,
                dec!(100.00) + Decimal::from(g - 1) * dec!(0.10),
            ));
        }
        venue.seed_open_order(order_at("dup", OrderSide::Buy, dec!(100.20)));
        for g in [7u32, 9, 10] {
            venue.seed_open_order(order_at(
                &format!("s{g}"),
                OrderSide::Sell,
                dec!(100.00) + Decimal::from(g - 1) * dec!(0.10),
            ));
        }

        checker.perform_check().await.unwrap();

        // The duplicate at 100.20 was cancelled
        assert!(venue.cancelled_ids().contains(&"dup".to_string()));
        // Grid 8 was refilled as a sell (price 100.70 above mid)
        let open = venue.open_orders_snapshot();
        assert!(open
            .iter()
            .any(|o| o.price == dec!(100.70) && o.side == OrderSide::Sell));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_gate_blocks_at_capacity() {
        let (checker, venue) = checker_with(small_config());
        venue.connect().await.unwrap();
        venue.set_mid_price(dec!(100.55));

        // Every grid occupied plus a stray duplicate: eleven orders
        for g in 1..=10u32 {
            let side = if g <= 5 { OrderSide::Buy } else { OrderSide::Sell };
            venue.seed_open_order(order_at(
                &format!("o{g}"),
                side,
                dec!(100.00) + Decimal::from(g - 1) * dec!(0.10),
            ));
        }
        venue.seed_open_order(order_at("extra", OrderSide::Buy, dec!(100.10)));

        checker.perform_check().await.unwrap();

        // The duplicate goes, and the extension grid (11) stays vacant
        // because ten orders already rest; the configured level count is
        // never exceeded
        let open = venue.open_orders_snapshot();
        assert_eq!(open.len(), 10);
        assert!(venue.cancelled_ids().contains(&"extra".to_string()));
        assert!(!open.iter().any(|o| o.price == dec!(101.00) && o.id.starts_with('m')));
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_reconciliation_issues_market_order() {
        let (checker, venue) = checker_with(small_config());
        venue.connect().await.unwrap();
        venue.set_mid_price(dec!(100.55));

        // 8 buys + 2 sells = 10 orders: two fills happened, expected +2.000
        for g in 1..=8u32 {
            venue.seed_open_order(order_at(
                &format!("b{g}"),
                OrderSide::Buy,
                dec!(100.00) + Decimal::from(g - 1) * dec!(0.10),
            ));
        }
        for g in 9..=10u32 {
            venue.seed_open_order(order_at(
                &format!("s{g}"),
                OrderSide::Sell,
                dec!(100.00) + Decimal::from(g - 1) * dec!(0.10),
            ));
        }
        // Venue reports only +1.000
        venue.set_positions(vec![PositionData {
            symbol: "X/USDC".into(),
            side: PositionSide::Long,
            size: dec!(1.000),
            entry_price: dec!(100.30),
            unrealized_pnl: None,
        }]);

        checker.perform_check().await.unwrap();

        // A buy market order for the missing 1.000 was issued
        let markets: Vec<_> = venue
            .created_orders()
            .into_iter()
            .filter(|r| matches!(r.kind, crate::exchange::OrderKind::Market))
            .collect();
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].side, OrderSide::Buy);
        assert_eq!(markets[0].amount, dec!(1.000));
    }

    fn price_locked_checker() -> (Arc<OrderHealthChecker>, Arc<MockExchange>) {
        let mut settings = settings_long();
        settings.lower_price = Some(dec!(100.00));
        settings.upper_price = Some(dec!(101.00));
        settings.price_lock_enabled = true;
        settings.price_lock_threshold = Some(dec!(100.80));
        let (checker, venue) = checker_with(GridConfig::from_settings(settings).unwrap());
        checker
            .modes
            .with_price_lock(|m| m.check_lock(dec!(100.85)));
        (checker, venue)
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_lock_suppresses_refill() {
        let (checker, venue) = price_locked_checker();
        venue.connect().await.unwrap();
        venue.set_mid_price(dec!(100.85));

        // Grid 2 genuinely vacant with room under the cap: a refill would
        // fire if the lock were not engaged
        for g in (1..=10u32).filter(|&g| g != 2) {
            let side = if g <= 5 { OrderSide::Buy } else { OrderSide::Sell };
            venue.seed_open_order(order_at(
                &format!("o{g}"),
                side,
                dec!(100.00) + Decimal::from(g - 1) * dec!(0.10),
            ));
        }

        checker.perform_check().await.unwrap();

        assert!(venue.created_orders().is_empty());
        assert_eq!(venue.open_order_count(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_lock_suppresses_position_reconcile() {
        let (checker, venue) = price_locked_checker();
        venue.connect().await.unwrap();
        venue.set_mid_price(dec!(100.85));

        // Full ladder but five fills' worth of position missing: the
        // correcting market order is held back while locked
        for g in 1..=10u32 {
            let side = if g <= 5 { OrderSide::Buy } else { OrderSide::Sell };
            venue.seed_open_order(order_at(
                &format!("o{g}"),
                side,
                dec!(100.00) + Decimal::from(g - 1) * dec!(0.10),
            ));
        }

        checker.perform_check().await.unwrap();

        assert!(venue.created_orders().is_empty());
        assert_eq!(venue.open_order_count(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scalping_mode_skips_remediation() {
        let mut settings = settings_long();
        settings.lower_price = Some(dec!(100.00));
        settings.upper_price = Some(dec!(101.00));
        settings.scalping_enabled = true;
        let (checker, venue) = checker_with(GridConfig::from_settings(settings).unwrap());
        venue.connect().await.unwrap();
        checker.modes.with_scalping(|m| m.activate());

        venue.seed_open_order(order_at("a", OrderSide::Buy, dec!(100.20)));
        venue.seed_open_order(order_at("b", OrderSide::Buy, dec!(100.20)));

        checker.perform_check().await.unwrap();
        // The duplicate survives: scalping owns the order set
        assert_eq!(venue.open_order_count(), 2);
        assert!(venue.cancelled_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scalping_deviation_emergency_stop() {
        let mut settings = settings_long();
        settings.lower_price = Some(dec!(100.00));
        settings.upper_price = Some(dec!(101.00));
        settings.scalping_enabled = true;
        let (checker, venue) = checker_with(GridConfig::from_settings(settings).unwrap());
        venue.connect().await.unwrap();
        checker.modes.with_scalping(|m| m.activate());

        // 8 buys resting: expected +2.000; venue says +9.000 (350% off)
        for g in 1..=8u32 {
            venue.seed_open_order(order_at(
                &format!("b{g}"),
                OrderSide::Buy,
                dec!(100.00) + Decimal::from(g - 1) * dec!(0.10),
            ));
        }
        venue.set_positions(vec![PositionData {
            symbol: "X/USDC".into(),
            side: PositionSide::Long,
            size: dec!(9.000),
            entry_price: dec!(100.30),
            unrealized_pnl: None,
        }]);

        checker.perform_check().await.unwrap();
        assert!(checker.flags.is_emergency_stopped());
    }
}
