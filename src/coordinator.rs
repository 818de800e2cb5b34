//! Grid coordinator: the event loop tying fills to reverse orders, mode
//! transitions and resets.
//!
//! The coordinator owns the grid state and the tracker; every mutation
//! happens on its task. Background work (monitors, health checker, price
//! watch) runs in supervised tasks that communicate back through typed
//! channels, so `stop()` can cancel each one deterministically.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

use crate::balance_monitor::{BalanceMonitor, BalanceSnapshot};
use crate::config::GridConfig;
use crate::control::{ControlEvent, ControlFlags};
use crate::engine::ExecutionEngine;
use crate::errors::{GridError, GridResult};
use crate::exchange::ExchangeAdapter;
use crate::health::OrderHealthChecker;
use crate::modes::ModeManagers;
use crate::orders::OrderOps;
use crate::position_monitor::PositionMonitor;
use crate::reset::{ResetManager, ResetOptions};
use crate::state::{GridState, SharedState};
use crate::strategy::GridStrategy;
use crate::tracker::PositionTracker;
use crate::types::{GridOrder, GridStatistics, OrderSide};

const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const PRICE_WATCH_INTERVAL: Duration = Duration::from_secs(10);
const CANCEL_VERIFY_ATTEMPTS: u32 = 3;

pub struct GridCoordinator {
    config: Arc<GridConfig>,
    exchange: Arc<dyn ExchangeAdapter>,
    engine: Arc<ExecutionEngine>,
    state: SharedState,
    tracker: Arc<StdMutex<PositionTracker>>,
    strategy: GridStrategy,
    modes: Arc<ModeManagers>,
    flags: Arc<ControlFlags>,
    ops: OrderOps,
    reset: ResetManager,
    position_monitor: Arc<PositionMonitor>,
    balance_monitor: Arc<BalanceMonitor>,
    health_checker: Arc<OrderHealthChecker>,
    balance_rx: watch::Receiver<BalanceSnapshot>,

    fill_rx: Option<mpsc::Receiver<GridOrder>>,
    control_rx: Option<mpsc::Receiver<ControlEvent>>,
    control_tx: mpsc::Sender<ControlEvent>,
    tasks: Vec<JoinHandle<()>>,

    scalping_trigger_count: u64,
    price_escape_trigger_count: u64,
    take_profit_trigger_count: u64,
    capital_protection_trigger_count: u64,
}

impl GridCoordinator {
    pub fn new(config: GridConfig, exchange: Arc<dyn ExchangeAdapter>) -> Self {
        let config = Arc::new(config);
        let engine = Arc::new(ExecutionEngine::new(config.clone(), exchange.clone()));
        let state = SharedState::new(GridState::new());
        let tracker = Arc::new(StdMutex::new(PositionTracker::new(config.clone())));
        let modes = Arc::new(ModeManagers::from_config(&config));
        let flags = Arc::new(ControlFlags::new());
        let (control_tx, control_rx) = mpsc::channel(64);

        let position_monitor = Arc::new(PositionMonitor::new(
            config.clone(),
            exchange.clone(),
            engine.clone(),
            tracker.clone(),
            modes.clone(),
            flags.clone(),
        ));
        let (balance_monitor, balance_rx) = BalanceMonitor::new(
            config.clone(),
            exchange.clone(),
            engine.clone(),
            modes.clone(),
            control_tx.clone(),
        );
        let balance_monitor = Arc::new(balance_monitor);
        let health_checker = Arc::new(OrderHealthChecker::new(
            config.clone(),
            exchange.clone(),
            engine.clone(),
            modes.clone(),
            flags.clone(),
        ));
        let reset = ResetManager::new(
            config.clone(),
            engine.clone(),
            state.clone(),
            tracker.clone(),
            modes.clone(),
            flags.clone(),
            OrderOps::new(config.clone(), exchange.clone(), engine.clone()),
            position_monitor.clone(),
            balance_rx.clone(),
        );
        let ops = OrderOps::new(config.clone(), exchange.clone(), engine.clone());

        Self {
            config,
            exchange,
            engine,
            state,
            tracker,
            strategy: GridStrategy::new(),
            modes,
            flags,
            ops,
            reset,
            position_monitor,
            balance_monitor,
            health_checker,
            balance_rx,
            fill_rx: None,
            control_rx: Some(control_rx),
            control_tx,
            tasks: Vec::new(),
            scalping_trigger_count: 0,
            price_escape_trigger_count: 0,
            take_profit_trigger_count: 0,
            capital_protection_trigger_count: 0,
        }
    }

    /// Bring the whole system up: engine, corridor, initial batch,
    /// monitors. After `start`, drive the event loop with `run`.
    pub async fn start(&mut self) -> GridResult<()> {
        info!("starting grid system: {}", self.config.symbol);
        self.engine.initialize().await?;

        if self.config.is_follow_mode() {
            let price = self.engine.get_current_price().await?;
            self.config.update_price_range_for_follow_mode(price);
            info!(
                "follow corridor set from live price {price}: [{}, {}]",
                self.config.lower_price(),
                self.config.upper_price()
            );
        }

        {
            let mut state = self.state.write().await;
            let config = self.config.clone();
            state.initialize_levels(config.grid_count, |g| config.price_of(g));
        }

        self.fill_rx = self.engine.take_fill_stream().await;
        self.flags.set_running(true);

        self.tasks.push(self.position_monitor.spawn());
        self.tasks.push(self.balance_monitor.spawn());
        self.tasks.push(self.health_checker.spawn());
        if self.config.is_follow_mode() || self.config.price_lock_enabled {
            self.tasks.push(self.spawn_price_watch());
        }

        let orders = self.strategy.initial_orders(&self.config);
        info!("placing initial batch of {} orders", orders.len());
        self.engine.place_batch_orders(orders).await?;
        let pending = self.engine.get_pending_orders().await;
        {
            let mut state = self.state.write().await;
            for order in pending {
                state.add_order(order);
            }
            state.start();
        }

        // If the boot price already sits past the trigger grid, scalping
        // activates before the first fill
        if self.modes.scalping.is_some() {
            if let Ok(price) = self.engine.get_current_price().await {
                let grid_idx = self.config.index_of(price);
                let triggered = self
                    .modes
                    .with_scalping(|m| m.should_trigger(price, grid_idx))
                    .unwrap_or(false);
                if triggered {
                    info!("boot price already in scalping territory (grid {grid_idx})");
                    self.activate_scalping().await?;
                }
            }
        }

        info!("grid system started");
        Ok(())
    }

    /// The event loop: fills and control events, until `stop`
    pub async fn run(&mut self) -> GridResult<()> {
        let mut fill_rx = self
            .fill_rx
            .take()
            .ok_or_else(|| GridError::InvalidState("run() called before start()".into()))?;
        let mut control_rx = self
            .control_rx
            .take()
            .ok_or_else(|| GridError::InvalidState("run() called twice".into()))?;

        let mut tick = interval_at(
            Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );

        loop {
            tokio::select! {
                Some(filled) = fill_rx.recv() => {
                    if let Err(e) = self.handle_fill(filled).await {
                        self.handle_error(e);
                    }
                }
                Some(event) = control_rx.recv() => {
                    if let Err(e) = self.handle_control(event).await {
                        self.handle_error(e);
                    }
                }
                _ = tick.tick() => {
                    if !self.flags.is_running() {
                        break;
                    }
                }
            }
        }
        info!("event loop exited");
        Ok(())
    }

    /// The hot path: one fill event
    async fn handle_fill(&mut self, mut filled: GridOrder) -> GridResult<()> {
        if self.flags.is_paused() {
            warn!("paused, dropping fill for grid {}", filled.grid_id);
            return Ok(());
        }
        if self.flags.is_resetting() {
            warn!("resetting, dropping fill for grid {}", filled.grid_id);
            return Ok(());
        }

        let price = filled.filled_price.unwrap_or(filled.price);
        let amount = filled.filled_amount.unwrap_or(filled.amount);
        info!(
            "fill: {} {amount}@{price} (grid {})",
            filled.side.as_str(),
            filled.grid_id
        );

        // Level occupancy and counters; a fill the state never saw (e.g.
        // synthesized before batch bookkeeping) just passes through
        {
            let mut state = self.state.write().await;
            state.mark_order_filled(filled.id(), price, amount);
        }
        self.tracker
            .lock()
            .expect("tracker lock poisoned")
            .record_filled_order(&filled);

        self.position_monitor.trigger_event_query("order_filled").await;

        // Scalping take-profit fill ends the episode with a reset
        let tp_filled = self
            .modes
            .with_scalping(|m| m.is_active() && m.is_take_profit_order(&filled))
            .unwrap_or(false);
        if tp_filled {
            warn!("scalping take-profit filled");
            return self
                .reset
                .generic_reset(
                    "scalping_take_profit",
                    ResetOptions {
                        close_position: false,
                        reinit_capital: true,
                        update_price_range: self.config.is_follow_mode(),
                    },
                )
                .await;
        }

        if self.modes.scalping_active() {
            let (position, avg) = {
                let tracker = self.tracker.lock().expect("tracker lock poisoned");
                (tracker.current_position(), tracker.average_cost())
            };
            self.modes
                .with_scalping(|m| m.update_position(position, avg));
            self.update_scalping_take_profit_if_needed().await;
        }

        // Capital protection arms on grid progress; recovery is watched
        // by the balance monitor
        let grid_idx = self.config.index_of(price);
        let cp_armed = self
            .modes
            .with_capital_protection(|m| {
                if m.should_trigger(price, grid_idx) {
                    m.activate();
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if cp_armed {
            self.capital_protection_trigger_count += 1;
        }

        // Scalping veto: position-building fills get no counter-order
        let veto = self.modes.scalping_active()
            && !self
                .modes
                .with_scalping(|m| m.should_post_reverse(filled.side))
                .unwrap_or(true);
        if veto {
            debug!("scalping active: no reverse order for this fill");
            self.refresh_price_and_modes().await?;
            self.flags.clear_errors();
            return Ok(());
        }

        if self.modes.price_lock_locked() {
            info!("price locked: reverse order suppressed");
            self.refresh_price_and_modes().await?;
            self.flags.clear_errors();
            return Ok(());
        }

        // At most one reverse order per fill
        if let Some(reverse) = self.strategy.reverse_order(&filled, &self.config) {
            let placed = self.engine.place_order(reverse).await?;
            filled.reverse_order_id = Some(placed.client_id.clone());
            info!(
                "reverse order posted: {} {}@{} (grid {}, parent {})",
                placed.side.as_str(),
                placed.amount,
                placed.price,
                placed.grid_id,
                filled.id()
            );
            if !placed.is_filled() {
                self.state.write().await.add_order(placed);
            }
        }

        self.refresh_price_and_modes().await?;
        self.flags.clear_errors();
        Ok(())
    }

    /// Refresh the cached price/grid and re-evaluate scalping against it
    async fn refresh_price_and_modes(&mut self) -> GridResult<()> {
        let price = match self.engine.get_current_price().await {
            Ok(price) => price,
            Err(e) => {
                warn!("price refresh failed: {e}");
                return Ok(());
            }
        };
        let grid_idx = self.config.index_of(price);
        self.state.write().await.update_current_price(price, grid_idx);

        if self.modes.scalping.is_some() && !self.flags.is_resetting() {
            let trigger = self
                .modes
                .with_scalping(|m| m.should_trigger(price, grid_idx))
                .unwrap_or(false);
            if trigger {
                self.activate_scalping().await?;
            } else {
                let exit = self
                    .modes
                    .with_scalping(|m| m.should_exit(price, grid_idx))
                    .unwrap_or(false);
                if exit {
                    self.deactivate_scalping().await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_control(&mut self, event: ControlEvent) -> GridResult<()> {
        if self.flags.is_resetting() {
            debug!("resetting, dropping control event {event:?}");
            return Ok(());
        }
        match event {
            ControlEvent::TakeProfitTriggered { collateral } => {
                self.take_profit_trigger_count += 1;
                info!("take-profit reset at equity {collateral}");
                self.reset
                    .generic_reset(
                        "take_profit",
                        ResetOptions {
                            close_position: true,
                            reinit_capital: true,
                            update_price_range: self.config.is_follow_mode(),
                        },
                    )
                    .await
            }
            ControlEvent::CapitalRecovered { collateral } => {
                if !self.modes.capital_protection_active() {
                    return Ok(());
                }
                info!("capital protection reset at equity {collateral} (corridor kept)");
                self.reset
                    .generic_reset(
                        "capital_protection",
                        ResetOptions {
                            close_position: true,
                            reinit_capital: true,
                            update_price_range: false,
                        },
                    )
                    .await
            }
            ControlEvent::PriceEscaped { price, direction } => {
                self.price_escape_trigger_count += 1;
                info!(
                    "price escaped {} at {price}, recentering corridor",
                    direction.as_str()
                );
                self.reset
                    .generic_reset(
                        "price_follow",
                        ResetOptions {
                            close_position: true,
                            reinit_capital: false,
                            update_price_range: true,
                        },
                    )
                    .await
            }
        }
    }

    fn handle_error(&mut self, error: GridError) {
        let count = self.flags.record_error();
        error!("handler error ({count}/{MAX_CONSECUTIVE_ERRORS}): {error}");
        if count >= MAX_CONSECUTIVE_ERRORS {
            error!("too many consecutive errors, auto-pausing");
            self.flags.pause();
        }
    }

    /// Scalping activation: verified counter-side cancel, live position
    /// fetch, single verified take-profit order.
    async fn activate_scalping(&mut self) -> GridResult<()> {
        self.modes.with_scalping(|m| m.activate());
        self.scalping_trigger_count += 1;

        let counter_side = if self.config.is_long_family() {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        if !self
            .ops
            .cancel_side_with_verification(counter_side, CANCEL_VERIFY_ATTEMPTS)
            .await
        {
            error!("counter-side cancel failed, aborting scalping activation");
            self.modes.with_scalping(|m| m.deactivate());
            return Ok(());
        }

        let (position, entry) = match self.position_monitor.query_now().await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("live position fetch failed, using tracker view: {e}");
                let tracker = self.tracker.lock().expect("tracker lock poisoned");
                (tracker.current_position(), tracker.average_cost())
            }
        };
        self.modes
            .with_scalping(|m| m.update_position(position, entry));
        info!("scalping position: {position} @ {entry}");

        self.place_scalping_take_profit().await;
        Ok(())
    }

    async fn place_scalping_take_profit(&mut self) {
        let order = self
            .modes
            .with_scalping(|m| m.take_profit_order(&self.config))
            .flatten();
        let Some(order) = order else {
            info!("flat position, no scalping take-profit order");
            return;
        };

        match self
            .ops
            .place_with_verification(order, CANCEL_VERIFY_ATTEMPTS)
            .await
        {
            Some(placed) => {
                info!(
                    "scalping take-profit resting: {} {}@{}",
                    placed.side.as_str(),
                    placed.amount,
                    placed.price
                );
                self.modes
                    .with_scalping(|m| m.record_take_profit_order(&placed));
                self.state.write().await.add_order(placed);
            }
            None => error!("scalping take-profit placement failed; mode stays active"),
        }
    }

    /// Re-price the take-profit order after a position change:
    /// cancel-verify the old one, submit-verify the new one.
    async fn update_scalping_take_profit_if_needed(&mut self) {
        let position = self
            .tracker
            .lock()
            .expect("tracker lock poisoned")
            .current_position();
        let outdated = self
            .modes
            .with_scalping(|m| m.is_take_profit_outdated(position))
            .unwrap_or(false);
        if !outdated {
            return;
        }

        info!("position changed, re-pricing scalping take-profit");
        let old_id = self
            .modes
            .with_scalping(|m| m.take_profit_order_id().map(str::to_string))
            .flatten();
        if let Some(id) = old_id {
            let mut cancelled = false;
            for _ in 0..CANCEL_VERIFY_ATTEMPTS {
                if self.engine.cancel_order(&id).await.unwrap_or(false) {
                    cancelled = true;
                    break;
                }
                sleep(Duration::from_millis(300)).await;
            }
            if !cancelled {
                error!("stale take-profit order {id} could not be cancelled, keeping it");
                return;
            }
            self.state.write().await.remove_order(&id);
            self.modes.with_scalping(|m| m.clear_take_profit_order());
        }

        self.place_scalping_take_profit().await;
    }

    /// Leave scalping: cancel everything (take-profit included) with
    /// verification, then restore the full ladder.
    async fn deactivate_scalping(&mut self) -> GridResult<()> {
        info!("exiting scalping mode, restoring the grid");
        self.modes.with_scalping(|m| m.deactivate());

        if !self
            .ops
            .cancel_all_with_verification(CANCEL_VERIFY_ATTEMPTS)
            .await
        {
            error!("cancel verification failed, grid not restored; pausing");
            self.flags.pause();
            return Ok(());
        }

        let orders = self.strategy.initial_orders(&self.config);
        self.engine.place_batch_orders(orders).await?;
        let pending = self.engine.get_pending_orders().await;
        {
            let mut state = self.state.write().await;
            state.clear_orders();
            for order in pending {
                state.add_order(order);
            }
        }
        info!("grid restored after scalping exit");
        Ok(())
    }

    /// Price watch task: 10s cadence. Tracks follow-mode escapes against
    /// the timeout and drives the price-lock engage/release cycle.
    fn spawn_price_watch(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let config = self.config.clone();
        let modes = self.modes.clone();
        let flags = self.flags.clone();
        let control_tx = self.control_tx.clone();

        tokio::spawn(async move {
            info!("price watch started ({}s)", PRICE_WATCH_INTERVAL.as_secs());
            let mut tick = interval_at(
                Instant::now() + PRICE_WATCH_INTERVAL,
                PRICE_WATCH_INTERVAL,
            );
            loop {
                tick.tick().await;
                if !flags.is_running() || flags.is_resetting() || flags.is_paused() {
                    continue;
                }
                let price = match engine.get_current_price().await {
                    Ok(price) => price,
                    Err(e) => {
                        warn!("price watch fetch failed: {e}");
                        continue;
                    }
                };

                modes.with_price_lock(|m| {
                    if m.is_locked() {
                        m.check_unlock(price, config.lower_price(), config.upper_price());
                    } else {
                        m.check_lock(price);
                    }
                });

                if config.is_follow_mode() {
                    match config.check_price_escape(price) {
                        Some(direction) => {
                            let escaped_for =
                                modes.with_price_follow(|m| m.record_escape()).unwrap_or_default();
                            let timed_out = modes
                                .with_price_follow(|m| m.timed_out())
                                .unwrap_or(false);
                            if timed_out {
                                modes.with_price_follow(|m| m.mark_triggered());
                                let _ = control_tx
                                    .send(ControlEvent::PriceEscaped { price, direction })
                                    .await;
                            } else {
                                info!(
                                    "price escaping {} for {}s",
                                    direction.as_str(),
                                    escaped_for.as_secs()
                                );
                            }
                        }
                        None => {
                            modes.with_price_follow(|m| {
                                if m.is_escaping() {
                                    info!("price back inside the corridor");
                                    m.clear();
                                }
                            });
                        }
                    }
                }
            }
        })
    }

    pub async fn pause(&self) {
        self.flags.pause();
        self.state.write().await.pause();
    }

    pub async fn resume(&self) {
        if self.flags.resume() {
            self.state.write().await.resume();
        }
    }

    /// Graceful shutdown: stop tasks, cancel resting orders, disconnect
    pub async fn stop(&mut self) -> GridResult<()> {
        info!("stopping grid system");
        self.flags.set_running(false);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.engine.stop().await?;
        if let Err(e) = self.exchange.disconnect().await {
            warn!("disconnect failed: {e}");
        }
        self.state.write().await.stop();
        info!("grid system stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.flags.is_running() && !self.flags.is_paused()
    }

    pub async fn get_statistics(&self) -> GridStatistics {
        let price = self.engine.get_current_price().await.unwrap_or(Decimal::ZERO);
        if price > Decimal::ZERO {
            let grid_idx = self.config.index_of(price);
            self.state.write().await.update_current_price(price, grid_idx);
        }

        let (position, average_cost, realized, fees, buys, sells, cycles, unrealized) = {
            let tracker = self.tracker.lock().expect("tracker lock poisoned");
            (
                tracker.current_position(),
                tracker.average_cost(),
                tracker.realized_pnl(),
                tracker.total_fees(),
                tracker.buy_count(),
                tracker.sell_count(),
                tracker.completed_cycles(),
                tracker.unrealized_pnl(price),
            )
        };
        let balance = self.balance_rx.borrow().clone();
        let state = self.state.read().await;
        let escape = self
            .modes
            .with_price_follow(|m| m.escape_duration())
            .flatten();

        GridStatistics {
            grid_count: self.config.grid_count,
            grid_interval: self.config.grid_interval,
            lower_price: self.config.lower_price(),
            upper_price: self.config.upper_price(),
            current_price: state.current_price,
            current_grid_id: state.current_grid_id,
            current_position: position,
            average_cost,
            pending_buy_orders: state.pending_buy_orders,
            pending_sell_orders: state.pending_sell_orders,
            filled_buy_count: buys,
            filled_sell_count: sells,
            completed_cycles: cycles,
            realized_profit: realized,
            unrealized_profit: unrealized,
            total_fees: fees,
            net_profit: realized + unrealized - fees,
            spot_balance: balance.spot_balance,
            collateral_balance: balance.collateral_balance,
            order_locked_balance: balance.order_locked_balance,
            monitoring_mode: self.engine.monitoring_mode().await.to_string(),
            grid_utilization: state.grid_utilization(),
            scalping_active: self.modes.scalping_active(),
            capital_protection_active: self.modes.capital_protection_active(),
            price_lock_active: self.modes.price_lock_locked(),
            initial_capital: self
                .modes
                .with_take_profit(|m| m.initial_capital())
                .or_else(|| self.modes.with_capital_protection(|m| m.initial_capital()))
                .or_else(|| self.modes.with_scalping(|m| m.initial_capital()))
                .unwrap_or(Decimal::ZERO),
            price_escape_active: escape.is_some(),
            price_escape_duration_secs: escape.map(|d| d.as_secs()).unwrap_or(0),
            scalping_trigger_count: self.scalping_trigger_count,
            price_escape_trigger_count: self.price_escape_trigger_count,
            take_profit_trigger_count: self.take_profit_trigger_count,
            capital_protection_trigger_count: self.capital_protection_trigger_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::settings_long;
    use crate::config::GridSettings;
    use crate::exchange::mock::MockExchange;
    use crate::exchange::{PositionData, PositionSide};
    use rust_decimal_macros::dec;

    fn small_settings() -> GridSettings {
        let mut settings = settings_long();
        settings.lower_price = Some(dec!(100.00));
        settings.upper_price = Some(dec!(101.00));
        settings
    }

    async fn started(settings: GridSettings) -> (GridCoordinator, Arc<MockExchange>) {
        let venue = Arc::new(MockExchange::new(dec!(100.55)));
        let config = GridConfig::from_settings(settings).unwrap();
        let mut coordinator = GridCoordinator::new(config, venue.clone());
        coordinator.start().await.unwrap();
        (coordinator, venue)
    }

    fn filled_order(pending: &[GridOrder], grid_id: u32) -> GridOrder {
        let mut order = pending
            .iter()
            .find(|o| o.grid_id == grid_id)
            .expect("grid occupied")
            .clone();
        let price = order.price;
        let amount = order.amount;
        order.mark_filled(price, amount);
        order
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_places_full_ladder() {
        let (coordinator, venue) = started(small_settings()).await;
        assert_eq!(venue.open_order_count(), 10);
        assert_eq!(coordinator.state.read().await.active_order_count(), 10);
        assert_eq!(coordinator.state.read().await.pending_buy_orders, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_posts_single_reverse_order() {
        // S1 on the small lattice: buy at grid 6 (100.50) fills, one sell
        // appears one grid above (100.60)
        let (mut coordinator, venue) = started(small_settings()).await;
        let pending = coordinator.engine.get_pending_orders().await;
        let filled = filled_order(&pending, 6);
        venue.vanish_order(filled.venue_id.as_deref().unwrap());

        coordinator.handle_fill(filled).await.unwrap();

        let tracker = coordinator.tracker.lock().unwrap();
        assert_eq!(tracker.current_position(), dec!(1.000));
        assert_eq!(tracker.average_cost(), dec!(100.50));
        drop(tracker);

        let state = coordinator.state.read().await;
        assert_eq!(state.pending_buy_orders, 9);
        assert_eq!(state.pending_sell_orders, 1);
        drop(state);

        let open = venue.open_orders_snapshot();
        let sells: Vec<_> = open.iter().filter(|o| o.side == OrderSide::Sell).collect();
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].price, dec!(100.60));
        assert_eq!(sells[0].amount, dec!(1.000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fills_dropped_while_resetting() {
        let (mut coordinator, venue) = started(small_settings()).await;
        let pending = coordinator.engine.get_pending_orders().await;
        let filled = filled_order(&pending, 6);
        let created_before = venue.created_orders().len();

        coordinator.flags.set_resetting(true);
        coordinator.handle_fill(filled).await.unwrap();
        coordinator.flags.set_resetting(false);

        // No reverse order, no tracker movement
        assert_eq!(venue.created_orders().len(), created_before);
        assert_eq!(
            coordinator.tracker.lock().unwrap().current_position(),
            dec!(0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fills_dropped_while_paused() {
        let (mut coordinator, venue) = started(small_settings()).await;
        let pending = coordinator.engine.get_pending_orders().await;
        let filled = filled_order(&pending, 6);
        let created_before = venue.created_orders().len();

        coordinator.flags.pause();
        coordinator.handle_fill(filled).await.unwrap();

        assert_eq!(venue.created_orders().len(), created_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scalping_veto_blocks_reverse_on_buy_fill() {
        let mut settings = small_settings();
        settings.scalping_enabled = true;
        settings.scalping_trigger_percent = 90;
        let (mut coordinator, venue) = started(settings).await;

        coordinator.modes.with_scalping(|m| m.activate());
        let pending = coordinator.engine.get_pending_orders().await;
        let filled = filled_order(&pending, 6);
        venue.vanish_order(filled.venue_id.as_deref().unwrap());
        let open_before = venue.open_order_count();

        // Price deep at the adverse end keeps scalping engaged through
        // the post-fill re-evaluation
        venue.set_mid_price(dec!(100.00));
        coordinator.handle_fill(filled).await.unwrap();

        // No reverse sell appeared while scalping owns the exit
        let open = venue.open_orders_snapshot();
        assert!(open.iter().all(|o| o.side == OrderSide::Buy));
        assert_eq!(open.len(), open_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scalping_activation_cancels_sells_and_posts_take_profit() {
        // S4 shape: activation cancels every sell with verification and
        // posts one take-profit sell at avg + 2 grids
        let mut settings = small_settings();
        settings.scalping_enabled = true;
        settings.scalping_trigger_percent = 90;
        settings.scalping_take_profit_grids = 2;
        let (mut coordinator, venue) = started(settings).await;

        // Some sells resting from earlier reversals
        for grid in [8u32, 9] {
            coordinator
                .engine
                .place_order(GridOrder::new(
                    grid,
                    OrderSide::Sell,
                    dec!(100.00) + Decimal::from(grid - 1) * dec!(0.10),
                    dec!(1.000),
                ))
                .await
                .unwrap();
        }
        // Venue reports the accumulated position
        venue.set_positions(vec![PositionData {
            symbol: "X/USDC".into(),
            side: PositionSide::Long,
            size: dec!(8.000),
            entry_price: dec!(100.30),
            unrealized_pnl: None,
        }]);

        coordinator.activate_scalping().await.unwrap();

        assert!(coordinator.modes.scalping_active());
        let open = venue.open_orders_snapshot();
        let sells: Vec<_> = open.iter().filter(|o| o.side == OrderSide::Sell).collect();
        // Exactly one sell remains: the take-profit at 100.30 + 0.20
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].price, dec!(100.50));
        assert_eq!(sells[0].amount, dec!(8.000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scalping_take_profit_fill_triggers_reset() {
        let mut settings = small_settings();
        settings.scalping_enabled = true;
        let (mut coordinator, venue) = started(settings).await;

        venue.set_positions(vec![PositionData {
            symbol: "X/USDC".into(),
            side: PositionSide::Long,
            size: dec!(3.000),
            entry_price: dec!(100.20),
            unrealized_pnl: None,
        }]);
        coordinator.activate_scalping().await.unwrap();

        let tp_id = coordinator
            .modes
            .with_scalping(|m| m.take_profit_order_id().map(str::to_string))
            .flatten()
            .unwrap();
        let mut tp_order = coordinator
            .engine
            .get_pending_orders()
            .await
            .into_iter()
            .find(|o| o.client_id == tp_id)
            .unwrap();
        venue.vanish_order(tp_order.venue_id.as_deref().unwrap());
        let price = tp_order.price;
        let amount = tp_order.amount;
        tp_order.mark_filled(price, amount);
        // The venue position is flat after the take-profit fill
        venue.set_positions(vec![]);

        coordinator.handle_fill(tp_order).await.unwrap();

        // Reset rebuilt the ladder and dropped out of scalping
        assert!(!coordinator.modes.scalping_active());
        assert!(!coordinator.flags.is_resetting());
        assert_eq!(venue.open_order_count(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_profit_event_resets_grid() {
        // S5: control event from the balance monitor forces a full reset
        let mut settings = small_settings();
        settings.take_profit_enabled = true;
        let (mut coordinator, venue) = started(settings).await;

        venue.set_positions(vec![PositionData {
            symbol: "X/USDC".into(),
            side: PositionSide::Long,
            size: dec!(2.000),
            entry_price: dec!(100.30),
            unrealized_pnl: None,
        }]);

        coordinator
            .handle_control(ControlEvent::TakeProfitTriggered {
                collateral: dec!(1010.00),
            })
            .await
            .unwrap();

        assert_eq!(coordinator.take_profit_trigger_count, 1);
        assert!(venue.get_positions(None).await.unwrap().is_empty());
        assert_eq!(venue.open_order_count(), 10);
        assert!(!coordinator.flags.is_resetting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_lock_suppresses_reverse() {
        let mut settings = small_settings();
        settings.price_lock_enabled = true;
        settings.price_lock_threshold = Some(dec!(100.80));
        let (mut coordinator, venue) = started(settings).await;

        coordinator.modes.with_price_lock(|m| m.check_lock(dec!(100.85)));
        assert!(coordinator.modes.price_lock_locked());

        let pending = coordinator.engine.get_pending_orders().await;
        let filled = filled_order(&pending, 6);
        venue.vanish_order(filled.venue_id.as_deref().unwrap());

        coordinator.handle_fill(filled).await.unwrap();
        let open = venue.open_orders_snapshot();
        assert!(open.iter().all(|o| o.side == OrderSide::Buy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_errors_auto_pause() {
        let (mut coordinator, _venue) = started(small_settings()).await;
        for _ in 0..MAX_CONSECUTIVE_ERRORS {
            coordinator.handle_error(GridError::InvalidState("test".into()));
        }
        assert!(coordinator.flags.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_snapshot() {
        let (mut coordinator, venue) = started(small_settings()).await;
        let pending = coordinator.engine.get_pending_orders().await;
        let filled = filled_order(&pending, 6);
        venue.vanish_order(filled.venue_id.as_deref().unwrap());
        coordinator.handle_fill(filled).await.unwrap();

        let stats = coordinator.get_statistics().await;
        assert_eq!(stats.grid_count, 10);
        assert_eq!(stats.current_position, dec!(1.000));
        assert_eq!(stats.filled_buy_count, 1);
        assert_eq!(stats.pending_sell_orders, 1);
        assert_eq!(stats.monitoring_mode, "websocket");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_everything() {
        let (mut coordinator, venue) = started(small_settings()).await;
        assert_eq!(venue.open_order_count(), 10);

        coordinator.stop().await.unwrap();
        assert_eq!(venue.open_order_count(), 0);
        assert!(!coordinator.flags.is_running());
    }
}
