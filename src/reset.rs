//! Atomic grid reset: verified teardown and rebuild.
//!
//! Every reset entry point (take-profit, capital recovery, price follow,
//! scalping take-profit) funnels through `generic_reset`. Steps run
//! strictly in order and each is verified before the next; between the
//! verified cancel and the rebuild, zero orders exist on the venue for
//! this symbol.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{error, info, warn};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use crate::balance_monitor::BalanceSnapshot;
use crate::config::GridConfig;
use crate::control::ControlFlags;
use crate::engine::ExecutionEngine;
use crate::errors::{GridError, GridResult};
use crate::modes::ModeManagers;
use crate::orders::OrderOps;
use crate::position_monitor::PositionMonitor;
use crate::state::SharedState;
use crate::strategy::GridStrategy;
use crate::tracker::PositionTracker;
use crate::types::OrderSide;

const CANCEL_VERIFY_RETRIES: u32 = 3;
const CLOSE_ATTEMPTS: u32 = 5;
/// Capped exponential backoff between close attempts
const CLOSE_BACKOFF_SECS: [u64; 3] = [30, 60, 120];
const CAPITAL_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);
/// Settle time between the rebuild submit and its immediate-fill sync;
/// shorter than the engine's general batch contract
const REBUILD_SYNC_DELAY: Duration = Duration::from_secs(2);

/// What a reset should do beyond the teardown/rebuild core
#[derive(Debug, Clone, Copy)]
pub struct ResetOptions {
    pub close_position: bool,
    pub reinit_capital: bool,
    pub update_price_range: bool,
}

pub struct ResetManager {
    config: Arc<GridConfig>,
    engine: Arc<ExecutionEngine>,
    state: SharedState,
    tracker: Arc<StdMutex<PositionTracker>>,
    strategy: GridStrategy,
    modes: Arc<ModeManagers>,
    flags: Arc<ControlFlags>,
    ops: OrderOps,
    position_monitor: Arc<PositionMonitor>,
    balance_rx: watch::Receiver<BalanceSnapshot>,
}

impl ResetManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<GridConfig>,
        engine: Arc<ExecutionEngine>,
        state: SharedState,
        tracker: Arc<StdMutex<PositionTracker>>,
        modes: Arc<ModeManagers>,
        flags: Arc<ControlFlags>,
        ops: OrderOps,
        position_monitor: Arc<PositionMonitor>,
        balance_rx: watch::Receiver<BalanceSnapshot>,
    ) -> Self {
        Self {
            config,
            engine,
            state,
            tracker,
            strategy: GridStrategy::new(),
            modes,
            flags,
            ops,
            position_monitor,
            balance_rx,
        }
    }

    /// Run the reset workflow. Failure leaves the system paused for the
    /// operator; the resetting flag is cleared either way.
    pub async fn generic_reset(&self, reset_type: &str, opts: ResetOptions) -> GridResult<()> {
        warn!(
            "reset '{reset_type}' starting (close_position={}, reinit_capital={}, \
             update_price_range={})",
            opts.close_position, opts.reinit_capital, opts.update_price_range
        );

        // The flag goes up before the first cancel and comes down after
        // re-initialization; the fill handler drops events in between
        self.flags.set_resetting(true);
        let result = self.run(reset_type, opts).await;
        self.flags.set_resetting(false);

        match &result {
            Ok(()) => info!("reset '{reset_type}' complete"),
            Err(e) => {
                error!("reset '{reset_type}' failed: {e}; pausing for operator");
                self.flags.pause();
            }
        }
        result
    }

    async fn run(&self, reset_type: &str, opts: ResetOptions) -> GridResult<()> {
        self.modes.deactivate_all();

        if !self.ops.cancel_all_with_verification(CANCEL_VERIFY_RETRIES).await {
            return Err(GridError::ResetFailed {
                step: "cancel_all".into(),
                reason: format!(
                    "open orders remain after {CANCEL_VERIFY_RETRIES} verification passes"
                ),
            });
        }

        if opts.close_position {
            self.close_position_with_backoff().await?;
        }

        if opts.update_price_range && self.config.is_follow_mode() {
            let price = self.engine.get_current_price().await?;
            self.config.update_price_range_for_follow_mode(price);
            info!(
                "corridor recentered for '{reset_type}': [{}, {}]",
                self.config.lower_price(),
                self.config.upper_price()
            );
        }

        self.tracker.lock().expect("tracker lock poisoned").reset();
        {
            let mut state = self.state.write().await;
            state.clear_orders();
            let config = self.config.clone();
            state.initialize_levels(config.grid_count, |g| config.price_of(g));
        }

        let orders = self.strategy.initial_orders(&self.config);
        let placed = self
            .engine
            .place_batch_orders_with_sync_delay(orders, REBUILD_SYNC_DELAY)
            .await?;
        let pending = self.engine.get_pending_orders().await;
        {
            let mut state = self.state.write().await;
            for order in pending {
                state.add_order(order);
            }
        }
        info!(
            "grid rebuilt: {} submitted, {} resting",
            placed.len(),
            self.state.read().await.active_order_count()
        );

        if opts.reinit_capital {
            self.reinit_capital_from_next_snapshot().await;
        }

        self.position_monitor.restart_initial_phase().await;
        Ok(())
    }

    /// Reduce-only close with capped exponential backoff. Five attempts,
    /// each re-issuing the close; a final non-zero position aborts the
    /// reset and pauses the system.
    async fn close_position_with_backoff(&self) -> GridResult<()> {
        for attempt in 0..CLOSE_ATTEMPTS {
            let size = match self.position_monitor.query_now().await {
                Ok((size, _)) => size,
                Err(e) => {
                    warn!("position fetch failed during close (attempt {attempt}): {e}");
                    sleep(backoff(attempt)).await;
                    continue;
                }
            };

            if size.is_zero() {
                info!("position flat after {attempt} close attempts");
                return Ok(());
            }

            let side = if size > Decimal::ZERO {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            let amount = self.config.round_amount(size.abs());
            info!(
                "closing position: {} {amount} (attempt {})",
                side.as_str(),
                attempt + 1
            );
            if let Err(e) = self.engine.place_market_order(side, amount, true).await {
                warn!("close order failed: {e}");
            }
            sleep(backoff(attempt)).await;
        }

        match self.position_monitor.query_now().await {
            Ok((size, _)) if size.is_zero() => Ok(()),
            Ok((size, _)) => Err(GridError::ResetFailed {
                step: "close_position".into(),
                reason: format!("position {size} survived {CLOSE_ATTEMPTS} close attempts"),
            }),
            Err(e) => Err(GridError::ResetFailed {
                step: "close_position".into(),
                reason: format!("final position check failed: {e}"),
            }),
        }
    }

    /// Wait for the balance monitor's next snapshot and seed every armed
    /// manager from it.
    async fn reinit_capital_from_next_snapshot(&self) {
        let mut rx = self.balance_rx.clone();
        match timeout(CAPITAL_SNAPSHOT_TIMEOUT, rx.changed()).await {
            Ok(Ok(())) => {}
            _ => warn!(
                "no fresh balance snapshot within {}s, re-seeding from the last one",
                CAPITAL_SNAPSHOT_TIMEOUT.as_secs()
            ),
        }
        let collateral = rx.borrow().collateral_balance;
        if collateral > Decimal::ZERO {
            self.modes.reinit_capital(collateral);
        } else {
            warn!("no usable balance snapshot, capital re-seed deferred to the monitor");
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let idx = (attempt as usize).min(CLOSE_BACKOFF_SECS.len() - 1);
    Duration::from_secs(CLOSE_BACKOFF_SECS[idx])
}
