//! Balance monitor: periodic equity snapshots.
//!
//! Polls venue balances every 10 seconds and publishes
//! `{spot, collateral, order_locked}` on a watch channel. The first
//! successful snapshot seeds every armed mode manager's initial capital;
//! every successful poll re-checks the take-profit and capital-recovery
//! conditions and raises control events toward the coordinator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval_at;

use crate::config::GridConfig;
use crate::control::ControlEvent;
use crate::engine::ExecutionEngine;
use crate::errors::GridResult;
use crate::exchange::ExchangeAdapter;
use crate::modes::ModeManagers;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// One equity snapshot
#[derive(Debug, Clone, Default)]
pub struct BalanceSnapshot {
    /// Free quote balance not used as margin
    pub spot_balance: Decimal,
    /// Account equity used for P&L decisions. Spot grids add the value of
    /// the base holding so both legs of the pair count.
    pub collateral_balance: Decimal,
    /// Balance locked under resting orders
    pub order_locked_balance: Decimal,
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct BalanceMonitor {
    config: Arc<GridConfig>,
    exchange: Arc<dyn ExchangeAdapter>,
    engine: Arc<ExecutionEngine>,
    modes: Arc<ModeManagers>,
    control_tx: mpsc::Sender<ControlEvent>,
    watch_tx: watch::Sender<BalanceSnapshot>,
}

impl BalanceMonitor {
    pub fn new(
        config: Arc<GridConfig>,
        exchange: Arc<dyn ExchangeAdapter>,
        engine: Arc<ExecutionEngine>,
        modes: Arc<ModeManagers>,
        control_tx: mpsc::Sender<ControlEvent>,
    ) -> (Self, watch::Receiver<BalanceSnapshot>) {
        let (watch_tx, watch_rx) = watch::channel(BalanceSnapshot::default());
        (
            Self {
                config,
                exchange,
                engine,
                modes,
                control_tx,
                watch_tx,
            },
            watch_rx,
        )
    }

    pub fn subscribe(&self) -> watch::Receiver<BalanceSnapshot> {
        self.watch_tx.subscribe()
    }

    pub fn latest(&self) -> BalanceSnapshot {
        self.watch_tx.borrow().clone()
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            info!(
                "balance monitor started ({}s poll)",
                POLL_INTERVAL.as_secs()
            );
            if let Err(e) = monitor.update_balance().await {
                error!("initial balance fetch failed: {e}");
            }

            let mut tick = interval_at(tokio::time::Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(e) = monitor.update_balance().await {
                    error!("balance update failed: {e}");
                }
            }
        })
    }

    /// One poll: fetch, publish, seed capital, check equity triggers
    pub async fn update_balance(&self) -> GridResult<()> {
        let balances = self.exchange.get_balances().await?;
        let quote = self.config.quote_currency();

        let entry = balances
            .iter()
            .find(|b| b.currency.eq_ignore_ascii_case(quote));
        let entry = match entry {
            Some(entry) => entry,
            None => {
                let known: Vec<&str> = balances.iter().map(|b| b.currency.as_str()).collect();
                warn!("no {quote} balance found (currencies: {known:?})");
                return Ok(());
            }
        };

        // Equity must include order-locked funds, so prefer net equity
        // over the free balance
        let spot_balance = entry.free;
        let mut collateral_balance = entry.net_equity.unwrap_or(entry.total);
        let order_locked_balance = entry.net_equity_locked.unwrap_or(entry.used);

        if self.config.is_spot() {
            let base = self.config.base_currency();
            let base_total = balances
                .iter()
                .find(|b| b.currency.eq_ignore_ascii_case(base))
                .map(|b| b.total)
                .unwrap_or(Decimal::ZERO);
            match self.engine.get_current_price().await {
                Ok(price) => collateral_balance += base_total.abs() * price,
                Err(e) => debug!("no price for spot equity yet: {e}"),
            }
        }

        let snapshot = BalanceSnapshot {
            spot_balance,
            collateral_balance,
            order_locked_balance,
            updated_at: Some(Utc::now()),
        };
        self.watch_tx.send_replace(snapshot);
        debug!(
            "balance: spot={spot_balance} collateral={collateral_balance} \
             locked={order_locked_balance}"
        );

        self.modes.seed_initial_capital(collateral_balance);

        if self
            .modes
            .with_capital_protection(|m| m.check_capital_recovery(collateral_balance))
            .unwrap_or(false)
        {
            warn!("capital protection: equity recovered to initial capital");
            let _ = self
                .control_tx
                .send(ControlEvent::CapitalRecovered {
                    collateral: collateral_balance,
                })
                .await;
        }

        let take_profit = self
            .modes
            .with_take_profit(|m| {
                if m.check_take_profit(collateral_balance) {
                    m.activate();
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if take_profit {
            warn!("take-profit threshold reached at equity {collateral_balance}");
            let _ = self
                .control_tx
                .send(ControlEvent::TakeProfitTriggered {
                    collateral: collateral_balance,
                })
                .await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::settings_long;
    use crate::config::{GridConfig, MarketType};
    use crate::exchange::mock::MockExchange;
    use crate::exchange::BalanceData;
    use rust_decimal_macros::dec;

    fn usdc(total: Decimal, net_equity: Option<Decimal>) -> BalanceData {
        BalanceData {
            currency: "USDC".into(),
            free: total,
            used: dec!(0),
            total,
            net_equity,
            net_equity_locked: None,
        }
    }

    async fn monitor_with(
        config: GridConfig,
    ) -> (
        Arc<BalanceMonitor>,
        Arc<MockExchange>,
        mpsc::Receiver<ControlEvent>,
        watch::Receiver<BalanceSnapshot>,
    ) {
        let venue = Arc::new(MockExchange::new(dec!(105.00)));
        let config = Arc::new(config);
        let engine = Arc::new(ExecutionEngine::new(config.clone(), venue.clone()));
        let modes = Arc::new(ModeManagers::from_config(&config));
        let (control_tx, control_rx) = mpsc::channel(16);
        let (monitor, watch_rx) =
            BalanceMonitor::new(config, venue.clone(), engine, modes, control_tx);
        (Arc::new(monitor), venue, control_rx, watch_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_snapshot_seeds_capital() {
        let mut settings = settings_long();
        settings.take_profit_enabled = true;
        let config = GridConfig::from_settings(settings).unwrap();
        let (monitor, venue, _control, _watch) = monitor_with(config).await;

        venue.set_balances(vec![usdc(dec!(1000.00), None)]);
        monitor.update_balance().await.unwrap();

        assert_eq!(
            monitor
                .modes
                .with_take_profit(|m| m.initial_capital())
                .unwrap(),
            dec!(1000.00)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_profit_event() {
        // S5: initial 1000.00, threshold 1%, poll sees 1010.00
        let mut settings = settings_long();
        settings.take_profit_enabled = true;
        settings.take_profit_percentage = dec!(0.01);
        let config = GridConfig::from_settings(settings).unwrap();
        let (monitor, venue, mut control, _watch) = monitor_with(config).await;

        venue.set_balances(vec![usdc(dec!(1000.00), None)]);
        monitor.update_balance().await.unwrap();

        venue.set_balances(vec![usdc(dec!(1010.00), None)]);
        monitor.update_balance().await.unwrap();

        match control.recv().await.unwrap() {
            ControlEvent::TakeProfitTriggered { collateral } => {
                assert_eq!(collateral, dec!(1010.00));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_net_equity_preferred_over_total() {
        let config = GridConfig::from_settings(settings_long()).unwrap();
        let (monitor, venue, _control, watch_rx) = monitor_with(config).await;

        venue.set_balances(vec![usdc(dec!(400.00), Some(dec!(1200.00)))]);
        monitor.update_balance().await.unwrap();

        assert_eq!(watch_rx.borrow().collateral_balance, dec!(1200.00));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spot_collateral_includes_base_leg() {
        let mut settings = settings_long();
        settings.market_type = MarketType::Spot;
        let config = GridConfig::from_settings(settings).unwrap();
        let (monitor, venue, _control, watch_rx) = monitor_with(config).await;

        venue.set_balances(vec![
            usdc(dec!(500.00), None),
            BalanceData {
                currency: "X".into(),
                free: dec!(2.000),
                used: dec!(0),
                total: dec!(2.000),
                net_equity: None,
                net_equity_locked: None,
            },
        ]);
        monitor.update_balance().await.unwrap();

        // 500 USDC + 2 X at 105.00
        assert_eq!(watch_rx.borrow().collateral_balance, dec!(710.00));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capital_recovery_event() {
        let mut settings = settings_long();
        settings.capital_protection_enabled = true;
        let config = GridConfig::from_settings(settings).unwrap();
        let (monitor, venue, mut control, _watch) = monitor_with(config).await;

        venue.set_balances(vec![usdc(dec!(1000.00), None)]);
        monitor.update_balance().await.unwrap();
        monitor.modes.with_capital_protection(|m| m.activate());

        // Below initial capital: nothing
        venue.set_balances(vec![usdc(dec!(900.00), None)]);
        monitor.update_balance().await.unwrap();
        assert!(control.try_recv().is_err());

        venue.set_balances(vec![usdc(dec!(1000.00), None)]);
        monitor.update_balance().await.unwrap();
        assert!(matches!(
            control.recv().await.unwrap(),
            ControlEvent::CapitalRecovered { .. }
        ));
    }
}
