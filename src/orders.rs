//! Verified order operations.
//!
//! Wraps the engine's cancel/place primitives in verification loops that
//! re-check the venue's open-order listing until the intended state is
//! confirmed. Used by the mode transitions and the reset workflow, where
//! an unverified cancel or placement would corrupt the grid.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::sleep;

use crate::config::GridConfig;
use crate::engine::ExecutionEngine;
use crate::exchange::{ExchangeAdapter, OrderData};
use crate::types::{GridOrder, OrderSide};

const FIRST_VERIFY_DELAY: Duration = Duration::from_millis(800);
const RETRY_VERIFY_DELAY: Duration = Duration::from_millis(1500);
const CANCEL_SETTLE_DELAY: Duration = Duration::from_millis(300);
const PLACE_SETTLE_DELAY: Duration = Duration::from_secs(1);
const PLACE_VERIFY_ATTEMPTS: u32 = 3;

pub struct OrderOps {
    config: Arc<GridConfig>,
    exchange: Arc<dyn ExchangeAdapter>,
    engine: Arc<ExecutionEngine>,
}

impl OrderOps {
    pub fn new(
        config: Arc<GridConfig>,
        exchange: Arc<dyn ExchangeAdapter>,
        engine: Arc<ExecutionEngine>,
    ) -> Self {
        Self {
            config,
            exchange,
            engine,
        }
    }

    async fn open_orders(&self) -> Option<Vec<OrderData>> {
        match self.exchange.get_open_orders(&self.config.symbol).await {
            Ok(orders) => Some(orders),
            Err(e) => {
                error!("open-orders fetch failed during verification: {e}");
                None
            }
        }
    }

    /// Cancel everything and confirm the venue agrees. Retries the bulk
    /// cancel on every failed verification pass.
    pub async fn cancel_all_with_verification(&self, max_retries: u32) -> bool {
        if let Err(e) = self.engine.cancel_all_orders().await {
            error!("bulk cancel failed: {e}");
        }

        for retry in 0..max_retries {
            sleep(if retry == 0 {
                FIRST_VERIFY_DELAY
            } else {
                RETRY_VERIFY_DELAY
            })
            .await;

            let open = match self.open_orders().await {
                Some(open) => open,
                None => return false,
            };

            if open.is_empty() {
                info!("cancel-all verified: no open orders remain");
                return true;
            }

            if retry + 1 < max_retries {
                warn!(
                    "cancel-all verification pass {} found {} residual orders, re-issuing",
                    retry + 1,
                    open.len()
                );
                if let Err(e) = self.engine.cancel_all_orders().await {
                    error!("bulk cancel retry failed: {e}");
                }
            } else {
                error!(
                    "cancel-all verification exhausted after {max_retries} passes, \
                     {} orders still open",
                    open.len()
                );
            }
        }
        false
    }

    /// Cancel every resting order on one side and confirm none survive.
    /// The listing is re-fetched from the venue on every attempt so local
    /// bookkeeping drift cannot hide residue.
    pub async fn cancel_side_with_verification(&self, side: OrderSide, max_attempts: u32) -> bool {
        for attempt in 0..max_attempts {
            let targets: Vec<OrderData> = match self.open_orders().await {
                Some(open) => open.into_iter().filter(|o| o.side == side).collect(),
                None => continue,
            };

            if targets.is_empty() {
                info!(
                    "no {} orders remain (attempt {})",
                    side.as_str(),
                    attempt + 1
                );
                return true;
            }

            info!(
                "cancelling {} {} orders (attempt {})",
                targets.len(),
                side.as_str(),
                attempt + 1
            );
            for order in &targets {
                if let Err(e) = self.engine.cancel_order(&order.id).await {
                    warn!("cancel of {} failed: {e}", order.id);
                }
            }
            sleep(CANCEL_SETTLE_DELAY).await;
        }

        match self.open_orders().await {
            Some(open) => {
                let residue = open.iter().filter(|o| o.side == side).count();
                if residue > 0 {
                    error!(
                        "{residue} {} orders survived {max_attempts} cancel attempts",
                        side.as_str()
                    );
                }
                residue == 0
            }
            None => false,
        }
    }

    /// Place an order and confirm the venue lists it. Each retry submits
    /// under a fresh client id; duplicate residue from an ambiguous
    /// attempt is the health checker's to clean.
    pub async fn place_with_verification(
        &self,
        order: GridOrder,
        max_attempts: u32,
    ) -> Option<GridOrder> {
        let mut candidate = order;
        for attempt in 0..max_attempts {
            let placed = match self.engine.place_order(candidate.clone()).await {
                Ok(placed) => placed,
                Err(e) => {
                    warn!("placement attempt {} failed: {e}", attempt + 1);
                    sleep(Duration::from_millis(500)).await;
                    candidate = candidate.repost();
                    continue;
                }
            };

            if placed.is_filled() {
                // Filled on submission: nothing to verify on the book
                return Some(placed);
            }

            sleep(PLACE_SETTLE_DELAY).await;
            for verify in 0..PLACE_VERIFY_ATTEMPTS {
                if let Some(open) = self.open_orders().await {
                    let listed = open.iter().any(|o| {
                        Some(o.id.as_str()) == placed.venue_id.as_deref()
                            || o.client_id.as_deref() == Some(placed.client_id.as_str())
                    });
                    if listed {
                        info!(
                            "placement verified on attempt {} (verify pass {})",
                            attempt + 1,
                            verify + 1
                        );
                        return Some(placed);
                    }
                }
                sleep(PLACE_SETTLE_DELAY).await;
            }

            warn!(
                "order not visible at venue after attempt {}, re-posting",
                attempt + 1
            );
            candidate = candidate.repost();
        }

        error!("placement failed after {max_attempts} attempts");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::config_long;
    use crate::exchange::mock::MockExchange;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    async fn ops_with_mock() -> (OrderOps, Arc<ExecutionEngine>, Arc<MockExchange>) {
        let venue = Arc::new(MockExchange::new(dec!(105.00)));
        let config = Arc::new(config_long());
        let engine = Arc::new(ExecutionEngine::new(config.clone(), venue.clone()));
        engine.initialize().await.unwrap();
        let ops = OrderOps::new(config, venue.clone(), engine.clone());
        (ops, engine, venue)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_with_verification() {
        let (ops, engine, venue) = ops_with_mock().await;

        for grid in [10u32, 20, 30] {
            let price = dec!(100.00) + Decimal::from(grid - 1) * dec!(0.10);
            engine
                .place_order(GridOrder::new(grid, OrderSide::Buy, price, dec!(1.000)))
                .await
                .unwrap();
        }

        assert!(ops.cancel_all_with_verification(3).await);
        assert_eq!(venue.open_order_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_side_leaves_other_side() {
        let (ops, engine, venue) = ops_with_mock().await;

        engine
            .place_order(GridOrder::new(30, OrderSide::Buy, dec!(102.90), dec!(1.000)))
            .await
            .unwrap();
        engine
            .place_order(GridOrder::new(60, OrderSide::Sell, dec!(105.90), dec!(1.000)))
            .await
            .unwrap();

        assert!(ops.cancel_side_with_verification(OrderSide::Sell, 3).await);

        let open = venue.open_orders_snapshot();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, OrderSide::Buy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_place_with_verification_retries() {
        let (ops, _engine, venue) = ops_with_mock().await;

        venue.set_fail_create(true);
        let order = GridOrder::new(30, OrderSide::Buy, dec!(102.90), dec!(1.000));
        // First attempt fails; re-enable before the retry
        let handle = tokio::spawn(async move { ops.place_with_verification(order, 3).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        venue.set_fail_create(false);

        let placed = handle.await.unwrap();
        assert!(placed.is_some());
        assert_eq!(venue.open_order_count(), 1);
    }
}
