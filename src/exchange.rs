//! Exchange adapter contract consumed by the engine.
//!
//! Venue implementations live outside this crate; they translate venue
//! conventions (id schemes, position signs, balance fields) into the types
//! here before anything reaches the engine. The `mock` module provides a
//! scriptable in-memory venue used by the test suite and by the `paper`
//! exchange of the binary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::errors::ExchangeError;
use crate::types::OrderSide;

/// Ticker snapshot
#[derive(Debug, Clone)]
pub struct TickerData {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl TickerData {
    /// Best price estimate: last, then bid/ask mid, then either side alone
    pub fn price(&self) -> Option<Decimal> {
        match (self.last, self.bid, self.ask) {
            (Some(last), _, _) => Some(last),
            (None, Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            (None, Some(bid), None) => Some(bid),
            (None, None, Some(ask)) => Some(ask),
            _ => None,
        }
    }
}

/// One level of an order book
#[derive(Debug, Clone)]
pub struct OrderbookLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Venue-side order status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueOrderStatus {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

/// An order as the venue reports it
#[derive(Debug, Clone)]
pub struct OrderData {
    pub id: String,
    pub client_id: Option<String>,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub filled: Decimal,
    pub average: Option<Decimal>,
    pub status: VenueOrderStatus,
}

/// Position direction, unified before the data reaches the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

/// A position as the venue reports it; `size` is always non-negative
#[derive(Debug, Clone)]
pub struct PositionData {
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Option<Decimal>,
}

impl PositionData {
    /// Signed size: positive long, negative short
    pub fn signed_size(&self) -> Decimal {
        match self.side {
            PositionSide::Long => self.size,
            PositionSide::Short => -self.size,
        }
    }
}

/// A wallet/collateral balance entry.
///
/// Perpetual adapters attach `net_equity` / `net_equity_locked` so the
/// engine can tell account equity apart from the free spot balance.
#[derive(Debug, Clone)]
pub struct BalanceData {
    pub currency: String,
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
    pub net_equity: Option<Decimal>,
    pub net_equity_locked: Option<Decimal>,
}

/// Order type for submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Limit { price: Decimal },
    Market,
}

/// Order submission request
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub amount: Decimal,
    pub reduce_only: bool,
    pub client_id: Option<String>,
}

/// User-data stream event for one order
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub venue_id: String,
    pub client_id: Option<String>,
    pub kind: OrderUpdateKind,
}

#[derive(Debug, Clone)]
pub enum OrderUpdateKind {
    Opened,
    Filled { price: Decimal, amount: Decimal },
    Cancelled,
}

/// The contract any venue implementation must provide.
///
/// Streams hand back plain `mpsc` receivers: one typed channel per event
/// kind, no shared callback lists.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), ExchangeError>;
    async fn disconnect(&self) -> Result<(), ExchangeError>;
    fn is_connected(&self) -> bool;

    /// Age of the venue's last heartbeat, if the venue heartbeats at all.
    /// `None` means the venue is silent when idle and silence must not be
    /// treated as failure.
    fn heartbeat_age(&self) -> Option<Duration> {
        None
    }

    /// Staleness threshold for the heartbeat, venue-specific
    fn heartbeat_timeout(&self) -> Option<Duration> {
        None
    }

    async fn get_ticker(&self, symbol: &str) -> Result<TickerData, ExchangeError>;

    async fn get_orderbook(
        &self,
        symbol: &str,
        depth: usize,
    ) -> Result<Vec<OrderbookLevel>, ExchangeError>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderData>, ExchangeError>;

    async fn get_positions(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<Vec<PositionData>, ExchangeError>;

    async fn get_balances(&self) -> Result<Vec<BalanceData>, ExchangeError>;

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderData, ExchangeError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<u32, ExchangeError>;

    /// Convenience wrapper used by reset and health paths
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: Decimal,
        reduce_only: bool,
    ) -> Result<OrderData, ExchangeError> {
        self.create_order(&OrderRequest {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Market,
            amount,
            reduce_only,
            client_id: None,
        })
        .await
    }

    /// Subscribe to order events; each call yields a fresh receiver
    async fn subscribe_user_data(&self) -> Result<mpsc::Receiver<OrderUpdate>, ExchangeError>;

    /// Subscribe to ticker updates for one symbol
    async fn subscribe_ticker(
        &self,
        symbol: &str,
    ) -> Result<mpsc::Receiver<TickerData>, ExchangeError>;

    /// Optional position push stream; the engine falls back to REST-only
    /// polling when the venue does not offer one.
    async fn subscribe_position_updates(
        &self,
        _symbol: &str,
    ) -> Result<mpsc::Receiver<PositionData>, ExchangeError> {
        Err(ExchangeError::Unsupported(
            "position stream not available".into(),
        ))
    }
}

// ============================================================================
// Scriptable in-memory venue
// ============================================================================

/// Mock venue for tests and paper trading.
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    struct MockState {
        connected: bool,
        mid_price: Decimal,
        open_orders: Vec<OrderData>,
        positions: Vec<PositionData>,
        balances: Vec<BalanceData>,
        next_id: u64,
        created: Vec<OrderRequest>,
        cancelled: Vec<String>,
        fail_create: bool,
        /// When set, marketable limit orders are consumed on arrival and
        /// never appear in the open-orders listing and no event is sent,
        /// the case the immediate-fill sync exists for.
        swallow_marketable: bool,
        user_tx: Option<mpsc::Sender<OrderUpdate>>,
        ticker_tx: Option<mpsc::Sender<TickerData>>,
        heartbeat_age: Option<Duration>,
        heartbeat_timeout: Option<Duration>,
    }

    pub struct MockExchange {
        state: Mutex<MockState>,
    }

    impl MockExchange {
        pub fn new(mid_price: Decimal) -> Self {
            Self {
                state: Mutex::new(MockState {
                    connected: false,
                    mid_price,
                    open_orders: Vec::new(),
                    positions: Vec::new(),
                    balances: Vec::new(),
                    next_id: 1,
                    created: Vec::new(),
                    cancelled: Vec::new(),
                    fail_create: false,
                    swallow_marketable: false,
                    user_tx: None,
                    ticker_tx: None,
                    heartbeat_age: None,
                    heartbeat_timeout: None,
                }),
            }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().expect("mock state poisoned")
        }

        pub fn set_mid_price(&self, price: Decimal) {
            let tx = {
                let mut state = self.lock();
                state.mid_price = price;
                state.ticker_tx.clone()
            };
            if let Some(tx) = tx {
                let _ = tx.try_send(TickerData {
                    bid: None,
                    ask: None,
                    last: Some(price),
                    timestamp: Utc::now(),
                });
            }
        }

        pub fn set_fail_create(&self, fail: bool) {
            self.lock().fail_create = fail;
        }

        pub fn set_swallow_marketable(&self, swallow: bool) {
            self.lock().swallow_marketable = swallow;
        }

        pub fn set_positions(&self, positions: Vec<PositionData>) {
            self.lock().positions = positions;
        }

        pub fn set_balances(&self, balances: Vec<BalanceData>) {
            self.lock().balances = balances;
        }

        pub fn set_heartbeat(&self, age: Option<Duration>, timeout: Option<Duration>) {
            let mut state = self.lock();
            state.heartbeat_age = age;
            state.heartbeat_timeout = timeout;
        }

        pub fn disconnect_ws(&self) {
            self.lock().connected = false;
        }

        pub fn open_order_count(&self) -> usize {
            self.lock().open_orders.len()
        }

        pub fn open_orders_snapshot(&self) -> Vec<OrderData> {
            self.lock().open_orders.clone()
        }

        pub fn created_orders(&self) -> Vec<OrderRequest> {
            self.lock().created.clone()
        }

        pub fn cancelled_ids(&self) -> Vec<String> {
            self.lock().cancelled.clone()
        }

        fn send_update(&self, update: OrderUpdate) {
            let tx = self.lock().user_tx.clone();
            if let Some(tx) = tx {
                let _ = tx.try_send(update);
            }
        }

        /// Fill a resting order: remove it from the book, move the
        /// position, and push a fill event down the user-data stream.
        pub fn fill_order(&self, venue_id: &str) -> bool {
            let order = {
                let mut state = self.lock();
                let idx = state.open_orders.iter().position(|o| o.id == venue_id);
                match idx {
                    Some(idx) => {
                        let order = state.open_orders.remove(idx);
                        apply_position_delta(&mut state.positions, &order);
                        order
                    }
                    None => return false,
                }
            };
            self.send_update(OrderUpdate {
                venue_id: order.id.clone(),
                client_id: order.client_id.clone(),
                kind: OrderUpdateKind::Filled {
                    price: order.price,
                    amount: order.amount,
                },
            });
            true
        }

        /// Cancel from the venue side (a user acting outside the engine)
        pub fn cancel_from_venue(&self, venue_id: &str) -> bool {
            let order = {
                let mut state = self.lock();
                let idx = state.open_orders.iter().position(|o| o.id == venue_id);
                match idx {
                    Some(idx) => state.open_orders.remove(idx),
                    None => return false,
                }
            };
            self.send_update(OrderUpdate {
                venue_id: order.id.clone(),
                client_id: order.client_id.clone(),
                kind: OrderUpdateKind::Cancelled,
            });
            true
        }

        /// Drop an order from the book without any event (missed fill)
        pub fn vanish_order(&self, venue_id: &str) -> bool {
            let mut state = self.lock();
            let before = state.open_orders.len();
            state.open_orders.retain(|o| o.id != venue_id);
            state.open_orders.len() != before
        }

        /// Inject a resting order as if placed outside the engine
        pub fn seed_open_order(&self, order: OrderData) {
            self.lock().open_orders.push(order);
        }

        /// Push a raw event down the user-data stream
        pub fn emit_update(&self, update: OrderUpdate) {
            self.send_update(update);
        }
    }

    fn apply_position_delta(positions: &mut Vec<PositionData>, order: &OrderData) {
        let delta = match order.side {
            OrderSide::Buy => order.amount,
            OrderSide::Sell => -order.amount,
        };
        let signed = positions
            .first()
            .map(|p| p.signed_size())
            .unwrap_or(Decimal::ZERO)
            + delta;
        positions.clear();
        if !signed.is_zero() {
            positions.push(PositionData {
                symbol: String::new(),
                side: if signed > Decimal::ZERO {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                size: signed.abs(),
                entry_price: order.price,
                unrealized_pnl: None,
            });
        }
    }

    #[async_trait]
    impl ExchangeAdapter for MockExchange {
        fn name(&self) -> &str {
            "mock"
        }

        async fn connect(&self) -> Result<(), ExchangeError> {
            self.lock().connected = true;
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ExchangeError> {
            self.lock().connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.lock().connected
        }

        fn heartbeat_age(&self) -> Option<Duration> {
            self.lock().heartbeat_age
        }

        fn heartbeat_timeout(&self) -> Option<Duration> {
            self.lock().heartbeat_timeout
        }

        async fn get_ticker(&self, _symbol: &str) -> Result<TickerData, ExchangeError> {
            let state = self.lock();
            Ok(TickerData {
                bid: None,
                ask: None,
                last: Some(state.mid_price),
                timestamp: Utc::now(),
            })
        }

        async fn get_orderbook(
            &self,
            _symbol: &str,
            _depth: usize,
        ) -> Result<Vec<OrderbookLevel>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<OrderData>, ExchangeError> {
            Ok(self.lock().open_orders.clone())
        }

        async fn get_positions(
            &self,
            _symbols: Option<&[String]>,
        ) -> Result<Vec<PositionData>, ExchangeError> {
            Ok(self.lock().positions.clone())
        }

        async fn get_balances(&self) -> Result<Vec<BalanceData>, ExchangeError> {
            Ok(self.lock().balances.clone())
        }

        async fn create_order(&self, request: &OrderRequest) -> Result<OrderData, ExchangeError> {
            let mut state = self.lock();
            if state.fail_create {
                return Err(ExchangeError::Rejected("mock rejection".into()));
            }

            state.created.push(request.clone());
            let id = format!("m{}", state.next_id);
            state.next_id += 1;

            match request.kind {
                OrderKind::Market => {
                    let order = OrderData {
                        id,
                        client_id: request.client_id.clone(),
                        side: request.side,
                        price: state.mid_price,
                        amount: request.amount,
                        filled: request.amount,
                        average: Some(state.mid_price),
                        status: VenueOrderStatus::Filled,
                    };
                    apply_position_delta(&mut state.positions, &order);
                    Ok(order)
                }
                OrderKind::Limit { price } => {
                    let order = OrderData {
                        id,
                        client_id: request.client_id.clone(),
                        side: request.side,
                        price,
                        amount: request.amount,
                        filled: Decimal::ZERO,
                        average: None,
                        status: VenueOrderStatus::Open,
                    };
                    let marketable = match request.side {
                        OrderSide::Buy => price >= state.mid_price,
                        OrderSide::Sell => price <= state.mid_price,
                    };
                    if !(state.swallow_marketable && marketable) {
                        state.open_orders.push(order.clone());
                    }
                    Ok(order)
                }
            }
        }

        async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<(), ExchangeError> {
            let mut state = self.lock();
            state.cancelled.push(order_id.to_string());
            let before = state.open_orders.len();
            state.open_orders.retain(|o| o.id != order_id);
            if state.open_orders.len() == before {
                return Err(ExchangeError::NotFound(order_id.to_string()));
            }
            Ok(())
        }

        async fn cancel_all_orders(&self, _symbol: &str) -> Result<u32, ExchangeError> {
            let mut state = self.lock();
            let count = state.open_orders.len() as u32;
            let ids: Vec<String> = state.open_orders.iter().map(|o| o.id.clone()).collect();
            state.cancelled.extend(ids);
            state.open_orders.clear();
            Ok(count)
        }

        async fn subscribe_user_data(&self) -> Result<mpsc::Receiver<OrderUpdate>, ExchangeError> {
            let (tx, rx) = mpsc::channel(256);
            self.lock().user_tx = Some(tx);
            Ok(rx)
        }

        async fn subscribe_ticker(
            &self,
            _symbol: &str,
        ) -> Result<mpsc::Receiver<TickerData>, ExchangeError> {
            let (tx, rx) = mpsc::channel(256);
            self.lock().ticker_tx = Some(tx);
            Ok(rx)
        }
    }

}
