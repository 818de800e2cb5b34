//! Core data types for the grid engine

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side for grid levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// Lifecycle of a grid order.
///
/// `Pending` on submission, `Open` once the venue acknowledges, `Filled` on
/// a fill event. `Cancelled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }
}

/// A single resting order in the grid lattice.
///
/// The order carries a client-side id from creation; the venue id is filled
/// in once the venue acknowledges. Both ids route to the same arena slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridOrder {
    /// Client-assigned id, stable across the order's life
    pub client_id: String,
    /// Venue-issued id, populated on acknowledgement
    pub venue_id: Option<String>,
    /// Grid level this order belongs to (1-based)
    pub grid_id: u32,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub status: OrderStatus,
    pub filled_price: Option<Decimal>,
    pub filled_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    /// Order whose fill caused this one to be posted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_order_id: Option<String>,
    /// Reverse order posted after this one filled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_order_id: Option<String>,
}

impl GridOrder {
    pub fn new(grid_id: u32, side: OrderSide, price: Decimal, amount: Decimal) -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            venue_id: None,
            grid_id,
            side,
            price,
            amount,
            status: OrderStatus::Pending,
            filled_price: None,
            filled_amount: None,
            created_at: Utc::now(),
            parent_order_id: None,
            reverse_order_id: None,
        }
    }

    /// The id this order is best known by: venue id once assigned,
    /// client id before that.
    pub fn id(&self) -> &str {
        self.venue_id.as_deref().unwrap_or(&self.client_id)
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn mark_open(&mut self, venue_id: impl Into<String>) {
        self.venue_id = Some(venue_id.into());
        self.status = OrderStatus::Open;
    }

    pub fn mark_filled(&mut self, price: Decimal, amount: Decimal) {
        self.status = OrderStatus::Filled;
        self.filled_price = Some(price);
        self.filled_amount = Some(amount);
    }

    pub fn mark_cancelled(&mut self) {
        self.status = OrderStatus::Cancelled;
    }

    pub fn mark_failed(&mut self) {
        self.status = OrderStatus::Failed;
    }

    /// A fresh copy of this order suitable for re-posting at the same level.
    pub fn repost(&self) -> GridOrder {
        GridOrder::new(self.grid_id, self.side, self.price, self.amount)
    }
}

/// One entry in the bounded trade history ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub time: DateTime<Utc>,
    pub grid_id: u32,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    /// Realized profit of this trade, sells only
    pub profit: Option<Decimal>,
    /// Running realized P&L after this trade
    pub realized_pnl: Decimal,
}

/// Read-only statistics snapshot assembled by the coordinator.
///
/// Serializable so an external dashboard can render it without touching
/// live state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GridStatistics {
    pub grid_count: u32,
    pub grid_interval: Decimal,
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    pub current_price: Decimal,
    pub current_grid_id: u32,

    pub current_position: Decimal,
    pub average_cost: Decimal,

    pub pending_buy_orders: usize,
    pub pending_sell_orders: usize,
    pub filled_buy_count: u64,
    pub filled_sell_count: u64,
    pub completed_cycles: u64,

    pub realized_profit: Decimal,
    pub unrealized_profit: Decimal,
    pub total_fees: Decimal,
    pub net_profit: Decimal,

    pub spot_balance: Decimal,
    pub collateral_balance: Decimal,
    pub order_locked_balance: Decimal,

    pub monitoring_mode: String,
    pub grid_utilization: Decimal,

    pub scalping_active: bool,
    pub capital_protection_active: bool,
    pub price_lock_active: bool,
    pub initial_capital: Decimal,

    pub price_escape_active: bool,
    pub price_escape_duration_secs: u64,

    pub scalping_trigger_count: u64,
    pub price_escape_trigger_count: u64,
    pub take_profit_trigger_count: u64,
    pub capital_protection_trigger_count: u64,
}
