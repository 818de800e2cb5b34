//! In-memory grid state: the order arena and per-level occupancy

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::types::{GridOrder, OrderSide};

/// Owning store for in-flight orders.
///
/// One order object per slot; `by_client` and `by_venue` both resolve to
/// the same slot, so an order known under two ids is still a single entry
/// and enumeration never double-counts.
#[derive(Debug, Default)]
pub struct OrderArena {
    slots: Vec<Option<GridOrder>>,
    free: Vec<usize>,
    by_client: HashMap<String, usize>,
    by_venue: HashMap<String, usize>,
}

impl OrderArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_of(&self, id: &str) -> Option<usize> {
        self.by_client
            .get(id)
            .or_else(|| self.by_venue.get(id))
            .copied()
    }

    pub fn insert(&mut self, order: GridOrder) -> usize {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(order);
                slot
            }
            None => {
                self.slots.push(Some(order));
                self.slots.len() - 1
            }
        };
        let order = self.slots[slot].as_ref().expect("slot just written");
        self.by_client.insert(order.client_id.clone(), slot);
        if let Some(venue_id) = &order.venue_id {
            self.by_venue.insert(venue_id.clone(), slot);
        }
        slot
    }

    /// Attach a venue id to an order currently known by another id
    pub fn register_venue_id(&mut self, known_id: &str, venue_id: &str) -> bool {
        match self.slot_of(known_id) {
            Some(slot) => {
                if let Some(order) = self.slots[slot].as_mut() {
                    order.venue_id = Some(venue_id.to_string());
                }
                self.by_venue.insert(venue_id.to_string(), slot);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&GridOrder> {
        self.slot_of(id).and_then(|slot| self.slots[slot].as_ref())
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut GridOrder> {
        self.slot_of(id).and_then(|slot| self.slots[slot].as_mut())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slot_of(id).is_some()
    }

    pub fn remove(&mut self, id: &str) -> Option<GridOrder> {
        let slot = self.slot_of(id)?;
        let order = self.slots[slot].take()?;
        self.by_client.remove(&order.client_id);
        if let Some(venue_id) = &order.venue_id {
            self.by_venue.remove(venue_id);
        }
        self.free.push(slot);
        Some(order)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GridOrder> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn orders(&self) -> Vec<GridOrder> {
        self.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.by_client.clear();
        self.by_venue.clear();
    }

    /// Index-map consistency: every id entry resolves to a live slot whose
    /// order carries exactly that id.
    #[cfg(test)]
    pub fn check_consistency(&self) -> bool {
        let clients_ok = self.by_client.iter().all(|(id, &slot)| {
            self.slots
                .get(slot)
                .and_then(|s| s.as_ref())
                .map(|o| &o.client_id == id)
                .unwrap_or(false)
        });
        let venues_ok = self.by_venue.iter().all(|(id, &slot)| {
            self.slots
                .get(slot)
                .and_then(|s| s.as_ref())
                .map(|o| o.venue_id.as_deref() == Some(id.as_str()))
                .unwrap_or(false)
        });
        clients_ok && venues_ok
    }
}

/// Occupancy of one grid level
#[derive(Debug, Clone, Serialize)]
pub struct GridLevel {
    pub grid_id: u32,
    pub price: Decimal,
    /// Client id of the order resting at this level, if any
    pub occupied_by: Option<String>,
}

/// Overall run state of the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GridStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    Error,
}

/// Registry of active orders and per-level occupancy.
///
/// All mutation happens on the coordinator task; other tasks read through
/// snapshots.
#[derive(Debug)]
pub struct GridState {
    pub levels: BTreeMap<u32, GridLevel>,
    orders: OrderArena,
    pub pending_buy_orders: usize,
    pub pending_sell_orders: usize,
    pub current_price: Decimal,
    pub current_grid_id: u32,
    pub status: GridStatus,
}

impl GridState {
    pub fn new() -> Self {
        Self {
            levels: BTreeMap::new(),
            orders: OrderArena::new(),
            pending_buy_orders: 0,
            pending_sell_orders: 0,
            current_price: Decimal::ZERO,
            current_grid_id: 1,
            status: GridStatus::Idle,
        }
    }

    /// Rebuild the level ladder. Does not touch active orders; resets call
    /// `clear_orders` first.
    pub fn initialize_levels(&mut self, count: u32, price_fn: impl Fn(u32) -> Decimal) {
        self.levels.clear();
        for grid_id in 1..=count {
            self.levels.insert(
                grid_id,
                GridLevel {
                    grid_id,
                    price: price_fn(grid_id),
                    occupied_by: None,
                },
            );
        }
    }

    /// Track a newly placed order. Returns false if the order is already
    /// known (e.g. its fill raced ahead of the batch bookkeeping).
    pub fn add_order(&mut self, order: GridOrder) -> bool {
        if self.orders.contains(&order.client_id)
            || order
                .venue_id
                .as_deref()
                .map(|id| self.orders.contains(id))
                .unwrap_or(false)
        {
            return false;
        }

        match order.side {
            OrderSide::Buy => self.pending_buy_orders += 1,
            OrderSide::Sell => self.pending_sell_orders += 1,
        }
        if let Some(level) = self.levels.get_mut(&order.grid_id) {
            level.occupied_by = Some(order.client_id.clone());
        }
        self.orders.insert(order);
        true
    }

    pub fn remove_order(&mut self, id: &str) -> Option<GridOrder> {
        let order = self.orders.remove(id)?;
        match order.side {
            OrderSide::Buy => self.pending_buy_orders = self.pending_buy_orders.saturating_sub(1),
            OrderSide::Sell => {
                self.pending_sell_orders = self.pending_sell_orders.saturating_sub(1)
            }
        }
        if let Some(level) = self.levels.get_mut(&order.grid_id) {
            if level.occupied_by.as_deref() == Some(order.client_id.as_str()) {
                level.occupied_by = None;
            }
        }
        Some(order)
    }

    /// Mark an active order as filled and drop it from the active set.
    /// A second fill event for the same id finds nothing and returns
    /// `None`, which is what makes duplicate fills a no-op upstream.
    pub fn mark_order_filled(
        &mut self,
        id: &str,
        price: Decimal,
        amount: Decimal,
    ) -> Option<GridOrder> {
        let mut order = self.remove_order(id)?;
        order.mark_filled(price, amount);
        Some(order)
    }

    pub fn get_order(&self, id: &str) -> Option<&GridOrder> {
        self.orders.get(id)
    }

    pub fn register_venue_id(&mut self, known_id: &str, venue_id: &str) -> bool {
        self.orders.register_venue_id(known_id, venue_id)
    }

    pub fn active_orders(&self) -> Vec<GridOrder> {
        self.orders.orders()
    }

    pub fn active_order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn clear_orders(&mut self) {
        self.orders.clear();
        self.pending_buy_orders = 0;
        self.pending_sell_orders = 0;
        for level in self.levels.values_mut() {
            level.occupied_by = None;
        }
    }

    pub fn update_current_price(&mut self, price: Decimal, grid_id: u32) {
        self.current_price = price;
        self.current_grid_id = grid_id;
    }

    /// Percentage of ladder levels with a resting order
    pub fn grid_utilization(&self) -> Decimal {
        if self.levels.is_empty() {
            return Decimal::ZERO;
        }
        let occupied = self
            .levels
            .values()
            .filter(|l| l.occupied_by.is_some())
            .count();
        Decimal::from(occupied) * Decimal::from(100) / Decimal::from(self.levels.len())
    }

    pub fn start(&mut self) {
        self.status = GridStatus::Running;
    }

    pub fn pause(&mut self) {
        self.status = GridStatus::Paused;
    }

    pub fn resume(&mut self) {
        self.status = GridStatus::Running;
    }

    pub fn stop(&mut self) {
        self.status = GridStatus::Stopped;
    }

    pub fn set_error(&mut self) {
        self.status = GridStatus::Error;
    }

    pub fn snapshot(&self) -> GridSnapshot {
        GridSnapshot {
            status: self.status,
            pending_buy_orders: self.pending_buy_orders,
            pending_sell_orders: self.pending_sell_orders,
            active_order_count: self.orders.len(),
            current_price: self.current_price,
            current_grid_id: self.current_grid_id,
            grid_utilization: self.grid_utilization(),
        }
    }

    #[cfg(test)]
    pub fn check_consistency(&self) -> bool {
        self.orders.check_consistency()
    }
}

impl Default for GridState {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the grid state for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct GridSnapshot {
    pub status: GridStatus,
    pub pending_buy_orders: usize,
    pub pending_sell_orders: usize,
    pub active_order_count: usize,
    pub current_price: Decimal,
    pub current_grid_id: u32,
    pub grid_utilization: Decimal,
}

/// Shared handle to the grid state
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<RwLock<GridState>>,
}

impl SharedState {
    pub fn new(state: GridState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, GridState> {
        self.inner.read().await
    }

    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, GridState> {
        self.inner.write().await
    }

    pub async fn snapshot(&self) -> GridSnapshot {
        self.inner.read().await.snapshot()
    }
}
