//! Order execution engine.
//!
//! Owns the pending-order registry, talks to the exchange adapter, and
//! keeps the invariant that order fills are observed within a bounded
//! delay: a WebSocket user-data stream is the primary channel, with REST
//! open-order polling as the fallback whenever the stream degrades.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};

use crate::config::GridConfig;
use crate::errors::{ExchangeError, GridError, GridResult};
use crate::exchange::{
    ExchangeAdapter, OrderData, OrderKind, OrderRequest, OrderUpdate, OrderUpdateKind,
    VenueOrderStatus,
};
use crate::state::OrderArena;
use crate::types::{GridOrder, OrderSide};

const PRICE_CACHE_MAX_AGE: Duration = Duration::from_secs(5);
const REST_CALL_TIMEOUT: Duration = Duration::from_secs(5);
const WS_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const REST_POLL_INTERVAL: Duration = Duration::from_secs(3);
const BATCH_SIZE: usize = 50;
const BATCH_SPACING: Duration = Duration::from_millis(500);
const BATCH_RETRIES: u32 = 2;
const IMMEDIATE_FILL_SYNC_DELAY: Duration = Duration::from_secs(3);
const FILL_CHANNEL_CAPACITY: usize = 512;

struct EngineInner {
    pending: OrderArena,
    /// Ids the engine itself asked to cancel; a cancel event for one of
    /// these must not trigger a heal re-post.
    expected_cancellations: HashSet<String>,
    cached_price: Option<Decimal>,
    price_updated_at: Option<Instant>,
    ws_active: bool,
}

pub struct ExecutionEngine {
    config: Arc<GridConfig>,
    exchange: Arc<dyn ExchangeAdapter>,
    inner: Mutex<EngineInner>,
    fill_tx: mpsc::Sender<GridOrder>,
    fill_rx: Mutex<Option<mpsc::Receiver<GridOrder>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionEngine {
    pub fn new(config: Arc<GridConfig>, exchange: Arc<dyn ExchangeAdapter>) -> Self {
        let (fill_tx, fill_rx) = mpsc::channel(FILL_CHANNEL_CAPACITY);
        Self {
            config,
            exchange,
            inner: Mutex::new(EngineInner {
                pending: OrderArena::new(),
                expected_cancellations: HashSet::new(),
                cached_price: None,
                price_updated_at: None,
                ws_active: false,
            }),
            fill_tx,
            fill_rx: Mutex::new(Some(fill_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connect, subscribe user-data and ticker streams, start the smart
    /// monitor. Call once before trading.
    pub async fn initialize(self: &Arc<Self>) -> GridResult<()> {
        if !self.exchange.is_connected() {
            self.exchange.connect().await?;
            info!("connected to {}", self.exchange.name());
        }

        let user_rx = match self.exchange.subscribe_user_data().await {
            Ok(rx) => {
                self.inner.lock().await.ws_active = true;
                info!("user-data stream subscribed");
                Some(rx)
            }
            Err(e) => {
                error!("user-data subscription failed, starting on REST polling: {e}");
                None
            }
        };

        let ticker_rx = match self.exchange.subscribe_ticker(&self.config.symbol).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("ticker subscription failed, price falls back to REST: {e}");
                None
            }
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Self::smart_monitor(self.clone(), user_rx)));
        if let Some(rx) = ticker_rx {
            tasks.push(tokio::spawn(Self::price_feed(self.clone(), rx)));
        }

        info!(
            "execution engine initialized: {}/{}",
            self.config.exchange, self.config.symbol
        );
        Ok(())
    }

    /// The stream of fills (real, synthetic and immediate) for the
    /// coordinator. Yields `None` after the first call.
    pub async fn take_fill_stream(&self) -> Option<mpsc::Receiver<GridOrder>> {
        self.fill_rx.lock().await.take()
    }

    /// Place a single limit order; returns it with the venue id populated
    pub async fn place_order(&self, mut order: GridOrder) -> GridResult<GridOrder> {
        let request = OrderRequest {
            symbol: self.config.symbol.clone(),
            side: order.side,
            kind: OrderKind::Limit { price: order.price },
            amount: order.amount,
            reduce_only: false,
            client_id: Some(order.client_id.clone()),
        };

        let data = match timeout(REST_CALL_TIMEOUT, self.exchange.create_order(&request)).await {
            Ok(Ok(data)) => data,
            Ok(Err(ExchangeError::Rejected(reason))) => {
                order.mark_failed();
                return Err(GridError::OrderRejected(reason));
            }
            Ok(Err(e)) => {
                order.mark_failed();
                return Err(e.into());
            }
            Err(_) => {
                order.mark_failed();
                return Err(GridError::Exchange(ExchangeError::Timeout(
                    REST_CALL_TIMEOUT.as_secs(),
                )));
            }
        };

        match data.status {
            VenueOrderStatus::Rejected => {
                order.mark_failed();
                Err(GridError::OrderRejected(format!(
                    "venue rejected order at grid {}",
                    order.grid_id
                )))
            }
            VenueOrderStatus::Filled => {
                // Filled on arrival: report through the fill stream instead
                // of the pending set
                order.venue_id = Some(data.id);
                let price = data.average.unwrap_or(order.price);
                let amount = order.amount;
                order.mark_filled(price, amount);
                info!(
                    "order filled on submission: {} {}@{} (grid {})",
                    order.side.as_str(),
                    amount,
                    price,
                    order.grid_id
                );
                let _ = self.fill_tx.send(order.clone()).await;
                Ok(order)
            }
            _ => {
                order.mark_open(data.id);
                debug!(
                    "order placed: {} {}@{} (grid {}, id {})",
                    order.side.as_str(),
                    order.amount,
                    order.price,
                    order.grid_id,
                    order.id()
                );
                self.inner.lock().await.pending.insert(order.clone());
                Ok(order)
            }
        }
    }

    /// Place a batch in sub-batches of at most 50, retrying failures, then
    /// run the one-shot immediate-fill sync.
    pub async fn place_batch_orders(&self, orders: Vec<GridOrder>) -> GridResult<Vec<GridOrder>> {
        self.place_batch_orders_with_sync_delay(orders, IMMEDIATE_FILL_SYNC_DELAY)
            .await
    }

    /// Batch placement with a caller-chosen settle time before the
    /// immediate-fill sync. The reset workflow waits a shorter 2s after
    /// its rebuild submit; everything else uses the 3s default.
    pub async fn place_batch_orders_with_sync_delay(
        &self,
        orders: Vec<GridOrder>,
        sync_delay: Duration,
    ) -> GridResult<Vec<GridOrder>> {
        let total = orders.len();
        info!("placing batch of {total} orders");

        let mut placed = Vec::with_capacity(total);
        let mut failed: Vec<GridOrder> = Vec::new();

        let chunks: Vec<Vec<GridOrder>> = orders.chunks(BATCH_SIZE).map(|c| c.to_vec()).collect();
        for (i, chunk) in chunks.into_iter().enumerate() {
            if i > 0 {
                sleep(BATCH_SPACING).await;
            }
            let copies = chunk.clone();
            let results = join_all(chunk.into_iter().map(|o| self.place_order(o))).await;
            for (copy, result) in copies.into_iter().zip(results) {
                match result {
                    Ok(order) => placed.push(order),
                    Err(e) => {
                        warn!("batch order at grid {} failed: {e}", copy.grid_id);
                        failed.push(copy);
                    }
                }
            }
        }

        let mut attempt = 0;
        while !failed.is_empty() && attempt < BATCH_RETRIES {
            attempt += 1;
            sleep(Duration::from_secs(1)).await;
            info!("retrying {} failed orders (attempt {attempt})", failed.len());

            let retries: Vec<GridOrder> = failed.drain(..).map(|o| o.repost()).collect();
            let copies = retries.clone();
            let results = join_all(retries.into_iter().map(|o| self.place_order(o))).await;
            for (copy, result) in copies.into_iter().zip(results) {
                match result {
                    Ok(order) => placed.push(order),
                    Err(e) => {
                        warn!("retry at grid {} failed: {e}", copy.grid_id);
                        failed.push(copy);
                    }
                }
            }
        }

        for order in &failed {
            error!(
                "order permanently failed: {} {}@{} (grid {})",
                order.side.as_str(),
                order.amount,
                order.price,
                order.grid_id
            );
        }
        info!("batch complete: {}/{} placed", placed.len(), total);

        // Orders marketable at submission can fill before their events are
        // observed; diff against the venue listing and synthesize fills.
        sleep(sync_delay).await;
        if let Err(e) = self.sync_immediate_fills().await {
            warn!("immediate-fill sync failed: {e}");
        }

        Ok(placed)
    }

    /// Diff the pending set against the venue's open orders; anything the
    /// engine still tracks but the venue no longer lists is presumed filled
    /// at its resting price and reported as a synthetic fill.
    pub async fn sync_immediate_fills(&self) -> GridResult<usize> {
        let open = self.exchange.get_open_orders(&self.config.symbol).await?;
        let mut listed: HashSet<String> = HashSet::with_capacity(open.len() * 2);
        for order in &open {
            listed.insert(order.id.clone());
            if let Some(client_id) = &order.client_id {
                listed.insert(client_id.clone());
            }
        }

        let missing: Vec<GridOrder> = {
            let mut inner = self.inner.lock().await;
            let ids: Vec<String> = inner
                .pending
                .iter()
                .filter(|o| {
                    !listed.contains(&o.client_id)
                        && o.venue_id
                            .as_deref()
                            .map(|id| !listed.contains(id))
                            .unwrap_or(true)
                })
                .map(|o| o.client_id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| inner.pending.remove(id))
                .map(|mut order| {
                    let price = order.price;
                    let amount = order.amount;
                    order.mark_filled(price, amount);
                    order
                })
                .collect()
        };

        let count = missing.len();
        for order in missing {
            info!(
                "synthetic fill: {} {}@{} (grid {}, id {})",
                order.side.as_str(),
                order.amount,
                order.price,
                order.grid_id,
                order.id()
            );
            let _ = self.fill_tx.send(order).await;
        }
        Ok(count)
    }

    /// Cancel one order. The id goes into the expected-cancellations set
    /// first so the venue's cancel event is swallowed instead of healed.
    pub async fn cancel_order(&self, id: &str) -> GridResult<bool> {
        {
            let mut inner = self.inner.lock().await;
            inner.expected_cancellations.insert(id.to_string());
            if let Some(order) = inner.pending.get(id) {
                let client_id = order.client_id.clone();
                let venue_id = order.venue_id.clone();
                inner.expected_cancellations.insert(client_id);
                if let Some(venue_id) = venue_id {
                    inner.expected_cancellations.insert(venue_id);
                }
            }
        }

        let result = self.exchange.cancel_order(id, &self.config.symbol).await;
        match result {
            Ok(()) => {
                self.inner.lock().await.pending.remove(id);
                debug!("cancelled order {id}");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                self.inner.lock().await.pending.remove(id);
                debug!("order {id} already gone at venue");
                Ok(true)
            }
            Err(e) => {
                warn!("cancel failed for {id}: {e}");
                Ok(false)
            }
        }
    }

    /// Bulk cancel with the same suppression semantics
    pub async fn cancel_all_orders(&self) -> GridResult<u32> {
        {
            let mut inner = self.inner.lock().await;
            let ids: Vec<String> = inner
                .pending
                .iter()
                .flat_map(|o| {
                    let mut ids = vec![o.client_id.clone()];
                    if let Some(venue_id) = &o.venue_id {
                        ids.push(venue_id.clone());
                    }
                    ids
                })
                .collect();
            inner.expected_cancellations.extend(ids);
        }

        let count = self.exchange.cancel_all_orders(&self.config.symbol).await?;
        self.inner.lock().await.pending.clear();
        info!("cancelled all orders: {count}");
        Ok(count)
    }

    /// Mark an id as engine-cancelled without going through
    /// `cancel_order`; used when another component cancels directly.
    pub async fn expect_cancellation(&self, id: &str) {
        self.inner
            .lock()
            .await
            .expected_cancellations
            .insert(id.to_string());
    }

    /// WebSocket-cached price if fresh (under 5s), otherwise one REST call
    pub async fn get_current_price(&self) -> GridResult<Decimal> {
        {
            let inner = self.inner.lock().await;
            if let (Some(price), Some(at)) = (inner.cached_price, inner.price_updated_at) {
                if at.elapsed() < PRICE_CACHE_MAX_AGE {
                    return Ok(price);
                }
            }
        }

        match timeout(
            REST_CALL_TIMEOUT,
            self.exchange.get_ticker(&self.config.symbol),
        )
        .await
        {
            Ok(Ok(ticker)) => match ticker.price() {
                Some(price) => {
                    let mut inner = self.inner.lock().await;
                    inner.cached_price = Some(price);
                    inner.price_updated_at = Some(Instant::now());
                    Ok(price)
                }
                None => {
                    self.stale_price_or(GridError::Exchange(ExchangeError::Parse(
                        "ticker carried no usable price".into(),
                    )))
                    .await
                }
            },
            Ok(Err(e)) => self.stale_price_or(e.into()).await,
            Err(_) => {
                self.stale_price_or(GridError::Exchange(ExchangeError::Timeout(
                    REST_CALL_TIMEOUT.as_secs(),
                )))
                .await
            }
        }
    }

    async fn stale_price_or(&self, err: GridError) -> GridResult<Decimal> {
        let inner = self.inner.lock().await;
        match inner.cached_price {
            Some(price) => {
                warn!("price fetch failed, serving stale cache: {err}");
                Ok(price)
            }
            None => Err(err),
        }
    }

    /// Market order used by the reset and health paths
    pub async fn place_market_order(
        &self,
        side: OrderSide,
        amount: Decimal,
        reduce_only: bool,
    ) -> GridResult<()> {
        let data = self
            .exchange
            .place_market_order(&self.config.symbol, side, amount, reduce_only)
            .await?;
        info!(
            "market order submitted: {} {} (id {})",
            side.as_str(),
            amount,
            data.id
        );
        Ok(())
    }

    pub async fn get_pending_orders(&self) -> Vec<GridOrder> {
        self.inner.lock().await.pending.orders()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn monitoring_mode(&self) -> &'static str {
        if self.inner.lock().await.ws_active {
            "websocket"
        } else {
            "rest"
        }
    }

    /// Rebuild the pending set from a venue listing so local bookkeeping
    /// reflects venue truth after a health repair.
    pub async fn sync_pending_from_venue(&self, venue_orders: &[OrderData]) {
        let mut inner = self.inner.lock().await;

        let mut listed: HashSet<String> = HashSet::with_capacity(venue_orders.len() * 2);
        for order in venue_orders {
            listed.insert(order.id.clone());
            if let Some(client_id) = &order.client_id {
                listed.insert(client_id.clone());
            }
        }

        let stale: Vec<String> = inner
            .pending
            .iter()
            .filter(|o| {
                !listed.contains(&o.client_id)
                    && o.venue_id
                        .as_deref()
                        .map(|id| !listed.contains(id))
                        .unwrap_or(true)
            })
            .map(|o| o.client_id.clone())
            .collect();
        let removed = stale.len();
        for id in &stale {
            inner.pending.remove(id);
        }

        let mut added = 0usize;
        for data in venue_orders {
            if inner.pending.contains(&data.id)
                || data
                    .client_id
                    .as_deref()
                    .map(|id| inner.pending.contains(id))
                    .unwrap_or(false)
            {
                continue;
            }
            let grid_id = self.config.index_of(data.price);
            let mut order = GridOrder::new(grid_id, data.side, data.price, data.amount);
            if let Some(client_id) = &data.client_id {
                order.client_id = client_id.clone();
            }
            order.mark_open(data.id.clone());
            inner.pending.insert(order);
            added += 1;
        }

        if removed > 0 || added > 0 {
            info!("pending set synced from venue: +{added} -{removed}");
        }
    }

    /// Stop background tasks and cancel everything resting on the venue
    pub async fn stop(&self) -> GridResult<()> {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Err(e) = self.cancel_all_orders().await {
            warn!("cancel-all during engine stop failed: {e}");
        }
        info!("execution engine stopped");
        Ok(())
    }

    async fn set_ws_active(&self, active: bool) {
        self.inner.lock().await.ws_active = active;
    }

    async fn handle_order_update(&self, update: OrderUpdate) {
        enum Action {
            Fill(GridOrder),
            Heal(GridOrder),
        }

        let action = {
            let mut inner = self.inner.lock().await;
            let known_id = if inner.pending.contains(&update.venue_id) {
                Some(update.venue_id.clone())
            } else {
                update
                    .client_id
                    .as_deref()
                    .filter(|id| inner.pending.contains(id))
                    .map(|id| id.to_string())
            };

            match update.kind {
                OrderUpdateKind::Opened => {
                    if let Some(id) = known_id {
                        inner.pending.register_venue_id(&id, &update.venue_id);
                        if let Some(order) = inner.pending.get_mut(&id) {
                            order.status = crate::types::OrderStatus::Open;
                        }
                    }
                    None
                }
                OrderUpdateKind::Filled { price, amount } => match known_id {
                    Some(id) => inner.pending.remove(&id).map(|mut order| {
                        order.mark_filled(price, amount);
                        Action::Fill(order)
                    }),
                    None => {
                        debug!("fill event for untracked order {}", update.venue_id);
                        None
                    }
                },
                OrderUpdateKind::Cancelled => {
                    let mut expected = inner.expected_cancellations.remove(&update.venue_id);
                    if let Some(client_id) = &update.client_id {
                        expected |= inner.expected_cancellations.remove(client_id);
                    }
                    if let Some(id) = &known_id {
                        expected |= inner.expected_cancellations.remove(id);
                    }

                    match known_id.and_then(|id| inner.pending.remove(&id)) {
                        Some(order) if !expected => Some(Action::Heal(order)),
                        _ => None,
                    }
                }
            }
        };

        match action {
            Some(Action::Fill(order)) => {
                info!(
                    "order filled: {} {}@{} (grid {})",
                    order.side.as_str(),
                    order.filled_amount.unwrap_or(order.amount),
                    order.filled_price.unwrap_or(order.price),
                    order.grid_id
                );
                let _ = self.fill_tx.send(order).await;
            }
            Some(Action::Heal(order)) => {
                warn!(
                    "order cancelled outside the engine, re-posting grid {}: {} {}@{}",
                    order.grid_id,
                    order.side.as_str(),
                    order.amount,
                    order.price
                );
                if let Err(e) = self.place_order(order.repost()).await {
                    error!("heal re-post failed for grid {}: {e}", order.grid_id);
                }
            }
            None => {}
        }
    }

    /// Dual-channel fill observation.
    ///
    /// WebSocket primary: consume events, and every 30s verify connection
    /// state plus heartbeat age (venues without idle heartbeats are only
    /// connection-checked; silence is not failure). On degradation, fall
    /// back to 3s REST open-order polling, attempting a resubscribe every
    /// 30s.
    async fn smart_monitor(
        engine: Arc<ExecutionEngine>,
        mut user_rx: Option<mpsc::Receiver<OrderUpdate>>,
    ) {
        let mut ws_check = interval_at(Instant::now() + WS_CHECK_INTERVAL, WS_CHECK_INTERVAL);
        let mut rest_poll = interval_at(Instant::now() + REST_POLL_INTERVAL, REST_POLL_INTERVAL);

        loop {
            if let Some(rx) = user_rx.as_mut() {
                let mut drop_stream = false;
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(update) => engine.handle_order_update(update).await,
                        None => {
                            warn!("user-data stream closed, switching to REST polling");
                            drop_stream = true;
                        }
                    },
                    _ = ws_check.tick() => {
                        let connected = engine.exchange.is_connected();
                        let stale = match (
                            engine.exchange.heartbeat_age(),
                            engine.exchange.heartbeat_timeout(),
                        ) {
                            (Some(age), Some(limit)) => age > limit,
                            _ => false,
                        };
                        if !connected || stale {
                            warn!(
                                "websocket degraded (connected={connected}, stale={stale}), \
                                 switching to REST polling"
                            );
                            drop_stream = true;
                        }
                    }
                }
                if drop_stream {
                    user_rx = None;
                    engine.set_ws_active(false).await;
                }
            } else {
                tokio::select! {
                    _ = rest_poll.tick() => {
                        if let Err(e) = engine.sync_immediate_fills().await {
                            warn!("REST fill poll failed: {e}");
                        }
                    }
                    _ = ws_check.tick() => {
                        match engine.exchange.subscribe_user_data().await {
                            Ok(rx) => {
                                info!("user-data stream restored");
                                user_rx = Some(rx);
                                engine.set_ws_active(true).await;
                            }
                            Err(e) => debug!("resubscribe attempt failed: {e}"),
                        }
                    }
                }
            }
        }
    }

    async fn price_feed(
        engine: Arc<ExecutionEngine>,
        mut rx: mpsc::Receiver<crate::exchange::TickerData>,
    ) {
        while let Some(ticker) = rx.recv().await {
            if let Some(price) = ticker.price() {
                let mut inner = engine.inner.lock().await;
                inner.cached_price = Some(price);
                inner.price_updated_at = Some(Instant::now());
            }
        }
        debug!("ticker stream closed");
    }
}
