//! Position monitor: the REST-based position authority.
//!
//! Polls venue REST once a second, overwrites the tracker with venue
//! truth, and layers three protections on top: a consecutive-failure
//! pause, a post-start/post-reset initialization phase that silences
//! anomaly alarms, and an anomaly detector with a sticky emergency stop.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};

use crate::config::GridConfig;
use crate::control::ControlFlags;
use crate::engine::ExecutionEngine;
use crate::errors::{ExchangeError, GridResult};
use crate::exchange::ExchangeAdapter;
use crate::modes::ModeManagers;
use crate::tracker::PositionTracker;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const REST_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_QUERY_DEBOUNCE: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_FAILURES: u32 = 3;
const INITIAL_PHASE_DURATION: Duration = Duration::from_secs(60);
/// Warn when the position moves by more than this percentage between polls
const CHANGE_ALERT_PERCENT: u32 = 100;
/// Emergency-stop when the position exceeds this multiple of the previous
const MAX_POSITION_MULTIPLIER: u32 = 10;

struct MonitorShared {
    initial_phase_until: Instant,
    last_size: Decimal,
    last_entry: Decimal,
    failures: u32,
    /// Whether this monitor is the one holding the system paused
    rest_paused: bool,
    spot_baseline: Option<Decimal>,
    last_event_query: Option<Instant>,
}

pub struct PositionMonitor {
    config: Arc<GridConfig>,
    exchange: Arc<dyn ExchangeAdapter>,
    engine: Arc<ExecutionEngine>,
    tracker: Arc<StdMutex<PositionTracker>>,
    modes: Arc<ModeManagers>,
    flags: Arc<ControlFlags>,
    shared: Mutex<MonitorShared>,
    query_tx: mpsc::Sender<String>,
    query_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl PositionMonitor {
    pub fn new(
        config: Arc<GridConfig>,
        exchange: Arc<dyn ExchangeAdapter>,
        engine: Arc<ExecutionEngine>,
        tracker: Arc<StdMutex<PositionTracker>>,
        modes: Arc<ModeManagers>,
        flags: Arc<ControlFlags>,
    ) -> Self {
        let (query_tx, query_rx) = mpsc::channel(32);
        Self {
            config,
            exchange,
            engine,
            tracker,
            modes,
            flags,
            shared: Mutex::new(MonitorShared {
                initial_phase_until: Instant::now() + INITIAL_PHASE_DURATION,
                last_size: Decimal::ZERO,
                last_entry: Decimal::ZERO,
                failures: 0,
                rest_paused: false,
                spot_baseline: None,
                last_event_query: None,
            }),
            query_tx,
            query_rx: Mutex::new(Some(query_rx)),
        }
    }

    /// Start the 1s poll loop plus the event-triggered query channel
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.restart_initial_phase().await;
            info!("position monitor started (1s REST poll)");

            let mut query_rx = monitor
                .query_rx
                .lock()
                .await
                .take()
                .expect("position monitor spawned twice");

            if !monitor.poll_once(true).await {
                warn!("initial position sync failed, retrying on schedule");
            }

            let mut tick = interval_at(Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        monitor.poll_once(false).await;
                    }
                    Some(reason) = query_rx.recv() => {
                        monitor.handle_event_query(&reason).await;
                    }
                }
            }
        })
    }

    /// Event-triggered requery, deduplicated over a 5s window
    pub async fn trigger_event_query(&self, reason: &str) {
        let _ = self.query_tx.try_send(reason.to_string());
    }

    async fn handle_event_query(&self, reason: &str) {
        {
            let mut shared = self.shared.lock().await;
            if let Some(last) = shared.last_event_query {
                if last.elapsed() < EVENT_QUERY_DEBOUNCE {
                    debug!("event query '{reason}' deduplicated");
                    return;
                }
            }
            shared.last_event_query = Some(Instant::now());
        }
        info!("event-triggered position query: {reason}");
        self.poll_once(false).await;
    }

    /// Re-enter the initialization phase; resets and startup both go
    /// through here so warm-up position jumps never alarm.
    pub async fn restart_initial_phase(&self) {
        let mut shared = self.shared.lock().await;
        shared.initial_phase_until = Instant::now() + INITIAL_PHASE_DURATION;
        shared.spot_baseline = None;
        info!(
            "position monitor initialization phase: anomaly detection muted for {}s",
            INITIAL_PHASE_DURATION.as_secs()
        );
    }

    async fn poll_once(&self, is_initial: bool) -> bool {
        match timeout(REST_TIMEOUT, self.fetch_position()).await {
            Ok(Ok((size, entry))) => {
                self.on_success(size, entry, is_initial).await;
                true
            }
            Ok(Err(e)) => {
                self.on_failure(&format!("{e}")).await;
                false
            }
            Err(_) => {
                self.on_failure(&format!(
                    "REST query exceeded {}s",
                    REST_TIMEOUT.as_secs()
                ))
                .await;
                false
            }
        }
    }

    /// Signed position and entry price from venue REST
    async fn fetch_position(&self) -> GridResult<(Decimal, Decimal)> {
        if self.config.is_spot() {
            return self.fetch_spot_position().await;
        }

        let symbols = [self.config.symbol.clone()];
        let positions = self.exchange.get_positions(Some(&symbols)).await?;
        let position = positions
            .iter()
            .find(|p| p.symbol == self.config.symbol)
            .or_else(|| positions.first());

        Ok(match position {
            Some(p) => (p.signed_size(), p.entry_price),
            None => (Decimal::ZERO, Decimal::ZERO),
        })
    }

    /// Spot position is derived from the base-currency balance against a
    /// baseline snapshot taken at the first poll, so user-held base
    /// currency never counts as grid exposure.
    async fn fetch_spot_position(&self) -> GridResult<(Decimal, Decimal)> {
        let balances = self.exchange.get_balances().await?;
        let base = self.config.base_currency();
        let total = balances
            .iter()
            .find(|b| b.currency.eq_ignore_ascii_case(base))
            .map(|b| b.total)
            .unwrap_or(Decimal::ZERO);

        let position = {
            let mut shared = self.shared.lock().await;
            match shared.spot_baseline {
                Some(baseline) => total - baseline,
                None => {
                    if let Some(reserve) = &self.config.spot_reserve {
                        if total < reserve.reserve_amount {
                            warn!(
                                "base balance {total} below configured reserve {}",
                                reserve.reserve_amount
                            );
                        }
                    }
                    shared.spot_baseline = Some(total);
                    info!("spot baseline recorded: {total} {base}");
                    Decimal::ZERO
                }
            }
        };

        if position <= Decimal::ZERO {
            return Ok((Decimal::ZERO, Decimal::ZERO));
        }

        // Entry price: tracker's fill-derived average, else the live price
        let tracked = self
            .tracker
            .lock()
            .expect("tracker lock poisoned")
            .average_cost();
        let entry = if tracked > Decimal::ZERO {
            tracked
        } else {
            self.engine.get_current_price().await.unwrap_or(Decimal::ZERO)
        };
        Ok((position, entry))
    }

    async fn on_success(&self, size: Decimal, entry: Decimal, is_initial: bool) {
        let release_pause = {
            let mut shared = self.shared.lock().await;
            shared.failures = 0;

            if !is_initial {
                self.check_anomaly(&mut shared, size);
            }

            let changed = size != shared.last_size;
            if is_initial {
                info!("initial position synced: {size} @ {entry}");
            } else if changed {
                info!(
                    "position changed: {} -> {size} @ {entry}",
                    shared.last_size
                );
            }
            shared.last_size = size;
            shared.last_entry = entry;

            std::mem::take(&mut shared.rest_paused)
        };

        self.tracker
            .lock()
            .expect("tracker lock poisoned")
            .sync_initial_position(size, entry);

        if self.modes.scalping_active() {
            self.modes.with_scalping(|m| m.update_position(size, entry));
        }

        if release_pause {
            info!("REST polling recovered, releasing failure pause");
            self.flags.resume();
        }
    }

    /// Anomaly detection with quantization: positions below one
    /// `order_amount` count as zero so precision dust never alarms.
    fn check_anomaly(&self, shared: &mut MonitorShared, new_size: Decimal) {
        if Instant::now() < shared.initial_phase_until {
            debug!("initialization phase: anomaly detection muted");
            return;
        }

        let quantize = |size: Decimal| {
            if size.abs() < self.config.order_amount {
                Decimal::ZERO
            } else {
                size
            }
        };
        let prev = quantize(shared.last_size);
        let next = quantize(new_size);

        if prev.is_zero() {
            return;
        }

        let change_percent = (next - prev).abs() / prev.abs() * Decimal::from(100);
        if change_percent > Decimal::from(CHANGE_ALERT_PERCENT) {
            warn!(
                "position change anomaly: {prev} -> {next} ({change_percent:.1}% > {}%)",
                CHANGE_ALERT_PERCENT
            );
        }

        if next.abs() > prev.abs() * Decimal::from(MAX_POSITION_MULTIPLIER) {
            self.flags.emergency_stop(&format!(
                "position {next} exceeds {MAX_POSITION_MULTIPLIER}x previous {prev}; \
                 operator clearance required"
            ));
        }
    }

    async fn on_failure(&self, reason: &str) {
        let mut shared = self.shared.lock().await;
        shared.failures += 1;
        error!(
            "position poll failed ({}/{MAX_CONSECUTIVE_FAILURES}): {reason}",
            shared.failures
        );

        if shared.failures >= MAX_CONSECUTIVE_FAILURES && !shared.rest_paused {
            shared.rest_paused = true;
            error!("REST polling failed {MAX_CONSECUTIVE_FAILURES} times in a row, pausing orders");
            self.flags.pause();
        }
    }

    pub async fn last_position(&self) -> (Decimal, Decimal) {
        let shared = self.shared.lock().await;
        (shared.last_size, shared.last_entry)
    }

    /// Direct poll used by activation paths that need fresh venue truth
    pub async fn query_now(&self) -> GridResult<(Decimal, Decimal)> {
        match timeout(REST_TIMEOUT, self.fetch_position()).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(REST_TIMEOUT.as_secs()).into()),
        }
    }
}
