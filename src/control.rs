//! Run-control flags and cross-task control events

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{error, info, warn};
use rust_decimal::Decimal;

use crate::config::EscapeDirection;

/// Shared run-control state.
///
/// The reset flag is the happens-before barrier for resets: it is set
/// before any cancel goes out and cleared after re-initialization, and the
/// fill handler drops every event it observes while the flag is up.
#[derive(Debug, Default)]
pub struct ControlFlags {
    running: AtomicBool,
    paused: AtomicBool,
    resetting: AtomicBool,
    emergency_stopped: AtomicBool,
    error_count: AtomicU32,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            warn!("system paused");
        }
    }

    /// Clear the pause unless an emergency stop holds it down
    pub fn resume(&self) -> bool {
        if self.is_emergency_stopped() {
            warn!("resume refused: emergency stop requires operator clearance");
            return false;
        }
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("system resumed");
        }
        self.clear_errors();
        true
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::SeqCst)
    }

    pub fn set_resetting(&self, resetting: bool) {
        self.resetting.store(resetting, Ordering::SeqCst);
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stopped.load(Ordering::SeqCst)
    }

    /// Sticky halt: pauses the system and refuses resume until an
    /// operator clears it.
    pub fn emergency_stop(&self, reason: &str) {
        error!("EMERGENCY STOP: {reason}");
        self.emergency_stopped.store(true, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Operator clearance for a sticky emergency stop
    pub fn clear_emergency(&self) {
        self.emergency_stopped.store(false, Ordering::SeqCst);
        info!("emergency stop cleared by operator");
    }

    /// Returns the new consecutive error count
    pub fn record_error(&self) -> u32 {
        self.error_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn clear_errors(&self) {
        self.error_count.store(0, Ordering::SeqCst);
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }
}

/// Events the monitors raise toward the coordinator's event loop
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// Equity gain reached the take-profit threshold
    TakeProfitTriggered { collateral: Decimal },
    /// Capital protection saw equity recover to initial capital
    CapitalRecovered { collateral: Decimal },
    /// Follow-mode price escape outlasted the timeout
    PriceEscaped {
        price: Decimal,
        direction: EscapeDirection,
    },
}
