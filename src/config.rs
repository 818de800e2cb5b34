//! Grid configuration and price-ladder geometry

use std::sync::RwLock;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::errors::{GridError, GridResult};

/// Grid variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridType {
    Long,
    Short,
    MartingaleLong,
    MartingaleShort,
    FollowLong,
    FollowShort,
}

/// Market type the grid runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Perp,
}

impl Default for MarketType {
    fn default() -> Self {
        Self::Perp
    }
}

/// Direction of a price escape from a follow-mode corridor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeDirection {
    Up,
    Down,
}

impl EscapeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscapeDirection::Up => "up",
            EscapeDirection::Down => "down",
        }
    }
}

/// Spot-only reserve of base currency kept out of grid exposure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotReserve {
    pub reserve_amount: Decimal,
}

/// Raw configuration surface as it appears in the config file.
///
/// Converted into [`GridConfig`] (which carries derived fields and the
/// runtime-adjustable corridor) via `GridConfig::from_settings`.
#[derive(Debug, Clone, Deserialize)]
pub struct GridSettings {
    pub exchange: String,
    pub symbol: String,
    pub grid_type: GridType,
    #[serde(default)]
    pub market_type: MarketType,
    pub grid_interval: Decimal,
    pub order_amount: Decimal,

    pub lower_price: Option<Decimal>,
    pub upper_price: Option<Decimal>,

    pub max_position: Option<Decimal>,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    #[serde(default = "default_quantity_precision")]
    pub quantity_precision: u32,

    pub martingale_increment: Option<Decimal>,

    pub follow_grid_count: Option<u32>,
    #[serde(default = "default_follow_timeout")]
    pub follow_timeout: u64,
    #[serde(default = "default_follow_distance")]
    pub follow_distance: u32,
    #[serde(default)]
    pub price_offset_grids: u32,

    #[serde(default)]
    pub scalping_enabled: bool,
    #[serde(default = "default_scalping_trigger_percent")]
    pub scalping_trigger_percent: u32,
    #[serde(default = "default_scalping_take_profit_grids")]
    pub scalping_take_profit_grids: u32,

    #[serde(default)]
    pub capital_protection_enabled: bool,
    #[serde(default = "default_capital_protection_trigger_percent")]
    pub capital_protection_trigger_percent: u32,

    #[serde(default)]
    pub take_profit_enabled: bool,
    #[serde(default = "default_take_profit_percentage")]
    pub take_profit_percentage: Decimal,

    #[serde(default)]
    pub price_lock_enabled: bool,
    pub price_lock_threshold: Option<Decimal>,
    #[serde(default)]
    pub price_lock_start_at_threshold: bool,

    #[serde(default = "default_reverse_order_grid_distance")]
    pub reverse_order_grid_distance: u32,
    #[serde(default = "default_order_health_check_interval")]
    pub order_health_check_interval: u64,

    pub spot_reserve: Option<SpotReserve>,
    /// Position reconciliation tolerance as a fraction of `order_amount`
    pub position_tolerance: Option<Decimal>,
}

fn default_fee_rate() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn default_quantity_precision() -> u32 {
    3
}

fn default_follow_timeout() -> u64 {
    300
}

fn default_follow_distance() -> u32 {
    1
}

fn default_scalping_trigger_percent() -> u32 {
    80
}

fn default_scalping_take_profit_grids() -> u32 {
    2
}

fn default_capital_protection_trigger_percent() -> u32 {
    50
}

fn default_take_profit_percentage() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_reverse_order_grid_distance() -> u32 {
    1
}

fn default_order_health_check_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    lower: Decimal,
    upper: Decimal,
}

/// Validated grid configuration.
///
/// Scalar fields are immutable after load. The price corridor is held
/// behind a lock because follow-mode grids set it at start from the live
/// price and move it on every follow reset.
#[derive(Debug)]
pub struct GridConfig {
    pub exchange: String,
    pub symbol: String,
    pub grid_type: GridType,
    pub market_type: MarketType,
    pub grid_interval: Decimal,
    pub order_amount: Decimal,
    pub grid_count: u32,

    pub max_position: Option<Decimal>,
    pub fee_rate: Decimal,
    pub quantity_precision: u32,

    pub martingale_increment: Option<Decimal>,

    pub follow_timeout: u64,
    pub follow_distance: u32,
    pub price_offset_grids: u32,

    pub scalping_enabled: bool,
    pub scalping_trigger_percent: u32,
    pub scalping_take_profit_grids: u32,

    pub capital_protection_enabled: bool,
    pub capital_protection_trigger_percent: u32,

    pub take_profit_enabled: bool,
    pub take_profit_percentage: Decimal,

    pub price_lock_enabled: bool,
    pub price_lock_threshold: Option<Decimal>,
    pub price_lock_start_at_threshold: bool,

    pub reverse_order_grid_distance: u32,
    pub order_health_check_interval: u64,

    pub spot_reserve: Option<SpotReserve>,
    pub position_tolerance: Option<Decimal>,

    bounds: RwLock<Bounds>,
}

impl GridConfig {
    pub fn from_settings(settings: GridSettings) -> GridResult<Self> {
        let is_follow = matches!(
            settings.grid_type,
            GridType::FollowLong | GridType::FollowShort
        );

        if settings.grid_interval <= Decimal::ZERO {
            return Err(GridError::InvalidConfig(
                "grid_interval must be positive".into(),
            ));
        }
        if settings.order_amount <= Decimal::ZERO {
            return Err(GridError::InvalidConfig(
                "order_amount must be positive".into(),
            ));
        }

        let (grid_count, bounds) = if is_follow {
            let count = settings.follow_grid_count.ok_or_else(|| {
                GridError::InvalidConfig("follow grids require follow_grid_count".into())
            })?;
            if count == 0 {
                return Err(GridError::InvalidConfig(
                    "follow_grid_count must be at least 1".into(),
                ));
            }
            // Corridor is computed from the live price at start
            let bounds = Bounds {
                lower: Decimal::ZERO,
                upper: Decimal::ZERO,
            };
            (count, bounds)
        } else {
            let lower = settings.lower_price.ok_or_else(|| {
                GridError::InvalidConfig("lower_price is required for fixed grids".into())
            })?;
            let upper = settings.upper_price.ok_or_else(|| {
                GridError::InvalidConfig("upper_price is required for fixed grids".into())
            })?;
            if lower >= upper {
                return Err(GridError::InvalidConfig(
                    "lower_price must be less than upper_price".into(),
                ));
            }
            let count = ((upper - lower) / settings.grid_interval)
                .floor()
                .to_u32()
                .unwrap_or(0);
            if count < 1 {
                return Err(GridError::InvalidConfig(format!(
                    "price range [{lower}, {upper}] holds no grid at interval {}",
                    settings.grid_interval
                )));
            }
            (count, Bounds { lower, upper })
        };

        let is_short_family = matches!(
            settings.grid_type,
            GridType::Short | GridType::MartingaleShort | GridType::FollowShort
        );
        if settings.market_type == MarketType::Spot && is_short_family {
            return Err(GridError::InvalidConfig(
                "spot markets do not support short grid variants".into(),
            ));
        }

        if settings.scalping_trigger_percent > 100
            || settings.capital_protection_trigger_percent > 100
        {
            return Err(GridError::InvalidConfig(
                "trigger percentages must be within [0, 100]".into(),
            ));
        }
        if settings.price_lock_enabled && settings.price_lock_threshold.is_none() {
            return Err(GridError::InvalidConfig(
                "price_lock_enabled requires price_lock_threshold".into(),
            ));
        }
        if settings.reverse_order_grid_distance < 1 {
            return Err(GridError::InvalidConfig(
                "reverse_order_grid_distance must be at least 1".into(),
            ));
        }

        Ok(Self {
            exchange: settings.exchange,
            symbol: settings.symbol,
            grid_type: settings.grid_type,
            market_type: settings.market_type,
            grid_interval: settings.grid_interval,
            order_amount: settings.order_amount,
            grid_count,
            max_position: settings.max_position,
            fee_rate: settings.fee_rate,
            quantity_precision: settings.quantity_precision,
            martingale_increment: settings.martingale_increment,
            follow_timeout: settings.follow_timeout,
            follow_distance: settings.follow_distance,
            price_offset_grids: settings.price_offset_grids,
            scalping_enabled: settings.scalping_enabled,
            scalping_trigger_percent: settings.scalping_trigger_percent,
            scalping_take_profit_grids: settings.scalping_take_profit_grids,
            capital_protection_enabled: settings.capital_protection_enabled,
            capital_protection_trigger_percent: settings.capital_protection_trigger_percent,
            take_profit_enabled: settings.take_profit_enabled,
            take_profit_percentage: settings.take_profit_percentage,
            price_lock_enabled: settings.price_lock_enabled,
            price_lock_threshold: settings.price_lock_threshold,
            price_lock_start_at_threshold: settings.price_lock_start_at_threshold,
            reverse_order_grid_distance: settings.reverse_order_grid_distance,
            order_health_check_interval: settings.order_health_check_interval,
            spot_reserve: settings.spot_reserve,
            position_tolerance: settings.position_tolerance,
            bounds: RwLock::new(bounds),
        })
    }

    pub fn lower_price(&self) -> Decimal {
        self.bounds.read().expect("bounds lock poisoned").lower
    }

    pub fn upper_price(&self) -> Decimal {
        self.bounds.read().expect("bounds lock poisoned").upper
    }

    pub fn is_long_family(&self) -> bool {
        matches!(
            self.grid_type,
            GridType::Long | GridType::MartingaleLong | GridType::FollowLong
        )
    }

    pub fn is_short_family(&self) -> bool {
        !self.is_long_family()
    }

    pub fn is_follow_mode(&self) -> bool {
        matches!(self.grid_type, GridType::FollowLong | GridType::FollowShort)
    }

    pub fn is_spot(&self) -> bool {
        self.market_type == MarketType::Spot
    }

    /// Per-grid sizes vary whenever an increment is configured, regardless
    /// of the named variant.
    pub fn is_martingale_mode(&self) -> bool {
        self.martingale_increment
            .map(|inc| inc > Decimal::ZERO)
            .unwrap_or(false)
    }

    /// Base currency of the pair, e.g. "X" for "X/USDC"
    pub fn base_currency(&self) -> &str {
        let sep = if self.symbol.contains('/') { '/' } else { '_' };
        self.symbol.split(sep).next().unwrap_or(&self.symbol)
    }

    /// Quote currency of the pair, e.g. "USDC" for "X/USDC"
    pub fn quote_currency(&self) -> &str {
        let sep = if self.symbol.contains('/') { '/' } else { '_' };
        self.symbol.split(sep).nth(1).unwrap_or("USDC")
    }

    /// Price of a grid index (1-based).
    ///
    /// Long variants ascend from the lower bound, short variants descend
    /// from the upper bound. Indexes beyond `grid_count` extrapolate along
    /// the ladder; reverse orders posted past the top live there.
    pub fn price_of(&self, grid_id: u32) -> Decimal {
        let steps = Decimal::from(grid_id.saturating_sub(1));
        if self.is_long_family() {
            self.lower_price() + steps * self.grid_interval
        } else {
            self.upper_price() - steps * self.grid_interval
        }
    }

    /// Grid index of a price, clamped to `[1, grid_count]`.
    ///
    /// Rounds rather than truncates so a price that lands a hair under a
    /// level boundary still maps to that level.
    pub fn index_of(&self, price: Decimal) -> u32 {
        let raw = self.raw_index_of(price);
        raw.clamp(1, self.grid_count as i64) as u32
    }

    /// Unclamped grid index. Used when reconstructing the occupied range
    /// from live orders, where out-of-ladder indexes are meaningful.
    pub fn raw_index_of(&self, price: Decimal) -> i64 {
        let offset = if self.is_long_family() {
            (price - self.lower_price()) / self.grid_interval
        } else {
            (self.upper_price() - price) / self.grid_interval
        };
        offset.round().to_i64().unwrap_or(0) + 1
    }

    pub fn is_in_range(&self, price: Decimal) -> bool {
        price >= self.lower_price() && price <= self.upper_price()
    }

    /// Theoretical order size at a grid (before precision rounding).
    ///
    /// Martingale sizing grows toward the adverse extreme: Grid 1 carries
    /// the largest size for long grids and the smallest for short grids.
    pub fn order_amount_of(&self, grid_id: u32) -> Decimal {
        match self.martingale_increment {
            Some(inc) if inc > Decimal::ZERO => {
                if self.is_long_family() {
                    let steps = Decimal::from(self.grid_count.saturating_sub(grid_id));
                    self.order_amount + steps * inc
                } else {
                    let steps = Decimal::from(grid_id.saturating_sub(1));
                    self.order_amount + steps * inc
                }
            }
            _ => self.order_amount,
        }
    }

    /// Order size at a grid rounded to the venue's quantity precision.
    /// This is the size actually submitted; venues round per order, so any
    /// aggregate over grids must sum these, not the raw values.
    pub fn order_amount_of_rounded(&self, grid_id: u32) -> Decimal {
        self.round_amount(self.order_amount_of(grid_id))
    }

    /// Half-up rounding to `quantity_precision`, matching venue behavior
    pub fn round_amount(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(
            self.quantity_precision,
            RoundingStrategy::MidpointAwayFromZero,
        )
    }

    /// Grid index at which scalping arms.
    ///
    /// Identical for long and short grids because Grid 1 is always the
    /// adverse extreme: progress of N% toward it puts the current index at
    /// or below `grid_count - floor(grid_count * N / 100)`.
    pub fn scalping_trigger_grid(&self) -> u32 {
        self.trigger_grid(self.scalping_trigger_percent)
    }

    /// Grid index at which capital protection arms
    pub fn capital_protection_trigger_grid(&self) -> u32 {
        self.trigger_grid(self.capital_protection_trigger_percent)
    }

    fn trigger_grid(&self, percent: u32) -> u32 {
        let offset = (self.grid_count as u64 * percent as u64 / 100) as u32;
        self.grid_count.saturating_sub(offset).max(1)
    }

    /// Follow-mode escape check. Only the profit direction triggers; an
    /// adverse-direction escape never resets the corridor.
    pub fn check_price_escape(&self, price: Decimal) -> Option<EscapeDirection> {
        if !self.is_follow_mode() {
            return None;
        }
        let threshold = self.grid_interval * Decimal::from(self.follow_distance);
        match self.grid_type {
            GridType::FollowLong if price > self.upper_price() + threshold => {
                Some(EscapeDirection::Up)
            }
            GridType::FollowShort if price < self.lower_price() - threshold => {
                Some(EscapeDirection::Down)
            }
            _ => None,
        }
    }

    /// Recompute the corridor for a follow grid from the live price.
    ///
    /// Long grids anchor the upper bound at the current price (or at the
    /// price-lock threshold when configured and already crossed), pushed
    /// out by `price_offset_grids`; the lower bound sits `grid_count`
    /// intervals below. Short grids mirror.
    pub fn update_price_range_for_follow_mode(&self, current_price: Decimal) {
        if !self.is_follow_mode() {
            return;
        }

        let span = Decimal::from(self.grid_count) * self.grid_interval;
        let offset = self.grid_interval * Decimal::from(self.price_offset_grids);
        let mut bounds = self.bounds.write().expect("bounds lock poisoned");

        match self.grid_type {
            GridType::FollowLong => {
                let base = match self.price_lock_threshold {
                    Some(threshold)
                        if self.price_lock_enabled
                            && self.price_lock_start_at_threshold
                            && current_price > threshold =>
                    {
                        threshold
                    }
                    _ => current_price,
                };
                bounds.upper = base + offset;
                bounds.lower = bounds.upper - span;
            }
            GridType::FollowShort => {
                let base = match self.price_lock_threshold {
                    Some(threshold)
                        if self.price_lock_enabled
                            && self.price_lock_start_at_threshold
                            && current_price < threshold =>
                    {
                        threshold
                    }
                    _ => current_price,
                };
                bounds.lower = base - offset;
                bounds.upper = bounds.lower + span;
            }
            _ => unreachable!(),
        }
    }

    /// Position reconciliation tolerance in base units
    pub fn position_tolerance_amount(&self) -> Decimal {
        let fraction = self.position_tolerance.unwrap_or(Decimal::new(1, 2));
        self.order_amount * fraction
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rust_decimal_macros::dec;

    /// The common scenario setup: Long grid, X/USDC, [100, 110], 100 grids
    pub(crate) fn settings_long() -> GridSettings {
        GridSettings {
            exchange: "paper".into(),
            symbol: "X/USDC".into(),
            grid_type: GridType::Long,
            market_type: MarketType::Perp,
            grid_interval: dec!(0.10),
            order_amount: dec!(1.000),
            lower_price: Some(dec!(100.00)),
            upper_price: Some(dec!(110.00)),
            max_position: None,
            fee_rate: dec!(0.0001),
            quantity_precision: 3,
            martingale_increment: None,
            follow_grid_count: None,
            follow_timeout: 300,
            follow_distance: 1,
            price_offset_grids: 0,
            scalping_enabled: false,
            scalping_trigger_percent: 80,
            scalping_take_profit_grids: 2,
            capital_protection_enabled: false,
            capital_protection_trigger_percent: 50,
            take_profit_enabled: false,
            take_profit_percentage: dec!(0.01),
            price_lock_enabled: false,
            price_lock_threshold: None,
            price_lock_start_at_threshold: false,
            reverse_order_grid_distance: 1,
            order_health_check_interval: 300,
            spot_reserve: None,
            position_tolerance: None,
        }
    }

    pub(crate) fn config_long() -> GridConfig {
        GridConfig::from_settings(settings_long()).unwrap()
    }

    pub(crate) fn config_short() -> GridConfig {
        let mut settings = settings_long();
        settings.grid_type = GridType::Short;
        GridConfig::from_settings(settings).unwrap()
    }
}
