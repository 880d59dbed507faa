//! Exit Engine - Per-position exit state machine
//!
//! A position moves through SURVIVAL → NORMAL → TIGHTENED → FINAL and never goes back.
//! Each tick the engine marks the position to market, derives the effective trailing
//! stop and take-profit, then checks triggers in priority order:
//! 1. survival_hard_stop (SURVIVAL only)
//! 2. hard_stop
//! 3. hard_take_profit
//! 4. trailing_stop
//! 5. signal_reversal
//! 6. market_close
//!
//! The engine only decides. Placing the exit order is the caller's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ExitConfig;
use crate::strategy::EvidenceCategory;
use crate::types::{BotId, Side};

/// Tolerance for inclusive threshold comparisons
const EPSILON: f64 = 1e-9;

/// Exit phase of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitState {
    Survival,
    Normal,
    Tightened,
    Final,
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Survival => write!(f, "SURVIVAL"),
            ExitState::Normal => write!(f, "NORMAL"),
            ExitState::Tightened => write!(f, "TIGHTENED"),
            ExitState::Final => write!(f, "FINAL"),
        }
    }
}

/// Entry conviction bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvictionTier {
    High,
    Normal,
    Low,
}

impl fmt::Display for ConvictionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvictionTier::High => write!(f, "high"),
            ConvictionTier::Normal => write!(f, "normal"),
            ConvictionTier::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    SurvivalHardStop,
    HardStop,
    HardTakeProfit,
    TrailingStop,
    SignalReversal,
    MarketClose,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::SurvivalHardStop => "survival_hard_stop",
            ExitReason::HardStop => "hard_stop",
            ExitReason::HardTakeProfit => "hard_take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::SignalReversal => "signal_reversal",
            ExitReason::MarketClose => "market_close",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open position tracked by the exit engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub bot_id: BotId,
    pub side: Side,
    pub token_id: String,
    pub condition_id: String,
    pub entry_price: f64,
    /// USDC cost
    pub size: f64,
    pub shares: f64,
    pub entry_time: DateTime<Utc>,
    /// Close of the market window the position belongs to
    pub window_close: DateTime<Utc>,
    pub peak_price: f64,
    pub trough_price: f64,
    pub current_price: f64,
    /// Composite confidence at entry
    pub entry_conviction: f64,
    pub exit_state: ExitState,
    /// Shares already sold by partially filled exits
    #[serde(default)]
    pub sold_shares: f64,
    /// PnL booked on `sold_shares`
    #[serde(default)]
    pub realized_pnl: f64,
    pub l1_evidence: EvidenceCategory,
    pub l2_evidence: EvidenceCategory,
    pub dry_run: bool,
}

impl Position {
    /// Everything the position needs at fill time
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        bot_id: BotId,
        side: Side,
        token_id: impl Into<String>,
        condition_id: impl Into<String>,
        entry_price: f64,
        size: f64,
        entry_time: DateTime<Utc>,
        window_close: DateTime<Utc>,
        entry_conviction: f64,
        evidence: (EvidenceCategory, EvidenceCategory),
        dry_run: bool,
    ) -> Self {
        let shares = if entry_price > 0.0 { size / entry_price } else { 0.0 };
        Self {
            bot_id,
            side,
            token_id: token_id.into(),
            condition_id: condition_id.into(),
            entry_price,
            size,
            shares,
            entry_time,
            window_close,
            peak_price: entry_price,
            trough_price: entry_price,
            current_price: entry_price,
            entry_conviction,
            exit_state: ExitState::Survival,
            sold_shares: 0.0,
            realized_pnl: 0.0,
            l1_evidence: evidence.0,
            l2_evidence: evidence.1,
            dry_run,
        }
    }

    /// Mark to market; peak and trough only ever widen
    pub fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.peak_price = self.peak_price.max(price);
        self.trough_price = self.trough_price.min(price);
    }

    /// Fractional gain vs entry (negative when losing)
    pub fn gain_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (self.current_price - self.entry_price) / self.entry_price
    }

    /// Best gain seen so far
    pub fn peak_gain_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (self.peak_price - self.entry_price) / self.entry_price
    }

    /// Fractional retrace from the peak
    pub fn drawdown_from_peak(&self) -> f64 {
        if self.peak_price <= 0.0 {
            return 0.0;
        }
        (self.peak_price - self.current_price) / self.peak_price
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.shares * (self.current_price - self.entry_price)
    }

    /// Book a partial sale at `price`; the remaining shares stay open.
    /// Returns the PnL realized on the sold shares.
    pub fn reduce(&mut self, shares: f64, price: f64) -> f64 {
        let sold = shares.clamp(0.0, self.shares);
        let pnl = sold * (price - self.entry_price);
        self.shares -= sold;
        self.size = self.shares * self.entry_price;
        self.sold_shares += sold;
        self.realized_pnl += pnl;
        pnl
    }

    /// Shares bought at entry, sold or not
    pub fn total_shares(&self) -> f64 {
        self.shares + self.sold_shares
    }

    pub fn seconds_held(&self, now: DateTime<Utc>) -> f64 {
        (now - self.entry_time).num_milliseconds() as f64 / 1000.0
    }
}

/// Per-tick inputs that do not live on the position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitContext {
    pub now: DateTime<Utc>,
    pub current_price: f64,
    /// Short-term underlying pressure in [-1, 1], if known
    pub pressure: Option<f64>,
    /// Latest composite score, if a signal was computed
    pub composite_score: Option<f64>,
}

/// Trigger outcome with the parameters that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitDecision {
    pub reason: ExitReason,
    pub detail: String,
    pub state: ExitState,
    pub tier: ConvictionTier,
    pub price: f64,
    pub effective_trailing_pct: f64,
    pub pressure_multiplier: f64,
    pub decided_at: DateTime<Utc>,
}

/// Trailing and TP parameters in force for one tick
#[derive(Debug, Clone, Copy, PartialEq)]
struct ExitLevels {
    tier: ConvictionTier,
    take_profit_pct: f64,
    trailing_pct: f64,
    pressure_multiplier: f64,
}

#[derive(Debug, Clone)]
pub struct ExitEngine {
    config: ExitConfig,
}

impl ExitEngine {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    pub fn tier(&self, entry_conviction: f64) -> ConvictionTier {
        if entry_conviction > self.config.high_conviction_threshold {
            ConvictionTier::High
        } else if entry_conviction < self.config.low_conviction_threshold {
            ConvictionTier::Low
        } else {
            ConvictionTier::Normal
        }
    }

    /// State the clock alone would put the position in
    pub fn candidate_state(&self, position: &Position, now: DateTime<Utc>) -> ExitState {
        let to_close = (position.window_close - now).num_milliseconds() as f64 / 1000.0;
        if to_close <= self.config.final_seconds as f64 {
            ExitState::Final
        } else if to_close <= self.config.tighten_at_seconds as f64 {
            ExitState::Tightened
        } else if position.seconds_held(now) < self.config.survival_buffer_seconds as f64 {
            ExitState::Survival
        } else {
            ExitState::Normal
        }
    }

    /// Multiplier applied to the trailing stop from underlying pressure.
    ///
    /// Pressure with the position widens the stop up to `pressure_widen_max`, pressure
    /// against it tightens down to `pressure_tighten_min`, linearly outside the neutral zone.
    pub fn pressure_multiplier(&self, side: Side, pressure: Option<f64>) -> f64 {
        let Some(pressure) = pressure.filter(|_| self.config.pressure_scaling_enabled) else {
            return 1.0;
        };
        let aligned = (pressure * side.sign()).clamp(-1.0, 1.0);
        let neutral = self.config.pressure_neutral_zone;
        if aligned.abs() < neutral || neutral >= 1.0 {
            return 1.0;
        }

        let t = ((aligned.abs() - neutral) / (1.0 - neutral)).min(1.0);
        if aligned > 0.0 {
            1.0 + t * (self.config.pressure_widen_max - 1.0)
        } else {
            1.0 - t * (1.0 - self.config.pressure_tighten_min)
        }
    }

    fn levels(&self, position: &Position, pressure: Option<f64>) -> ExitLevels {
        let tier = self.tier(position.entry_conviction);
        let take_profit_pct = match tier {
            ConvictionTier::High => self.config.high_conviction_tp_pct,
            _ => self.config.hard_tp_pct,
        };

        let base = match position.exit_state {
            ExitState::Survival | ExitState::Normal => self.config.trailing_stop_pct,
            ExitState::Tightened => self.config.tightened_trailing_pct,
            ExitState::Final => self.config.final_trailing_pct,
        };
        let pressure_multiplier = self.pressure_multiplier(position.side, pressure);
        let mut trailing_pct = base * pressure_multiplier;

        if self.config.scaling_tp_enabled && take_profit_pct > 0.0 {
            let progress = position.peak_gain_pct() / take_profit_pct;
            let start = self.config.scaling_tp_pct;
            if progress >= start && start < 1.0 {
                let t = ((progress - start) / (1.0 - start)).clamp(0.0, 1.0);
                let floor = self.config.scaling_tp_min_trail.min(trailing_pct);
                trailing_pct -= t * (trailing_pct - floor);
            }
        }

        if tier == ConvictionTier::Low {
            trailing_pct = trailing_pct.min(self.config.low_conviction_trail_pct);
        }

        ExitLevels {
            tier,
            take_profit_pct,
            trailing_pct,
            pressure_multiplier,
        }
    }

    /// Settle a position whose window was rotated out from under it
    pub fn force_close(&self, position: &Position, now: DateTime<Utc>, detail: impl Into<String>) -> ExitDecision {
        let levels = self.levels(position, None);
        ExitDecision {
            reason: ExitReason::MarketClose,
            detail: detail.into(),
            state: position.exit_state,
            tier: levels.tier,
            price: position.current_price,
            effective_trailing_pct: levels.trailing_pct,
            pressure_multiplier: levels.pressure_multiplier,
            decided_at: now,
        }
    }

    /// Advance the position one tick and return the first trigger that fires
    pub fn evaluate(&self, position: &mut Position, ctx: &ExitContext) -> Option<ExitDecision> {
        position.mark(ctx.current_price);

        let candidate = self.candidate_state(position, ctx.now);
        if candidate > position.exit_state {
            tracing::debug!(
                bot_id = position.bot_id,
                condition_id = %position.condition_id,
                from = %position.exit_state,
                to = %candidate,
                "Exit state advanced"
            );
            position.exit_state = candidate;
        }

        let levels = self.levels(position, ctx.pressure);
        let decide = |reason: ExitReason, detail: String| ExitDecision {
            reason,
            detail,
            state: position.exit_state,
            tier: levels.tier,
            price: position.current_price,
            effective_trailing_pct: levels.trailing_pct,
            pressure_multiplier: levels.pressure_multiplier,
            decided_at: ctx.now,
        };

        let to_close = (position.window_close - ctx.now).num_milliseconds() as f64 / 1000.0;
        if to_close <= 0.0 {
            return Some(decide(
                ExitReason::MarketClose,
                format!("window closed at {}", position.window_close.format("%H:%M:%S")),
            ));
        }

        if !self.config.enabled || position.seconds_held(ctx.now) < self.config.min_hold_seconds as f64 {
            return None;
        }

        let gain = position.gain_pct();
        let drop = -gain;

        if position.exit_state == ExitState::Survival {
            let limit = self.config.survival_hard_stop_bps / 10_000.0;
            if drop >= limit - EPSILON {
                return Some(decide(
                    ExitReason::SurvivalHardStop,
                    format!("drop {:.1}bps >= {:.1}bps", drop * 10_000.0, self.config.survival_hard_stop_bps),
                ));
            }
        }

        if drop >= self.config.hard_stop_pct - EPSILON {
            return Some(decide(
                ExitReason::HardStop,
                format!("drop {:.1}% >= {:.1}%", drop * 100.0, self.config.hard_stop_pct * 100.0),
            ));
        }

        if self.config.hard_tp_enabled && gain >= levels.take_profit_pct - EPSILON {
            return Some(decide(
                ExitReason::HardTakeProfit,
                format!(
                    "{} conviction TP: gain {:.1}% >= {:.1}%",
                    levels.tier,
                    gain * 100.0,
                    levels.take_profit_pct * 100.0
                ),
            ));
        }

        let trailing_armed = match position.exit_state {
            ExitState::Survival => false,
            ExitState::Normal => position.current_price > position.entry_price,
            ExitState::Tightened | ExitState::Final => true,
        };
        let drawdown = position.drawdown_from_peak();
        if trailing_armed && drawdown >= levels.trailing_pct - EPSILON {
            return Some(decide(
                ExitReason::TrailingStop,
                format!(
                    "{} retrace {:.2}% from peak {:.4} >= {:.2}%",
                    position.exit_state,
                    drawdown * 100.0,
                    position.peak_price,
                    levels.trailing_pct * 100.0
                ),
            ));
        }

        if let Some(score) = ctx.composite_score {
            let against = -score * position.side.sign();
            if against > self.config.signal_reversal_threshold {
                return Some(decide(
                    ExitReason::SignalReversal,
                    format!("composite {:+.3} against {}", score, position.side),
                ));
            }
        }

        None
    }
}
