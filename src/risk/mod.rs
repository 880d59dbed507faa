//! Risk Manager - Entry gating, sizing and loss cooldowns
//!
//! Implements:
//! - Ordered entry checks, each failure with its own reason
//! - Fixed position sizing
//! - Daily loss limit with UTC calendar-day reset
//! - Consecutive-loss cooldown
//! - Per-window trade cap reset on window rotation
//!
//! State lives in an explicit `RiskState` owned by the bot and passed in.

pub mod exits;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RiskConfig;
use crate::types::BotId;

/// Per-bot risk counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub bot_id: BotId,
    pub daily_pnl: f64,
    pub consecutive_losses: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Filled entries in the current window
    pub trades_this_window: u32,
    /// Condition id of the window the counters refer to
    pub current_window: Option<String>,
    /// UTC day the daily counters belong to
    pub trading_day: NaiveDate,
    pub updated_at: DateTime<Utc>,
}

impl RiskState {
    pub fn new(bot_id: BotId, now: DateTime<Utc>) -> Self {
        Self {
            bot_id,
            daily_pnl: 0.0,
            consecutive_losses: 0,
            cooldown_until: None,
            trades_this_window: 0,
            current_window: None,
            trading_day: now.date_naive(),
            updated_at: now,
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// Why an entry was refused
#[derive(Debug, Clone, PartialEq)]
pub enum RiskBlock {
    Cooldown {
        until: DateTime<Utc>,
    },
    DailyLossLimit {
        daily_pnl: f64,
        limit: f64,
    },
    ConsecutiveLosses {
        count: u32,
        max: u32,
    },
    WindowTradeLimit {
        trades: u32,
        max: u32,
    },
    LowConfidence {
        confidence: f64,
        min: f64,
    },
    EntryPriceTooHigh {
        price: f64,
        max: f64,
    },
    TooCloseToClose {
        seconds_remaining: f64,
        min_seconds: f64,
    },
}

impl RiskBlock {
    /// Stable reason code
    pub fn code(&self) -> &'static str {
        match self {
            RiskBlock::Cooldown { .. } => "cooldown",
            RiskBlock::DailyLossLimit { .. } => "daily_loss_limit",
            RiskBlock::ConsecutiveLosses { .. } => "consecutive_losses",
            RiskBlock::WindowTradeLimit { .. } => "window_trade_limit",
            RiskBlock::LowConfidence { .. } => "low_confidence",
            RiskBlock::EntryPriceTooHigh { .. } => "entry_price_too_high",
            RiskBlock::TooCloseToClose { .. } => "too_close_to_close",
        }
    }
}

impl fmt::Display for RiskBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskBlock::Cooldown { until } => write!(f, "cooldown until {}", until.format("%H:%M:%S")),
            RiskBlock::DailyLossLimit { daily_pnl, limit } => {
                write!(f, "daily loss limit: pnl ${:.2} (max -${:.2})", daily_pnl, limit)
            }
            RiskBlock::ConsecutiveLosses { count, max } => {
                write!(f, "consecutive losses {} (max {})", count, max)
            }
            RiskBlock::WindowTradeLimit { trades, max } => {
                write!(f, "window trade limit {} (max {})", trades, max)
            }
            RiskBlock::LowConfidence { confidence, min } => {
                write!(f, "confidence {:.3} below {:.3}", confidence, min)
            }
            RiskBlock::EntryPriceTooHigh { price, max } => {
                write!(f, "entry price {:.3} above {:.3}", price, max)
            }
            RiskBlock::TooCloseToClose {
                seconds_remaining,
                min_seconds,
            } => write!(
                f,
                "{:.0}s to close, entries stop at {:.0}s",
                seconds_remaining, min_seconds
            ),
        }
    }
}

/// What the Risk Manager needs to know about a candidate entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryCandidate {
    pub composite_confidence: f64,
    pub entry_price: f64,
    pub seconds_to_close: f64,
}

/// Risk manager for entry gating and sizing
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Reset daily counters on a UTC day change and drop an expired cooldown.
    /// Returns true when the day rolled.
    pub fn refresh(&self, state: &mut RiskState, now: DateTime<Utc>) -> bool {
        if state.cooldown_until.is_some_and(|until| now >= until) {
            tracing::info!(bot_id = state.bot_id, "Cooldown expired");
            state.cooldown_until = None;
            state.updated_at = now;
        }

        let today = now.date_naive();
        if state.trading_day == today {
            return false;
        }

        tracing::info!(
            bot_id = state.bot_id,
            previous_day = %state.trading_day,
            daily_pnl = state.daily_pnl,
            "New trading day, resetting daily counters"
        );
        state.trading_day = today;
        state.daily_pnl = 0.0;
        state.consecutive_losses = 0;
        state.updated_at = now;
        true
    }

    /// Track the active window. Returns true on rotation, which resets the trade count.
    pub fn on_window(&self, state: &mut RiskState, condition_id: &str, now: DateTime<Utc>) -> bool {
        if state.current_window.as_deref() == Some(condition_id) {
            return false;
        }
        state.current_window = Some(condition_id.to_string());
        state.trades_this_window = 0;
        state.updated_at = now;
        true
    }

    /// Entry checks in fixed order. Ok carries the position size in USDC.
    pub fn evaluate_entry(
        &self,
        state: &RiskState,
        candidate: &EntryCandidate,
        now: DateTime<Utc>,
    ) -> Result<f64, RiskBlock> {
        if let Some(until) = state.cooldown_until.filter(|until| now < *until) {
            return Err(RiskBlock::Cooldown { until });
        }

        if state.daily_pnl <= -self.config.max_daily_loss {
            return Err(RiskBlock::DailyLossLimit {
                daily_pnl: state.daily_pnl,
                limit: self.config.max_daily_loss,
            });
        }

        if state.consecutive_losses >= self.config.max_consecutive_losses {
            return Err(RiskBlock::ConsecutiveLosses {
                count: state.consecutive_losses,
                max: self.config.max_consecutive_losses,
            });
        }

        if state.trades_this_window >= self.config.max_trades_per_window {
            return Err(RiskBlock::WindowTradeLimit {
                trades: state.trades_this_window,
                max: self.config.max_trades_per_window,
            });
        }

        if candidate.composite_confidence < self.config.min_signal_confidence {
            return Err(RiskBlock::LowConfidence {
                confidence: candidate.composite_confidence,
                min: self.config.min_signal_confidence,
            });
        }

        if candidate.entry_price > self.config.max_entry_price {
            return Err(RiskBlock::EntryPriceTooHigh {
                price: candidate.entry_price,
                max: self.config.max_entry_price,
            });
        }

        let min_seconds = (self.config.stop_trading_minutes_before_close * 60) as f64;
        if candidate.seconds_to_close <= min_seconds {
            return Err(RiskBlock::TooCloseToClose {
                seconds_remaining: candidate.seconds_to_close,
                min_seconds,
            });
        }

        Ok(self.config.max_position_size)
    }

    /// Count a filled entry against the window cap
    pub fn record_entry(&self, state: &mut RiskState, now: DateTime<Utc>) {
        state.trades_this_window += 1;
        state.updated_at = now;
    }

    /// Apply a resolved trade. Returns true if this resolution started a cooldown.
    ///
    /// Reaching the loss streak limit arms the cooldown and resets the streak. While a
    /// cooldown is running, further losses never move `cooldown_until`.
    pub fn record_resolution(&self, state: &mut RiskState, pnl: f64, now: DateTime<Utc>) -> bool {
        self.refresh(state, now);

        state.daily_pnl += pnl;
        if pnl < 0.0 {
            state.consecutive_losses += 1;
        } else {
            state.consecutive_losses = 0;
        }
        state.updated_at = now;

        if state.consecutive_losses < self.config.max_consecutive_losses {
            return false;
        }

        state.consecutive_losses = 0;
        if state.in_cooldown(now) {
            return false;
        }

        let until = now + Duration::minutes(self.config.cooldown_minutes);
        state.cooldown_until = Some(until);
        tracing::warn!(
            bot_id = state.bot_id,
            until = %until,
            max_consecutive_losses = self.config.max_consecutive_losses,
            "Loss streak limit reached, entering cooldown"
        );
        true
    }
}
