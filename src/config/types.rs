//! Per-bot configuration profile
//!
//! Every section deserializes with `#[serde(default)]` so persisted profiles and
//! partial updates only need the keys they change.

use serde::{Deserialize, Serialize};

use crate::clob::types::OrderStyle;
use crate::types::TradingMode;

/// Full per-bot configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BotConfig {
    pub mode: TradingMode,
    pub signal: SignalConfig,
    pub risk: RiskConfig,
    pub exit: ExitConfig,
    pub trading: TradingConfig,
    pub bayesian: BayesianConfig,
}

/// Technical signal layers and combiner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// RSI period on the token price series
    pub pm_rsi_period: usize,
    /// RSI below this is oversold (bullish contribution)
    pub pm_rsi_oversold: f64,
    /// RSI above this is overbought (bearish contribution)
    pub pm_rsi_overbought: f64,
    pub pm_macd_fast: usize,
    pub pm_macd_slow: usize,
    pub pm_macd_signal: usize,
    /// Momentum lookback in price points
    pub pm_momentum_lookback: usize,
    /// Minimum fractional move for a momentum contribution
    pub pm_momentum_threshold: f64,
    /// EMA periods per timeframe for the underlying-asset layer
    pub ema_1m: Vec<usize>,
    pub ema_5m: Vec<usize>,
    pub ema_15m: Vec<usize>,
    pub ema_1h: Vec<usize>,
    pub ema_4h: Vec<usize>,
    pub ema_1d: Vec<usize>,
    pub layer1_weight: f64,
    pub layer2_weight: f64,
    /// |composite_score| must exceed this to trade
    pub buy_threshold: f64,
    pub vwap_enabled: bool,
    pub vwap_weight: f64,
    pub vwap_session_reset_hour_utc: u32,
    pub vroc_enabled: bool,
    pub vroc_lookback: usize,
    /// |VROC| below this (percent) marks a low-volume move
    pub vroc_threshold: f64,
    /// Confidence multiplier applied on low-volume moves
    pub vroc_confidence_penalty: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            pm_rsi_period: 14,
            pm_rsi_oversold: 30.0,
            pm_rsi_overbought: 70.0,
            pm_macd_fast: 12,
            pm_macd_slow: 26,
            pm_macd_signal: 9,
            pm_momentum_lookback: 5,
            pm_momentum_threshold: 0.01, // 1% move
            ema_1m: vec![5, 13],
            ema_5m: vec![8, 21],
            ema_15m: vec![9, 21, 55],
            ema_1h: vec![12, 26],
            ema_4h: vec![20, 50],
            ema_1d: vec![20, 50, 200],
            layer1_weight: 0.4,
            layer2_weight: 0.6,
            buy_threshold: 0.08,
            vwap_enabled: false,
            vwap_weight: 0.15,
            vwap_session_reset_hour_utc: 0,
            vroc_enabled: false,
            vroc_lookback: 10,
            vroc_threshold: 50.0,
            vroc_confidence_penalty: 0.5,
        }
    }
}

/// Entry gating and sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fixed position size per entry (USDC)
    pub max_position_size: f64,
    pub max_trades_per_window: u32,
    /// Maximum daily loss (USDC)
    pub max_daily_loss: f64,
    pub min_signal_confidence: f64,
    pub max_consecutive_losses: u32,
    pub cooldown_minutes: i64,
    /// No new entries this close to window end
    pub stop_trading_minutes_before_close: i64,
    /// Never buy a token priced above this
    pub max_entry_price: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: 3.0,
            max_trades_per_window: 3,
            max_daily_loss: 15.0,
            min_signal_confidence: 0.35,
            max_consecutive_losses: 3,
            cooldown_minutes: 30,
            stop_trading_minutes_before_close: 5,
            max_entry_price: 0.80,
        }
    }
}

/// Exit engine thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Master switch; market_close still fires when off
    pub enabled: bool,
    pub min_hold_seconds: i64,
    pub survival_buffer_seconds: i64,
    pub survival_hard_stop_bps: f64,
    pub hard_stop_pct: f64,
    pub trailing_stop_pct: f64,
    pub tighten_at_seconds: i64,
    pub tightened_trailing_pct: f64,
    pub final_seconds: i64,
    pub final_trailing_pct: f64,
    pub signal_reversal_threshold: f64,
    pub hard_tp_enabled: bool,
    pub hard_tp_pct: f64,
    pub high_conviction_threshold: f64,
    pub high_conviction_tp_pct: f64,
    pub low_conviction_threshold: f64,
    pub low_conviction_trail_pct: f64,
    pub pressure_scaling_enabled: bool,
    pub pressure_widen_max: f64,
    pub pressure_tighten_min: f64,
    pub pressure_neutral_zone: f64,
    /// Tighten trailing as the gain approaches the TP target
    pub scaling_tp_enabled: bool,
    /// Fraction of the TP target where scaling starts
    pub scaling_tp_pct: f64,
    /// Trailing floor reached at the TP target
    pub scaling_tp_min_trail: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_hold_seconds: 20,
            survival_buffer_seconds: 180,
            survival_hard_stop_bps: 15.0,
            hard_stop_pct: 0.50,
            trailing_stop_pct: 0.20,
            tighten_at_seconds: 180,
            tightened_trailing_pct: 0.10,
            final_seconds: 60,
            final_trailing_pct: 0.05,
            signal_reversal_threshold: 0.15,
            hard_tp_enabled: true,
            hard_tp_pct: 0.25,
            high_conviction_threshold: 0.45,
            high_conviction_tp_pct: 0.35,
            low_conviction_threshold: 0.25,
            low_conviction_trail_pct: 0.001, // 0.1%
            pressure_scaling_enabled: true,
            pressure_widen_max: 1.5,
            pressure_tighten_min: 0.4,
            pressure_neutral_zone: 0.15,
            scaling_tp_enabled: false,
            scaling_tp_pct: 0.5,
            scaling_tp_min_trail: 0.02,
        }
    }
}

/// Order placement and loop cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub order_style: OrderStyle,
    pub exit_order_style: OrderStyle,
    /// Price improvement added to entry limit prices
    pub price_offset: f64,
    pub aggressive_for_strong_signals: bool,
    pub strong_signal_threshold: f64,
    /// Slow loop cadence
    pub poll_interval_seconds: u64,
    /// Fast (exit) loop cadence
    pub fast_poll_ms: u64,
    pub order_poll_interval_ms: u64,
    pub max_order_retries: u32,
    pub max_consecutive_order_errors: u32,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            order_style: OrderStyle::Resting,
            exit_order_style: OrderStyle::ImmediateOrCancel,
            price_offset: 0.01,
            aggressive_for_strong_signals: true,
            strong_signal_threshold: 0.8,
            poll_interval_seconds: 10,
            fast_poll_ms: 1000,
            order_poll_interval_ms: 1000,
            max_order_retries: 30,
            max_consecutive_order_errors: 5,
        }
    }
}

/// Bayesian confidence gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BayesianConfig {
    pub enabled: bool,
    /// Recent outcomes used for the global prior
    pub rolling_window: usize,
    /// Bot trades required before the gate activates
    pub min_sample_size: u64,
    pub confidence_threshold: f64,
    /// Laplace smoothing alpha
    pub smoothing_alpha: f64,
    /// Pseudo-count pulling small pair samples toward the prior
    pub prior_strength: f64,
}

impl Default for BayesianConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rolling_window: 100,
            min_sample_size: 50,
            confidence_threshold: 0.4,
            smoothing_alpha: 0.1,
            prior_strength: 10.0,
        }
    }
}

impl BotConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), String> {
        let s = &self.signal;
        if s.pm_macd_fast >= s.pm_macd_slow {
            return Err("pm_macd_fast must be below pm_macd_slow".into());
        }
        if s.pm_rsi_oversold >= s.pm_rsi_overbought {
            return Err("pm_rsi_oversold must be below pm_rsi_overbought".into());
        }
        if s.layer1_weight < 0.0 || s.layer2_weight < 0.0 || s.vwap_weight < 0.0 {
            return Err("layer weights must be non-negative".into());
        }
        let r = &self.risk;
        if r.max_position_size <= 0.0 {
            return Err("max_position_size must be positive".into());
        }
        if !(0.0..=1.0).contains(&r.max_entry_price) {
            return Err("max_entry_price must be within [0, 1]".into());
        }
        let e = &self.exit;
        if e.final_seconds > e.tighten_at_seconds {
            return Err("final_seconds must not exceed tighten_at_seconds".into());
        }
        if e.pressure_tighten_min > 1.0 || e.pressure_widen_max < 1.0 {
            return Err("pressure bounds must straddle 1.0".into());
        }
        if e.low_conviction_threshold > e.high_conviction_threshold {
            return Err("low_conviction_threshold must not exceed high_conviction_threshold".into());
        }
        let t = &self.trading;
        if t.poll_interval_seconds == 0 || t.fast_poll_ms == 0 {
            return Err("loop intervals must be positive".into());
        }
        if t.max_consecutive_order_errors == 0 {
            return Err("max_consecutive_order_errors must be at least 1".into());
        }
        if self.bayesian.smoothing_alpha <= 0.0 {
            return Err("smoothing_alpha must be positive".into());
        }
        Ok(())
    }
}
