//! Core types used throughout polyswarm
//!
//! Defines sides, timeframes, candles, bot status and the archived trade record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::risk::exits::ExitReason;
use crate::strategy::calibrator::EvidenceCategory;

/// Bot identifier. All per-bot state is keyed by it.
pub type BotId = u64;

/// Outcome side of a binary up/down market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Up,
    Down,
}

impl Side {
    /// +1 for UP, -1 for DOWN. Used to orient signed scores toward the position.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Up => 1.0,
            Side::Down => -1.0,
        }
    }

    /// Side implied by a signed score; `None` for an exact zero.
    pub fn from_score(score: f64) -> Option<Self> {
        if score > 0.0 {
            Some(Side::Up)
        } else if score < 0.0 {
            Some(Side::Down)
        } else {
            None
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Up => write!(f, "UP"),
            Side::Down => write!(f, "DOWN"),
        }
    }
}

/// Candle timeframes consumed by the multi-timeframe layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::Min1,
        Timeframe::Min5,
        Timeframe::Min15,
        Timeframe::Hour1,
        Timeframe::Hour4,
        Timeframe::Day1,
    ];

    /// Get duration in seconds
    pub fn duration_secs(&self) -> u64 {
        match self {
            Timeframe::Min1 => 60,
            Timeframe::Min5 => 5 * 60,
            Timeframe::Min15 => 15 * 60,
            Timeframe::Hour1 => 60 * 60,
            Timeframe::Hour4 => 4 * 60 * 60,
            Timeframe::Day1 => 24 * 60 * 60,
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "1m" => Some(Timeframe::Min1),
            "5m" => Some(Timeframe::Min5),
            "15m" => Some(Timeframe::Min15),
            "1h" => Some(Timeframe::Hour1),
            "4h" => Some(Timeframe::Hour4),
            "1d" => Some(Timeframe::Day1),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Timeframe::Min1 => "1m",
            Timeframe::Min5 => "5m",
            Timeframe::Min15 => "15m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
        };
        write!(f, "{}", label)
    }
}

/// Candlestick data for the underlying asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time (Unix milliseconds)
    pub open_time: i64,
    /// Open price
    pub open: f64,
    /// High price
    pub high: f64,
    /// Low price
    pub low: f64,
    /// Close price
    pub close: f64,
    /// Volume in base currency
    pub volume: f64,
}

impl Candle {
    /// Typical price (H+L+C)/3, used by VWAP
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Candle series per timeframe, oldest first
pub type CandleSet = BTreeMap<Timeframe, Vec<Candle>>;

/// Point on a token's own price series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Unix milliseconds
    pub ts: i64,
    pub price: f64,
}

/// Trading mode of a bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    DryRun,
    Live,
}

impl TradingMode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, TradingMode::DryRun)
    }
}

/// Status surfaced to the delivery layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    #[default]
    Stopped,
    Running,
    DryRun,
    Cooldown,
    Error,
}

impl BotStatus {
    /// Whether a task should be driving this bot
    pub fn is_active(&self) -> bool {
        matches!(self, BotStatus::Running | BotStatus::DryRun | BotStatus::Cooldown)
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotStatus::Stopped => write!(f, "stopped"),
            BotStatus::Running => write!(f, "running"),
            BotStatus::DryRun => write!(f, "dry_run"),
            BotStatus::Cooldown => write!(f, "cooldown"),
            BotStatus::Error => write!(f, "error"),
        }
    }
}

/// Trade result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeResult {
    Win,
    Loss,
}

impl TradeResult {
    /// Breakeven counts as a win so consecutive-loss streaks only grow on real losses
    pub fn from_pnl(pnl: f64) -> Self {
        if pnl < 0.0 {
            TradeResult::Loss
        } else {
            TradeResult::Win
        }
    }
}

impl fmt::Display for TradeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeResult::Win => write!(f, "WIN"),
            TradeResult::Loss => write!(f, "LOSS"),
        }
    }
}

/// Archived trade, appended to the per-bot trade log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Trade ID
    pub id: String,
    pub bot_id: BotId,
    pub condition_id: String,
    pub token_id: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    /// USD cost of the entry
    pub size: f64,
    pub shares: f64,
    pub pnl: f64,
    pub result: TradeResult,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: ExitReason,
    pub exit_detail: String,
    /// composite_confidence at entry
    pub entry_conviction: f64,
    pub l1_evidence: EvidenceCategory,
    pub l2_evidence: EvidenceCategory,
    pub peak_price: f64,
    pub trough_price: f64,
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_from_score() {
        assert_eq!(Side::from_score(0.3), Some(Side::Up));
        assert_eq!(Side::from_score(-0.01), Some(Side::Down));
        assert_eq!(Side::from_score(0.0), None);
    }

    #[test]
    fn timeframe_labels_round_trip() {
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::parse(&tf.to_string()), Some(tf));
        }
        assert_eq!(Timeframe::parse("2h"), None);
    }

    #[test]
    fn breakeven_is_not_a_loss() {
        assert_eq!(TradeResult::from_pnl(0.0), TradeResult::Win);
        assert_eq!(TradeResult::from_pnl(-0.01), TradeResult::Loss);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&BotStatus::DryRun).unwrap();
        assert_eq!(json, "\"dry_run\"");
        assert!(BotStatus::Cooldown.is_active());
        assert!(!BotStatus::Error.is_active());
    }
}
