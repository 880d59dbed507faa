//! Layer 2: multi-timeframe EMA analysis of the underlying asset
//!
//! Each of the six timeframes produces an EMA signal in [-1, 1] and votes bullish
//! above +0.1 or bearish below −0.1. The weighted direction is vetoed when the
//! 15m or 1h timeframe votes against the majority.
//!
//! Also exposes the short-term pressure reading (1m/5m/15m) used by the exit engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::SignalConfig;
use crate::features;
use crate::types::{CandleSet, Side, Timeframe};

/// A timeframe signal beyond this magnitude casts a vote
const VOTE_THRESHOLD: f64 = 0.1;

/// Timeframes whose disagreement with the majority vetoes the layer
const ANCHOR_TIMEFRAMES: [Timeframe; 2] = [Timeframe::Min15, Timeframe::Hour1];

/// Layer 2 output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Layer2Signal {
    /// [-1, 1]; 0 when vetoed
    pub direction: f64,
    /// [0, 1]; 0 when vetoed
    pub confidence: f64,
    /// Timeframes voting with the majority
    pub alignment_count: usize,
    /// Timeframes with enough candles to compute
    pub total_timeframes: usize,
    pub timeframe_directions: BTreeMap<Timeframe, f64>,
    pub vetoed: bool,
}

/// Short-horizon momentum of the underlying, consumed by pressure scaling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PressureReading {
    /// [-1, 1], positive = bullish
    pub pressure: f64,
    /// Short timeframes voting with the dominant side
    pub alignment: usize,
}

impl PressureReading {
    /// Pressure oriented toward a position: positive means the market pushes with it
    pub fn aligned_with(&self, side: Side) -> f64 {
        self.pressure * side.sign()
    }
}

pub fn timeframe_weight(tf: Timeframe) -> f64 {
    match tf {
        Timeframe::Min1 => 0.10,
        Timeframe::Min5 => 0.15,
        Timeframe::Min15 => 0.35,
        Timeframe::Hour1 => 0.30,
        Timeframe::Hour4 => 0.05,
        Timeframe::Day1 => 0.05,
    }
}

pub fn ema_periods(config: &SignalConfig, tf: Timeframe) -> &[usize] {
    match tf {
        Timeframe::Min1 => &config.ema_1m,
        Timeframe::Min5 => &config.ema_5m,
        Timeframe::Min15 => &config.ema_15m,
        Timeframe::Hour1 => &config.ema_1h,
        Timeframe::Hour4 => &config.ema_4h,
        Timeframe::Day1 => &config.ema_1d,
    }
}

fn vote(signal: f64) -> i8 {
    if signal > VOTE_THRESHOLD {
        1
    } else if signal < -VOTE_THRESHOLD {
        -1
    } else {
        0
    }
}

pub fn compute_layer2(candles: &CandleSet, config: &SignalConfig) -> Layer2Signal {
    let mut timeframe_directions = BTreeMap::new();
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    let mut bullish = 0usize;
    let mut bearish = 0usize;

    for tf in Timeframe::ALL {
        let Some(series) = candles.get(&tf) else {
            continue;
        };
        let Some(signal) = features::ema_signal(series, ema_periods(config, tf)) else {
            tracing::debug!(timeframe = %tf, candles = series.len(), "Layer 2: skipping timeframe, not enough candles");
            continue;
        };

        timeframe_directions.insert(tf, signal);
        let weight = timeframe_weight(tf);
        weighted_sum += signal * weight;
        total_weight += weight;

        match vote(signal) {
            1 => bullish += 1,
            -1 => bearish += 1,
            _ => {}
        }
    }

    let total_timeframes = timeframe_directions.len();
    if total_weight == 0.0 {
        return Layer2Signal::default();
    }

    let direction = (weighted_sum / total_weight).clamp(-1.0, 1.0);
    let majority: i8 = match bullish.cmp(&bearish) {
        std::cmp::Ordering::Greater => 1,
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => vote(direction),
    };
    let alignment_count = bullish.max(bearish);

    let vetoed = majority != 0
        && ANCHOR_TIMEFRAMES.iter().any(|tf| {
            timeframe_directions
                .get(tf)
                .is_some_and(|signal| vote(*signal) == -majority)
        });

    if vetoed {
        tracing::info!(
            direction = direction,
            m15 = timeframe_directions.get(&Timeframe::Min15).copied().unwrap_or(0.0),
            h1 = timeframe_directions.get(&Timeframe::Hour1).copied().unwrap_or(0.0),
            "Layer 2 vetoed: 15m/1h fighting the majority"
        );
        return Layer2Signal {
            direction: 0.0,
            confidence: 0.0,
            alignment_count,
            total_timeframes,
            timeframe_directions,
            vetoed: true,
        };
    }

    let alignment_ratio = alignment_count as f64 / total_timeframes as f64;
    let base_confidence = if alignment_ratio >= 0.8 {
        0.80
    } else if alignment_ratio >= 0.67 {
        0.55
    } else if alignment_ratio >= 0.5 {
        0.30
    } else {
        0.10
    };
    let confidence = (base_confidence + (direction.abs() * 0.5).min(0.20)).clamp(0.0, 1.0);

    Layer2Signal {
        direction,
        confidence,
        alignment_count,
        total_timeframes,
        timeframe_directions,
        vetoed: false,
    }
}

/// Short-term pressure from the 1m/5m/15m EMA signals weighted .45/.35/.20
pub fn compute_pressure(candles: &CandleSet, config: &SignalConfig) -> PressureReading {
    const SHORT: [(Timeframe, f64); 3] = [
        (Timeframe::Min1, 0.45),
        (Timeframe::Min5, 0.35),
        (Timeframe::Min15, 0.20),
    ];

    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    let mut bullish = 0usize;
    let mut bearish = 0usize;

    for (tf, weight) in SHORT {
        let Some(signal) = candles
            .get(&tf)
            .and_then(|series| features::ema_signal(series, ema_periods(config, tf)))
        else {
            continue;
        };
        weighted_sum += signal * weight;
        total_weight += weight;
        match vote(signal) {
            1 => bullish += 1,
            -1 => bearish += 1,
            _ => {}
        }
    }

    if total_weight == 0.0 {
        return PressureReading::default();
    }

    PressureReading {
        pressure: (weighted_sum / total_weight).clamp(-1.0, 1.0),
        alignment: bullish.max(bearish),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::test_support::{make_candles, ramp};

    const END_MS: i64 = 1_700_000_000_000;

    fn trending(step: f64) -> Vec<crate::types::Candle> {
        make_candles(&ramp(100.0, step, 220), END_MS)
    }

    fn candle_set(bullish: &[Timeframe], bearish: &[Timeframe]) -> CandleSet {
        let mut set = CandleSet::new();
        for tf in bullish {
            set.insert(*tf, trending(0.2));
        }
        for tf in bearish {
            set.insert(*tf, trending(-0.2));
        }
        set
    }

    #[test]
    fn test_all_bullish_is_fully_aligned() {
        let config = SignalConfig::default();
        let signal = compute_layer2(&candle_set(&Timeframe::ALL, &[]), &config);

        assert_eq!(signal.total_timeframes, 6);
        assert_eq!(signal.alignment_count, 6);
        assert!(!signal.vetoed);
        assert!(signal.direction > 0.5);
        assert!(signal.confidence >= 0.8);
        assert!(signal.confidence <= 1.0);
    }

    #[test]
    fn test_anchor_timeframe_against_majority_vetoes() {
        let config = SignalConfig::default();
        let set = candle_set(
            &[Timeframe::Min1, Timeframe::Min5, Timeframe::Hour1, Timeframe::Hour4, Timeframe::Day1],
            &[Timeframe::Min15],
        );
        let signal = compute_layer2(&set, &config);

        assert!(signal.vetoed);
        assert_eq!(signal.direction, 0.0);
        assert_eq!(signal.confidence, 0.0);
        assert_eq!(signal.alignment_count, 5);
    }

    #[test]
    fn test_minor_timeframes_disagreeing_do_not_veto() {
        let config = SignalConfig::default();
        let set = candle_set(
            &[Timeframe::Min15, Timeframe::Hour1, Timeframe::Hour4, Timeframe::Day1],
            &[Timeframe::Min1, Timeframe::Min5],
        );
        let signal = compute_layer2(&set, &config);

        assert!(!signal.vetoed);
        assert!(signal.direction > 0.0);
        assert_eq!(signal.alignment_count, 4);
    }

    #[test]
    fn test_missing_candles_are_neutral() {
        let config = SignalConfig::default();
        let signal = compute_layer2(&CandleSet::new(), &config);
        assert_eq!(signal, Layer2Signal::default());

        let mut short = CandleSet::new();
        short.insert(Timeframe::Min15, make_candles(&[100.0; 20], END_MS));
        assert_eq!(compute_layer2(&short, &config).total_timeframes, 0);
    }

    #[test]
    fn test_pressure_follows_short_timeframes() {
        let config = SignalConfig::default();
        let up = compute_pressure(&candle_set(&[Timeframe::Min1, Timeframe::Min5, Timeframe::Min15], &[]), &config);
        let down = compute_pressure(&candle_set(&[], &[Timeframe::Min1, Timeframe::Min5, Timeframe::Min15]), &config);

        assert!(up.pressure > 0.5);
        assert!(down.pressure < -0.5);
        assert_eq!(up.alignment, 3);
        assert!(up.aligned_with(Side::Down) < 0.0);
        assert_eq!(compute_pressure(&CandleSet::new(), &config), PressureReading::default());
    }
}
