//! Layer 1: technical analysis on the UP token's own price series
//!
//! Three indicators each contribute a signed vote:
//! - RSI: oversold → +1, overbought → −1 (readings outside [5, 95] are ignored)
//! - MACD histogram: sign gives the vote, half weight when the histogram is shrinking
//! - Momentum: a move of at least `pm_momentum_threshold` over the lookback
//!
//! Direction is the mean vote; confidence is the share of indicators voting with it.

use serde::{Deserialize, Serialize};

use crate::config::SignalConfig;
use crate::features;
use crate::types::PricePoint;

/// RSI readings outside this band come from illiquid token books and are ignored
const RSI_VALID_RANGE: (f64, f64) = (5.0, 95.0);

/// Layer 1 output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Layer1Signal {
    /// [-1, 1]
    pub direction: f64,
    /// [0, 1]
    pub confidence: f64,
    pub rsi: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub momentum: Option<f64>,
}

/// Points needed before any indicator is trusted
pub fn required_history(config: &SignalConfig) -> usize {
    (config.pm_macd_slow + config.pm_macd_signal)
        .max(config.pm_rsi_period + 1)
        .max(config.pm_momentum_lookback + 1)
}

pub fn compute_layer1(history: &[PricePoint], config: &SignalConfig) -> Layer1Signal {
    let required = required_history(config);
    if history.len() < required {
        tracing::debug!(
            points = history.len(),
            required = required,
            "Layer 1: not enough token price history"
        );
        return Layer1Signal::default();
    }

    let prices: Vec<f64> = history.iter().map(|p| p.price).collect();

    let rsi = features::rsi_wilder(&prices, config.pm_rsi_period);
    let macd = features::macd(
        &prices,
        config.pm_macd_fast,
        config.pm_macd_slow,
        config.pm_macd_signal,
    );
    let momentum = features::momentum(&prices, config.pm_momentum_lookback);

    let rsi_vote = rsi.map_or(0.0, |value| rsi_vote(value, config));
    let macd_vote = macd.map_or(0.0, |m| {
        if m.histogram > 0.0 {
            if m.histogram >= m.prev_histogram {
                1.0
            } else {
                0.5
            }
        } else if m.histogram < 0.0 {
            if m.histogram <= m.prev_histogram {
                -1.0
            } else {
                -0.5
            }
        } else {
            0.0
        }
    });
    let momentum_vote = momentum.map_or(0.0, |change| {
        if change >= config.pm_momentum_threshold {
            1.0
        } else if change <= -config.pm_momentum_threshold {
            -1.0
        } else {
            0.0
        }
    });

    let votes = [rsi_vote, macd_vote, momentum_vote];
    let direction = (votes.iter().sum::<f64>() / votes.len() as f64).clamp(-1.0, 1.0);
    let confidence = if direction == 0.0 {
        0.0
    } else {
        let agreeing = votes
            .iter()
            .filter(|v| **v != 0.0 && v.signum() == direction.signum())
            .count();
        agreeing as f64 / votes.len() as f64
    };

    Layer1Signal {
        direction,
        confidence,
        rsi,
        macd_histogram: macd.map(|m| m.histogram),
        momentum,
    }
}

fn rsi_vote(rsi: f64, config: &SignalConfig) -> f64 {
    if rsi < RSI_VALID_RANGE.0 || rsi > RSI_VALID_RANGE.1 {
        return 0.0;
    }
    if rsi < config.pm_rsi_oversold {
        1.0
    } else if rsi > config.pm_rsi_overbought {
        -1.0
    } else {
        0.0
    }
}
