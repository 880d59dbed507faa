//! Feature Engine - Technical indicator math
//!
//! Pure functions over price/candle series (oldest first):
//! - EMA (seeded with the first value, multiplier 2/(p+1))
//! - RSI with Wilder's smoothing
//! - MACD line, signal line and histogram
//! - Multi-EMA directional signal per timeframe
//! - Session VWAP with volume-weighted bands
//! - Volume rate of change
//!
//! Every function returns `None` (or a neutral value) when history is too short.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Candle;

/// MACD components at the latest point plus the previous histogram
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdReading {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
    pub prev_histogram: f64,
}

/// Session VWAP reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VwapReading {
    pub vwap: f64,
    pub price: f64,
    pub std_dev: f64,
    /// (price - vwap) / std_dev
    pub band_position: f64,
    /// band_position / 2 clamped to [-1, 1]
    pub signal: f64,
}

/// Volume rate of change reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VrocReading {
    /// Percent change of the latest volume vs the prior average
    pub vroc: f64,
    pub current_volume: f64,
    pub avg_volume: f64,
}

/// Full EMA series for `values`. Empty when there are fewer than `period` values.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut ema = values[0];
    out.push(ema);

    for v in values.iter().skip(1) {
        ema = (v - ema) * multiplier + ema;
        out.push(ema);
    }

    out
}

/// Latest EMA value
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

/// RSI with Wilder's smoothing. Needs `period + 1` values.
///
/// Seeds average gain/loss with a simple mean over the first `period` changes,
/// then smooths through the remainder of the series.
pub fn rsi_wilder(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        tracing::debug!(
            count = values.len(),
            required = period + 1,
            "RSI: Not enough points"
        );
        return None;
    }

    let changes: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let p = period as f64;

    let mut avg_gain = changes[..period].iter().filter(|c| **c > 0.0).sum::<f64>() / p;
    let mut avg_loss = changes[..period]
        .iter()
        .filter(|c| **c < 0.0)
        .map(|c| c.abs())
        .sum::<f64>()
        / p;

    for change in &changes[period..] {
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
    }

    if avg_gain == 0.0 && avg_loss == 0.0 {
        return Some(50.0); // No movement = neutral
    }
    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// MACD (fast EMA - slow EMA) with a signal EMA over the MACD line.
///
/// Needs `slow + signal` values so the signal line has real history.
pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> Option<MacdReading> {
    if fast == 0 || fast >= slow || values.len() < slow + signal {
        return None;
    }

    let fast_series = ema_series(values, fast);
    let slow_series = ema_series(values, slow);

    // Skip the slow EMA warm-up before building the signal line
    let macd_line: Vec<f64> = fast_series
        .iter()
        .zip(slow_series.iter())
        .skip(slow - 1)
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = ema_series(&macd_line, signal);
    let n = signal_series.len();
    if n < 2 {
        return None;
    }

    let histogram = macd_line[n - 1] - signal_series[n - 1];
    let prev_histogram = macd_line[n - 2] - signal_series[n - 2];

    Some(MacdReading {
        macd: macd_line[n - 1],
        signal: signal_series[n - 1],
        histogram,
        prev_histogram,
    })
}

/// Fractional change over the last `lookback` steps
pub fn momentum(values: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || values.len() < lookback + 1 {
        return None;
    }
    let last = values[values.len() - 1];
    let base = values[values.len() - 1 - lookback];
    if base == 0.0 {
        return None;
    }
    Some((last - base) / base)
}

/// Directional signal in [-1, 1] from a set of EMAs on one timeframe.
///
/// Blend: price above EMAs 40%, short-over-long EMA ordering 35%,
/// 3-candle momentum (x50, clamped) 25%. `None` when the longest EMA lacks history.
pub fn ema_signal(candles: &[Candle], periods: &[usize]) -> Option<f64> {
    let longest = periods.iter().copied().max()?;
    if candles.len() < longest + 1 {
        return None;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let price = closes[closes.len() - 1];

    let mut sorted = periods.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let emas: Vec<f64> = sorted
        .iter()
        .map(|p| ema(&closes, *p))
        .collect::<Option<Vec<f64>>>()?;

    let above = emas.iter().filter(|e| price > **e).count() as f64;
    let position = above / emas.len() as f64 * 2.0 - 1.0;

    let mut ordering = 0.0;
    let mut pairs = 0usize;
    for i in 0..emas.len() {
        for j in (i + 1)..emas.len() {
            ordering += if emas[i] > emas[j] { 1.0 } else { -1.0 };
            pairs += 1;
        }
    }
    let ordering = if pairs > 0 { ordering / pairs as f64 } else { 0.0 };

    let momentum = if closes.len() >= 4 {
        let base = closes[closes.len() - 4];
        if base != 0.0 {
            ((price - base) / base * 50.0).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    } else {
        0.0
    };

    Some((0.40 * position + 0.35 * ordering + 0.25 * momentum).clamp(-1.0, 1.0))
}

/// Start of the VWAP session containing `at`
pub fn session_start(at: DateTime<Utc>, reset_hour_utc: u32) -> DateTime<Utc> {
    let hour = reset_hour_utc.min(23);
    let today = at
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(at);
    if today > at {
        today - Duration::days(1)
    } else {
        today
    }
}

/// Session VWAP from 1m candles. The session is anchored to the latest candle.
pub fn vwap(candles: &[Candle], reset_hour_utc: u32) -> Option<VwapReading> {
    let last = candles.last()?;
    let last_at = Utc.timestamp_millis_opt(last.open_time).single()?;
    let start_ms = session_start(last_at, reset_hour_utc).timestamp_millis();

    let session: Vec<&Candle> = candles.iter().filter(|c| c.open_time >= start_ms).collect();
    if session.len() < 5 {
        return None;
    }

    let cum_vol: f64 = session.iter().map(|c| c.volume).sum();
    if cum_vol <= 0.0 {
        return None;
    }

    let vwap = session
        .iter()
        .map(|c| c.typical_price() * c.volume)
        .sum::<f64>()
        / cum_vol;
    let variance = session
        .iter()
        .map(|c| (c.typical_price() - vwap).powi(2) * c.volume)
        .sum::<f64>()
        / cum_vol;
    let std_dev = variance.sqrt();

    let price = last.close;
    let band_position = if std_dev > 0.0 {
        (price - vwap) / std_dev
    } else {
        0.0
    };

    Some(VwapReading {
        vwap,
        price,
        std_dev,
        band_position,
        signal: (band_position / 2.0).clamp(-1.0, 1.0),
    })
}

/// Volume rate of change of the latest candle vs the previous `lookback` candles
pub fn vroc(candles: &[Candle], lookback: usize) -> Option<VrocReading> {
    if lookback == 0 || candles.len() < lookback + 1 {
        return None;
    }

    let current_volume = candles[candles.len() - 1].volume;
    let prior = &candles[candles.len() - 1 - lookback..candles.len() - 1];
    let avg_volume = prior.iter().map(|c| c.volume).sum::<f64>() / lookback as f64;

    let vroc = if avg_volume > 0.0 {
        (current_volume - avg_volume) / avg_volume * 100.0
    } else {
        0.0
    };

    Some(VrocReading {
        vroc,
        current_volume,
        avg_volume,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::Candle;

    /// Candles one minute apart ending at `end_ms`, closing on `closes`
    pub fn make_candles(closes: &[f64], end_ms: i64) -> Vec<Candle> {
        let n = closes.len() as i64;
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                open_time: end_ms - (n - 1 - i as i64) * 60_000,
                open: *close,
                high: close * 1.001,
                low: close * 0.999,
                close: *close,
                volume: 100.0,
            })
            .collect()
    }

    /// Linear ramp of `len` values from `start` by `step`
    pub fn ramp(start: f64, step: f64, len: usize) -> Vec<f64> {
        (0..len).map(|i| start + step * i as f64).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{make_candles, ramp};
    use super::*;

    #[test]
    fn test_ema_constant_series() {
        let values = vec![42.0; 30];
        assert!((ema(&values, 10).unwrap() - 42.0).abs() < 1e-12);
        assert!(ema(&values[..5], 10).is_none());
    }

    #[test]
    fn test_ema_tracks_trend() {
        let values = ramp(100.0, 1.0, 50);
        let fast = ema(&values, 5).unwrap();
        let slow = ema(&values, 20).unwrap();
        assert!(fast > slow);
        assert!(fast < 149.0);
    }

    #[test]
    fn test_rsi_requires_period_plus_one() {
        let values = ramp(0.5, 0.01, 14);
        assert!(rsi_wilder(&values, 14).is_none());
        assert!(rsi_wilder(&ramp(0.5, 0.01, 15), 14).is_some());
    }

    #[test]
    fn test_rsi_extremes() {
        assert_eq!(rsi_wilder(&ramp(0.3, 0.01, 30), 14), Some(100.0));
        let falling = rsi_wilder(&ramp(0.7, -0.01, 30), 14).unwrap();
        assert!(falling < 1.0);
        assert_eq!(rsi_wilder(&[0.5; 20], 14), Some(50.0));
    }

    #[test]
    fn test_rsi_mixed_series_in_range() {
        // Alternating -0.01 / +0.02 steps: gains run about twice the losses
        let mut values = vec![0.5];
        for i in 0..30 {
            let step = if i % 2 == 0 { -0.01 } else { 0.02 };
            values.push(values[i] + step);
        }
        let rsi = rsi_wilder(&values, 14).unwrap();
        assert!(rsi > 60.0 && rsi < 75.0, "rsi = {}", rsi);
    }

    #[test]
    fn test_macd_positive_on_uptrend() {
        let mut values = vec![0.5; 20];
        values.extend(ramp(0.5, 0.005, 30));
        let reading = macd(&values, 12, 26, 9).unwrap();
        assert!(reading.macd > 0.0);
        assert!(reading.histogram > 0.0 || reading.prev_histogram > 0.0);
    }

    #[test]
    fn test_macd_insufficient_history() {
        assert!(macd(&ramp(0.5, 0.01, 30), 12, 26, 9).is_none());
        assert!(macd(&ramp(0.5, 0.01, 35), 12, 26, 9).is_some());
    }

    #[test]
    fn test_momentum() {
        let values = vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.02];
        assert!((momentum(&values, 5).unwrap() - 0.02).abs() < 1e-12);
        assert!(momentum(&values, 6).is_none());
    }

    #[test]
    fn test_ema_signal_bullish_and_bearish() {
        let up = make_candles(&ramp(100.0, 0.5, 60), 3_600_000_000);
        let down = make_candles(&ramp(130.0, -0.5, 60), 3_600_000_000);
        let bull = ema_signal(&up, &[9, 21, 55]).unwrap();
        let bear = ema_signal(&down, &[9, 21, 55]).unwrap();
        assert!(bull > 0.7, "bull = {}", bull);
        assert!(bear < -0.7, "bear = {}", bear);
        assert!(ema_signal(&up[..50], &[9, 21, 55]).is_none());
    }

    #[test]
    fn test_session_start_rolls_back_before_reset_hour() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 2, 30, 0).unwrap();
        assert_eq!(
            session_start(at, 4),
            Utc.with_ymd_and_hms(2024, 3, 9, 4, 0, 0).unwrap()
        );
        assert_eq!(
            session_start(at, 0),
            Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_vwap_signal_sign() {
        let end = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap().timestamp_millis();
        let mut closes = vec![100.0; 20];
        closes.push(101.0);
        let reading = vwap(&make_candles(&closes, end), 0).unwrap();
        assert!(reading.price > reading.vwap);
        assert!(reading.signal > 0.0 && reading.signal <= 1.0);
    }

    #[test]
    fn test_vwap_needs_five_session_candles() {
        let end = Utc.with_ymd_and_hms(2024, 3, 10, 0, 3, 0).unwrap().timestamp_millis();
        // Only 4 candles since midnight
        assert!(vwap(&make_candles(&[100.0; 30], end), 0).is_none());
    }

    #[test]
    fn test_vroc() {
        let mut candles = make_candles(&[100.0; 11], 0);
        candles[10].volume = 150.0;
        let reading = vroc(&candles, 10).unwrap();
        assert!((reading.vroc - 50.0).abs() < 1e-9);
        assert!(vroc(&candles[..10], 10).is_none());
    }
}
