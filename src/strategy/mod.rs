//! Signal Engine
//!
//! Blends the technical layers into one bounded directional estimate:
//! - Layer 1 (`token_ta`): RSI / MACD / momentum on the UP token price
//! - Layer 2 (`timeframes`): EMA alignment of the underlying across six timeframes
//! - Optional VWAP term in the score and VROC filter on the confidence
//! - Bayesian gate (`calibrator`) applied on top of the blended signal
//!
//! The score is signed toward UP: positive favours buying UP, negative DOWN.

pub mod calibrator;
pub mod timeframes;
pub mod token_ta;

pub use calibrator::{
    BayesianGate, EvidenceCategory, FallbackReason, GateResult, LikelihoodRecord,
    LikelihoodTable,
};
pub use timeframes::{compute_layer2, compute_pressure, Layer2Signal, PressureReading};
pub use token_ta::{compute_layer1, Layer1Signal};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SignalConfig;
use crate::features::{self, VrocReading, VwapReading};
use crate::types::{CandleSet, PricePoint, Side, Timeframe};

/// Blended signal for one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeSignal {
    pub layer1: Layer1Signal,
    pub layer2: Layer2Signal,
    /// Present when computable, whether or not it is enabled
    pub vwap: Option<VwapReading>,
    pub vroc: Option<VrocReading>,
    /// VROC at or above its threshold (always true when VROC is disabled)
    pub vroc_confirmed: bool,
    /// [-1, 1]
    pub composite_score: f64,
    /// [0, 1]
    pub composite_confidence: f64,
    pub recommended_side: Option<Side>,
    pub should_trade: bool,
    pub l1_evidence: EvidenceCategory,
    pub l2_evidence: EvidenceCategory,
    /// Set once the Bayesian gate has run
    pub gate: Option<GateResult>,
    pub computed_at: DateTime<Utc>,
}

impl CompositeSignal {
    /// Record the gate outcome; a blocked gate vetoes the trade
    pub fn apply_gate(&mut self, gate: GateResult) {
        if !gate.allows_trade() {
            self.should_trade = false;
        }
        self.gate = Some(gate);
    }
}

/// Layer weights after renormalization and zero-confidence reallocation
#[derive(Debug, Clone, Copy, PartialEq)]
struct BlendWeights {
    layer1: f64,
    layer2: f64,
    vwap: f64,
}

/// Computes layers and blends them into a `CompositeSignal`
#[derive(Debug, Clone)]
pub struct SignalCombiner {
    config: SignalConfig,
    min_signal_confidence: f64,
}

impl SignalCombiner {
    pub fn new(config: SignalConfig, min_signal_confidence: f64) -> Self {
        Self {
            config,
            min_signal_confidence,
        }
    }

    /// Run every layer on fresh market data and blend
    pub fn compute(
        &self,
        token_history: &[PricePoint],
        candles: &CandleSet,
        now: DateTime<Utc>,
    ) -> CompositeSignal {
        let layer1 = compute_layer1(token_history, &self.config);
        let layer2 = compute_layer2(candles, &self.config);
        let vwap = candles
            .get(&Timeframe::Min1)
            .and_then(|c| features::vwap(c, self.config.vwap_session_reset_hour_utc));
        let vroc = candles
            .get(&Timeframe::Min15)
            .and_then(|c| features::vroc(c, self.config.vroc_lookback));

        let signal = self.combine(layer1, layer2, vwap, vroc, now);

        tracing::debug!(
            l1_direction = signal.layer1.direction,
            l1_confidence = signal.layer1.confidence,
            l2_direction = signal.layer2.direction,
            l2_confidence = signal.layer2.confidence,
            l2_alignment = signal.layer2.alignment_count,
            score = signal.composite_score,
            confidence = signal.composite_confidence,
            should_trade = signal.should_trade,
            "Composite signal"
        );
        signal
    }

    fn weights(&self, layer1: &Layer1Signal, layer2: &Layer2Signal, vwap_active: bool) -> BlendWeights {
        let mut w = BlendWeights {
            layer1: self.config.layer1_weight,
            layer2: self.config.layer2_weight,
            vwap: if vwap_active { self.config.vwap_weight } else { 0.0 },
        };

        let total = w.layer1 + w.layer2 + w.vwap;
        if total > 0.0 {
            w.layer1 /= total;
            w.layer2 /= total;
            w.vwap /= total;
        }

        // A silent layer hands its weight to the others pro rata
        if layer1.confidence == 0.0 {
            let freed = w.layer1;
            w.layer1 = 0.0;
            let rest = w.layer2 + w.vwap;
            if rest > 0.0 {
                w.layer2 += w.layer2 / rest * freed;
                w.vwap += w.vwap / rest * freed;
            } else {
                w.layer2 = 1.0;
            }
        } else if layer2.confidence == 0.0 {
            let freed = w.layer2;
            w.layer2 = 0.0;
            let rest = w.layer1 + w.vwap;
            if rest > 0.0 {
                w.layer1 += w.layer1 / rest * freed;
                w.vwap += w.vwap / rest * freed;
            } else {
                w.layer1 = 1.0;
            }
        }
        w
    }

    /// Blend precomputed layers
    pub fn combine(
        &self,
        layer1: Layer1Signal,
        layer2: Layer2Signal,
        vwap: Option<VwapReading>,
        vroc: Option<VrocReading>,
        now: DateTime<Utc>,
    ) -> CompositeSignal {
        let l1_evidence = EvidenceCategory::from_direction(layer1.direction);
        let l2_evidence = EvidenceCategory::from_direction(layer2.direction);
        let vwap_signal = vwap.map(|v| v.signal).filter(|_| self.config.vwap_enabled);
        let vroc_confirmed = !self.config.vroc_enabled
            || vroc.is_some_and(|v| v.vroc.abs() >= self.config.vroc_threshold);

        if layer1.confidence == 0.0 && layer2.confidence == 0.0 {
            return CompositeSignal {
                layer1,
                layer2,
                vwap,
                vroc,
                vroc_confirmed,
                composite_score: 0.0,
                composite_confidence: 0.0,
                recommended_side: None,
                should_trade: false,
                l1_evidence,
                l2_evidence,
                gate: None,
                computed_at: now,
            };
        }

        let w = self.weights(&layer1, &layer2, vwap_signal.is_some());
        let score = (w.layer1 * layer1.direction
            + w.layer2 * layer2.direction
            + w.vwap * vwap_signal.unwrap_or(0.0))
        .clamp(-1.0, 1.0);

        let core = w.layer1 + w.layer2;
        let mut confidence = if core > 0.0 {
            (w.layer1 * layer1.confidence + w.layer2 * layer2.confidence) / core
        } else {
            0.0
        };
        if !vroc_confirmed {
            confidence *= self.config.vroc_confidence_penalty;
        }
        let confidence = confidence.clamp(0.0, 1.0);

        let should_trade =
            score.abs() > self.config.buy_threshold && confidence >= self.min_signal_confidence;

        CompositeSignal {
            layer1,
            layer2,
            vwap,
            vroc,
            vroc_confirmed,
            composite_score: score,
            composite_confidence: confidence,
            recommended_side: Side::from_score(score),
            should_trade,
            l1_evidence,
            l2_evidence,
            gate: None,
            computed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combiner() -> SignalCombiner {
        SignalCombiner::new(SignalConfig::default(), 0.35)
    }

    fn make_layer1(direction: f64, confidence: f64) -> Layer1Signal {
        Layer1Signal {
            direction,
            confidence,
            ..Layer1Signal::default()
        }
    }

    fn make_layer2(direction: f64, confidence: f64) -> Layer2Signal {
        Layer2Signal {
            direction,
            confidence,
            alignment_count: 5,
            total_timeframes: 6,
            ..Layer2Signal::default()
        }
    }

    fn make_vwap(signal: f64) -> VwapReading {
        VwapReading {
            vwap: 100.0,
            price: 101.0,
            std_dev: 0.5,
            band_position: signal * 2.0,
            signal,
        }
    }

    #[test]
    fn test_weighted_blend() {
        let signal = combiner().combine(make_layer1(0.5, 0.6), make_layer2(0.3, 0.8), None, None, Utc::now());
        assert!((signal.composite_score - (0.4 * 0.5 + 0.6 * 0.3)).abs() < 1e-12);
        assert!((signal.composite_confidence - (0.4 * 0.6 + 0.6 * 0.8)).abs() < 1e-12);
        assert_eq!(signal.recommended_side, Some(Side::Up));
        assert!(signal.should_trade);
        assert_eq!(signal.l1_evidence, EvidenceCategory::BullishStrong);
        assert_eq!(signal.l2_evidence, EvidenceCategory::BullishWeak);
    }

    #[test]
    fn test_silent_layer_hands_over_weight() {
        let signal = combiner().combine(make_layer1(0.0, 0.0), make_layer2(-0.4, 0.7), None, None, Utc::now());
        assert!((signal.composite_score + 0.4).abs() < 1e-12);
        assert!((signal.composite_confidence - 0.7).abs() < 1e-12);
        assert_eq!(signal.recommended_side, Some(Side::Down));
    }

    #[test]
    fn test_both_layers_silent_is_flat() {
        let signal = combiner().combine(Layer1Signal::default(), Layer2Signal::default(), None, None, Utc::now());
        assert_eq!(signal.composite_score, 0.0);
        assert_eq!(signal.composite_confidence, 0.0);
        assert_eq!(signal.recommended_side, None);
        assert!(!signal.should_trade);
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut config = SignalConfig::default();
        config.layer1_weight = 1.0;
        config.layer2_weight = 0.0;
        let combiner = SignalCombiner::new(config, 0.35);

        let at = combiner.combine(make_layer1(0.08, 0.9), make_layer2(0.0, 0.0), None, None, Utc::now());
        assert!(!at.should_trade);
        let above = combiner.combine(make_layer1(0.09, 0.9), make_layer2(0.0, 0.0), None, None, Utc::now());
        assert!(above.should_trade);
    }

    #[test]
    fn test_low_confidence_does_not_trade() {
        let signal = combiner().combine(make_layer1(0.9, 0.2), make_layer2(0.9, 0.3), None, None, Utc::now());
        assert!(signal.composite_score > 0.08);
        assert!(!signal.should_trade);
    }

    #[test]
    fn test_vwap_only_counts_when_enabled() {
        let l1 = make_layer1(0.2, 0.6);
        let l2 = make_layer2(0.2, 0.6);
        let off = combiner().combine(l1, l2.clone(), Some(make_vwap(-1.0)), None, Utc::now());
        assert!((off.composite_score - 0.2).abs() < 1e-12);

        let mut config = SignalConfig::default();
        config.vwap_enabled = true;
        let on = SignalCombiner::new(config, 0.35).combine(l1, l2, Some(make_vwap(-1.0)), None, Utc::now());
        let expected = (0.4 * 0.2 + 0.6 * 0.2 - 0.15) / 1.15;
        assert!((on.composite_score - expected).abs() < 1e-12);
        // Confidence only averages the core layers
        assert!((on.composite_confidence - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_vroc_penalty() {
        let mut config = SignalConfig::default();
        config.vroc_enabled = true;
        let combiner = SignalCombiner::new(config, 0.35);
        let quiet = VrocReading {
            vroc: 10.0,
            current_volume: 110.0,
            avg_volume: 100.0,
        };
        let signal = combiner.combine(make_layer1(0.5, 0.8), make_layer2(0.5, 0.8), None, Some(quiet), Utc::now());
        assert!(!signal.vroc_confirmed);
        assert!((signal.composite_confidence - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_blocked_gate_vetoes_trade() {
        let mut signal = combiner().combine(make_layer1(0.5, 0.6), make_layer2(0.5, 0.8), None, None, Utc::now());
        assert!(signal.should_trade);
        signal.apply_gate(GateResult::Blocked {
            posterior: 0.3,
            prior: 0.5,
        });
        assert!(!signal.should_trade);

        let mut fallback = combiner().combine(make_layer1(0.5, 0.6), make_layer2(0.5, 0.8), None, None, Utc::now());
        fallback.apply_gate(GateResult::Fallback {
            reason: FallbackReason::UnseenEvidence,
        });
        assert!(fallback.should_trade);
    }

    #[test]
    fn test_score_and_confidence_always_bounded() {
        let mut config = SignalConfig::default();
        config.vwap_enabled = true;
        config.vwap_weight = 5.0;
        let combiner = SignalCombiner::new(config, 0.35);
        for d1 in [-1.0, -0.3, 0.0, 0.6, 1.0] {
            for d2 in [-1.0, 0.0, 1.0] {
                for c in [0.0, 0.5, 1.0] {
                    let s = combiner.combine(make_layer1(d1, c), make_layer2(d2, 1.0 - c), Some(make_vwap(d2)), None, Utc::now());
                    assert!(s.composite_score.abs() <= 1.0);
                    assert!((0.0..=1.0).contains(&s.composite_confidence));
                }
            }
        }
    }
}
