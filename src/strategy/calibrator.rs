//! Bayesian confidence calibration
//!
//! Learns per-bot win rates for each (layer 1, layer 2) evidence pair and gates new
//! entries on the posterior win probability.
//!
//! - Evidence: each layer direction binned into five ordered categories
//! - Likelihood table: one record per (bot, l1, l2), only written on resolution
//! - Gate: fallback while history is scarce or the pair is unseen, otherwise the
//!   Laplace-smoothed pair rate shrunk toward the bot's recent global win rate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::config::BayesianConfig;
use crate::types::BotId;

/// Discretized layer direction.
///
/// Bucket lower bounds are inclusive: +0.5 is BULLISH_STRONG, +0.2 is BULLISH_WEAK,
/// −0.2 is NEUTRAL and −0.5 is BEARISH_WEAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceCategory {
    BearishStrong,
    BearishWeak,
    Neutral,
    BullishWeak,
    BullishStrong,
}

impl EvidenceCategory {
    pub const STRONG_BOUNDARY: f64 = 0.5;
    pub const WEAK_BOUNDARY: f64 = 0.2;

    pub fn from_direction(direction: f64) -> Self {
        if direction >= Self::STRONG_BOUNDARY {
            EvidenceCategory::BullishStrong
        } else if direction >= Self::WEAK_BOUNDARY {
            EvidenceCategory::BullishWeak
        } else if direction >= -Self::WEAK_BOUNDARY {
            EvidenceCategory::Neutral
        } else if direction >= -Self::STRONG_BOUNDARY {
            EvidenceCategory::BearishWeak
        } else {
            EvidenceCategory::BearishStrong
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceCategory::BearishStrong => "BEARISH_STRONG",
            EvidenceCategory::BearishWeak => "BEARISH_WEAK",
            EvidenceCategory::Neutral => "NEUTRAL",
            EvidenceCategory::BullishWeak => "BULLISH_WEAK",
            EvidenceCategory::BullishStrong => "BULLISH_STRONG",
        }
    }
}

impl fmt::Display for EvidenceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome counts for one evidence pair of one bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodRecord {
    pub bot_id: BotId,
    pub l1_evidence: EvidenceCategory,
    pub l2_evidence: EvidenceCategory,
    pub wins: u64,
    pub losses: u64,
    /// Always wins + losses
    pub total: u64,
    /// wins / total, 0 before the first outcome
    pub win_rate: f64,
    pub last_updated: DateTime<Utc>,
}

impl LikelihoodRecord {
    pub fn new(
        bot_id: BotId,
        l1_evidence: EvidenceCategory,
        l2_evidence: EvidenceCategory,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            bot_id,
            l1_evidence,
            l2_evidence,
            wins: 0,
            losses: 0,
            total: 0,
            win_rate: 0.0,
            last_updated: now,
        }
    }

    pub fn key(&self) -> (EvidenceCategory, EvidenceCategory) {
        (self.l1_evidence, self.l2_evidence)
    }

    fn record(&mut self, won: bool, now: DateTime<Utc>) {
        if won {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.total = self.wins + self.losses;
        self.win_rate = self.wins as f64 / self.total as f64;
        self.last_updated = now;
    }

    /// (wins + α) / (total + 2α)
    pub fn smoothed_win_rate(&self, alpha: f64) -> f64 {
        (self.wins as f64 + alpha) / (self.total as f64 + 2.0 * alpha)
    }
}

/// Why the gate stood aside
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackReason {
    Disabled,
    InsufficientHistory { observed: u64, required: u64 },
    UnseenEvidence,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Disabled => write!(f, "disabled"),
            FallbackReason::InsufficientHistory { observed, required } => {
                write!(f, "insufficient_history ({}/{})", observed, required)
            }
            FallbackReason::UnseenEvidence => write!(f, "unseen_evidence_combination"),
        }
    }
}

/// Result of the confidence gate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GateResult {
    Active { posterior: f64, prior: f64 },
    Fallback { reason: FallbackReason },
    Blocked { posterior: f64, prior: f64 },
}

impl GateResult {
    pub fn allows_trade(&self) -> bool {
        !matches!(self, GateResult::Blocked { .. })
    }

    pub fn posterior(&self) -> Option<f64> {
        match self {
            GateResult::Active { posterior, .. } | GateResult::Blocked { posterior, .. } => {
                Some(*posterior)
            }
            GateResult::Fallback { .. } => None,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            GateResult::Active { .. } => "active",
            GateResult::Fallback { .. } => "fallback",
            GateResult::Blocked { .. } => "blocked",
        }
    }
}

/// All likelihood records of one bot plus its recent outcome window
#[derive(Debug, Clone)]
pub struct LikelihoodTable {
    bot_id: BotId,
    records: HashMap<(EvidenceCategory, EvidenceCategory), LikelihoodRecord>,
    recent_outcomes: VecDeque<bool>,
    rolling_window: usize,
}

impl LikelihoodTable {
    pub fn new(bot_id: BotId, rolling_window: usize) -> Self {
        Self {
            bot_id,
            records: HashMap::new(),
            recent_outcomes: VecDeque::new(),
            rolling_window: rolling_window.max(1),
        }
    }

    /// Rebuild from persisted records and the most recent outcomes (oldest first).
    /// Records belonging to other bots are ignored.
    pub fn restore(
        bot_id: BotId,
        rolling_window: usize,
        records: Vec<LikelihoodRecord>,
        recent_outcomes: &[bool],
    ) -> Self {
        let mut table = Self::new(bot_id, rolling_window);
        for record in records.into_iter().filter(|r| r.bot_id == bot_id) {
            table.records.insert(record.key(), record);
        }
        for won in recent_outcomes {
            table.push_outcome(*won);
        }
        table
    }

    pub fn bot_id(&self) -> BotId {
        self.bot_id
    }

    pub fn get(&self, l1: EvidenceCategory, l2: EvidenceCategory) -> Option<&LikelihoodRecord> {
        self.records.get(&(l1, l2))
    }

    pub fn records(&self) -> impl Iterator<Item = &LikelihoodRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Resolved trades across all evidence pairs
    pub fn total_trades(&self) -> u64 {
        self.records.values().map(|r| r.total).sum()
    }

    /// Laplace-smoothed win rate over the rolling window; 0.5 with no history
    pub fn global_prior(&self, alpha: f64) -> f64 {
        if self.recent_outcomes.is_empty() {
            return 0.5;
        }
        let wins = self.recent_outcomes.iter().filter(|w| **w).count() as f64;
        (wins + alpha) / (self.recent_outcomes.len() as f64 + 2.0 * alpha)
    }

    pub fn set_rolling_window(&mut self, rolling_window: usize) {
        self.rolling_window = rolling_window.max(1);
        while self.recent_outcomes.len() > self.rolling_window {
            self.recent_outcomes.pop_front();
        }
    }

    /// Record a resolved trade for the exact evidence pair. Returns the updated record.
    pub fn record_outcome(
        &mut self,
        l1: EvidenceCategory,
        l2: EvidenceCategory,
        won: bool,
        now: DateTime<Utc>,
    ) -> LikelihoodRecord {
        let bot_id = self.bot_id;
        let record = self
            .records
            .entry((l1, l2))
            .or_insert_with(|| LikelihoodRecord::new(bot_id, l1, l2, now));
        record.record(won, now);
        let updated = record.clone();
        self.push_outcome(won);

        tracing::debug!(
            bot_id = bot_id,
            l1 = %l1,
            l2 = %l2,
            won = won,
            wins = updated.wins,
            total = updated.total,
            win_rate = updated.win_rate,
            "Likelihood record updated"
        );
        updated
    }

    fn push_outcome(&mut self, won: bool) {
        self.recent_outcomes.push_back(won);
        while self.recent_outcomes.len() > self.rolling_window {
            self.recent_outcomes.pop_front();
        }
    }
}

/// Confidence gate over a bot's likelihood table
#[derive(Debug, Clone)]
pub struct BayesianGate {
    config: BayesianConfig,
}

impl BayesianGate {
    pub fn new(config: BayesianConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(
        &self,
        table: &LikelihoodTable,
        l1: EvidenceCategory,
        l2: EvidenceCategory,
    ) -> GateResult {
        if !self.config.enabled {
            return GateResult::Fallback {
                reason: FallbackReason::Disabled,
            };
        }

        let observed = table.total_trades();
        if observed < self.config.min_sample_size {
            return GateResult::Fallback {
                reason: FallbackReason::InsufficientHistory {
                    observed,
                    required: self.config.min_sample_size,
                },
            };
        }

        let Some(record) = table.get(l1, l2).filter(|r| r.total > 0) else {
            return GateResult::Fallback {
                reason: FallbackReason::UnseenEvidence,
            };
        };

        let alpha = self.config.smoothing_alpha;
        let prior = table.global_prior(alpha);
        let pair_rate = record.smoothed_win_rate(alpha);
        let n = record.total as f64;
        let weight = n / (n + self.config.prior_strength.max(0.0));
        let posterior = (weight * pair_rate + (1.0 - weight) * prior).clamp(0.0, 1.0);

        if posterior < self.config.confidence_threshold {
            GateResult::Blocked { posterior, prior }
        } else {
            GateResult::Active { posterior, prior }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EvidenceCategory::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn seeded_table(pair: (EvidenceCategory, EvidenceCategory), wins: u64, losses: u64) -> LikelihoodTable {
        let mut table = LikelihoodTable::new(7, 100);
        for _ in 0..wins {
            table.record_outcome(pair.0, pair.1, true, now());
        }
        for _ in 0..losses {
            table.record_outcome(pair.0, pair.1, false, now());
        }
        table
    }

    #[test]
    fn test_binning_boundaries() {
        assert_eq!(EvidenceCategory::from_direction(0.5), BullishStrong);
        assert_eq!(EvidenceCategory::from_direction(0.4999), BullishWeak);
        assert_eq!(EvidenceCategory::from_direction(0.2), BullishWeak);
        assert_eq!(EvidenceCategory::from_direction(0.1999), Neutral);
        assert_eq!(EvidenceCategory::from_direction(0.0), Neutral);
        assert_eq!(EvidenceCategory::from_direction(-0.2), Neutral);
        assert_eq!(EvidenceCategory::from_direction(-0.2001), BearishWeak);
        assert_eq!(EvidenceCategory::from_direction(-0.5), BearishWeak);
        assert_eq!(EvidenceCategory::from_direction(-0.5001), BearishStrong);
        assert_eq!(EvidenceCategory::from_direction(1.0), BullishStrong);
        assert_eq!(EvidenceCategory::from_direction(-1.0), BearishStrong);
    }

    #[test]
    fn test_categories_are_ordered() {
        assert!(BearishStrong < BearishWeak);
        assert!(BearishWeak < Neutral);
        assert!(Neutral < BullishWeak);
        assert!(BullishWeak < BullishStrong);
        assert_eq!(
            serde_json::to_string(&BullishWeak).unwrap(),
            "\"BULLISH_WEAK\""
        );
    }

    #[test]
    fn test_record_counts_stay_consistent() {
        let mut table = LikelihoodTable::new(1, 100);
        for i in 0..9 {
            let rec = table.record_outcome(BullishWeak, BullishStrong, i % 3 != 0, now());
            assert_eq!(rec.total, rec.wins + rec.losses);
            assert_eq!(rec.win_rate, rec.wins as f64 / rec.total as f64);
        }
        let rec = table.get(BullishWeak, BullishStrong).unwrap();
        assert_eq!((rec.wins, rec.losses, rec.total), (6, 3, 9));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_identical_keys_never_duplicate() {
        let mut table = LikelihoodTable::new(1, 100);
        table.record_outcome(Neutral, Neutral, true, now());
        table.record_outcome(Neutral, Neutral, false, now());
        table.record_outcome(Neutral, BullishWeak, true, now());
        assert_eq!(table.len(), 2);
        assert_eq!(table.total_trades(), 3);
    }

    #[test]
    fn test_fallback_when_history_scarce_even_with_perfect_pair() {
        let table = seeded_table((BullishStrong, BullishStrong), 49, 0);
        let gate = BayesianGate::new(BayesianConfig::default());
        let result = gate.evaluate(&table, BullishStrong, BullishStrong);
        assert_eq!(
            result,
            GateResult::Fallback {
                reason: FallbackReason::InsufficientHistory {
                    observed: 49,
                    required: 50
                }
            }
        );
        assert!(result.allows_trade());
    }

    #[test]
    fn test_fallback_for_unseen_pair() {
        let table = seeded_table((BullishStrong, BullishStrong), 40, 20);
        let gate = BayesianGate::new(BayesianConfig::default());
        assert_eq!(
            gate.evaluate(&table, BearishWeak, Neutral),
            GateResult::Fallback {
                reason: FallbackReason::UnseenEvidence
            }
        );
    }

    #[test]
    fn test_blocks_losing_pair() {
        let mut table = seeded_table((BullishStrong, BullishStrong), 35, 15);
        for _ in 0..20 {
            table.record_outcome(BullishWeak, Neutral, false, now());
        }
        let gate = BayesianGate::new(BayesianConfig::default());
        match gate.evaluate(&table, BullishWeak, Neutral) {
            GateResult::Blocked { posterior, prior } => {
                assert!(posterior < 0.4);
                assert!(prior > posterior);
            }
            other => panic!("expected blocked, got {:?}", other),
        }
    }

    #[test]
    fn test_small_pair_sample_shrinks_toward_prior() {
        let mut table = seeded_table((BullishStrong, BullishStrong), 30, 30);
        table.record_outcome(BearishWeak, BearishWeak, false, now());
        let gate = BayesianGate::new(BayesianConfig::default());

        // One loss alone would give a posterior near 0.08; the prior keeps it near 0.5
        match gate.evaluate(&table, BearishWeak, BearishWeak) {
            GateResult::Active { posterior, .. } => {
                assert!(posterior > 0.4 && posterior < 0.5, "posterior = {}", posterior)
            }
            other => panic!("expected active, got {:?}", other),
        }
    }

    #[test]
    fn test_disabled_gate_falls_back() {
        let table = seeded_table((Neutral, Neutral), 0, 80);
        let gate = BayesianGate::new(BayesianConfig {
            enabled: false,
            ..BayesianConfig::default()
        });
        assert_eq!(
            gate.evaluate(&table, Neutral, Neutral),
            GateResult::Fallback {
                reason: FallbackReason::Disabled
            }
        );
    }

    #[test]
    fn test_rolling_prior_window() {
        let mut table = LikelihoodTable::new(1, 4);
        for won in [false, false, true, true, true, true] {
            table.record_outcome(Neutral, Neutral, won, now());
        }
        // Only the last four (all wins) count
        let prior = table.global_prior(0.1);
        assert!((prior - 4.1 / 4.2).abs() < 1e-12);
        assert_eq!(LikelihoodTable::new(1, 4).global_prior(0.1), 0.5);
    }

    #[test]
    fn test_restore_filters_other_bots() {
        let mine = LikelihoodRecord::new(3, Neutral, Neutral, now());
        let theirs = LikelihoodRecord::new(4, Neutral, BullishWeak, now());
        let table = LikelihoodTable::restore(3, 100, vec![mine, theirs], &[true, false]);
        assert_eq!(table.len(), 1);
        assert!((table.global_prior(0.1) - 0.5).abs() < 1e-12);
    }
}
