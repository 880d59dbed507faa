//! Persistence Module
//!
//! Per-bot durable state behind one async trait:
//! - Likelihood records for the Bayesian gate
//! - Append-only trade log (also the source of recent outcomes)
//! - Risk state
//! - Bot records: configuration profile, status and last error
//!
//! `FilePersistence` keeps JSON state files and a CSV trade log under
//! `<data_dir>/bots/<bot_id>/`; `MemoryPersistence` backs tests and dry setups.

mod file;
mod memory;

pub use file::FilePersistence;
pub use memory::MemoryPersistence;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ConfigProfile;
use crate::risk::RiskState;
use crate::strategy::LikelihoodRecord;
use crate::types::{BotId, BotStatus, Trade, TradeResult};

/// Persisted identity and lifecycle of a bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotRecord {
    pub bot_id: BotId,
    pub name: String,
    pub profile: ConfigProfile,
    /// Last status the bot reported
    pub status: BotStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl BotRecord {
    pub fn new(bot_id: BotId, name: impl Into<String>, profile: ConfigProfile) -> Self {
        Self {
            bot_id,
            name: name.into(),
            profile,
            status: BotStatus::Stopped,
            last_error: None,
        }
    }

    /// Whether a restart should bring this bot back up
    pub fn should_resume(&self) -> bool {
        self.status.is_active()
    }
}

/// Storage for every piece of per-bot state
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn upsert_likelihood(&self, record: &LikelihoodRecord) -> Result<()>;

    async fn load_likelihoods(&self, bot_id: BotId) -> Result<Vec<LikelihoodRecord>>;

    async fn append_trade(&self, trade: &Trade) -> Result<()>;

    /// Win flags of the last `limit` trades, oldest first
    async fn recent_outcomes(&self, bot_id: BotId, limit: usize) -> Result<Vec<bool>>;

    async fn load_risk_state(&self, bot_id: BotId) -> Result<Option<RiskState>>;

    async fn save_risk_state(&self, state: &RiskState) -> Result<()>;

    async fn load_bot_record(&self, bot_id: BotId) -> Result<Option<BotRecord>>;

    async fn save_bot_record(&self, record: &BotRecord) -> Result<()>;

    async fn list_bot_records(&self) -> Result<Vec<BotRecord>>;
}

fn is_win(trade: &Trade) -> bool {
    trade.result == TradeResult::Win
}

/// Last `limit` win flags, oldest first
fn tail_outcomes<'a>(trades: impl DoubleEndedIterator<Item = &'a Trade>, limit: usize) -> Vec<bool> {
    let mut recent: Vec<bool> = trades.rev().take(limit).map(is_win).collect();
    recent.reverse();
    recent
}
